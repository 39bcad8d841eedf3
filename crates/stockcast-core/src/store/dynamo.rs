use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType,
};
use aws_sdk_dynamodb::Client;
use base64::Engine;
use serde_json::{Number, Value};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{Item, PutCondition, Query, RecordStore, TableSchema};
use crate::config::AwsConfig;
use crate::error::StoreError;

type AttrMap = HashMap<String, AttributeValue>;

static SHARED_CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Process-wide DynamoDB client, built on first use and cloned afterwards.
///
/// The client is a cheap handle over a shared connection pool.
pub async fn shared_client(config: &AwsConfig) -> Client {
    SHARED_CLIENT
        .get_or_init(|| build_client(config))
        .await
        .clone()
}

async fn build_client(config: &AwsConfig) -> Client {
    let timeouts = TimeoutConfig::builder()
        .operation_timeout(Duration::from_secs(config.timeout_secs))
        .build();

    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .timeout_config(timeouts);
    if let Some(endpoint) = &config.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }

    let sdk_config = loader.load().await;
    info!(
        "DynamoDB client ready (region: {}, endpoint: {})",
        config.region,
        config.endpoint_url.as_deref().unwrap_or("default")
    );
    Client::new(&sdk_config)
}

/// Record store backed by DynamoDB.
#[derive(Clone)]
pub struct DynamoRecordStore {
    client: Client,
}

impl DynamoRecordStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(config: &AwsConfig) -> Self {
        Self::new(shared_client(config).await)
    }

    fn run_blocking<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        block_on(fut)
    }
}

/// Drive an SDK future to completion from synchronous code, reusing the
/// ambient runtime.
///
/// On a multi-thread runtime this may be called from a worker (via
/// `block_in_place`) or from a `spawn_blocking` thread. On a `current_thread`
/// runtime it must be called from `spawn_blocking`: the runtime thread is the
/// only one driving I/O, and blocking it on its own work would stall (tokio
/// panics instead).
fn block_on<T, F>(fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    let handle = Handle::try_current()
        .map_err(|_| StoreError::Unavailable("no tokio runtime available".to_string()))?;

    match handle.runtime_flavor() {
        RuntimeFlavor::CurrentThread => handle.block_on(fut),
        _ => tokio::task::block_in_place(|| handle.block_on(fut)),
    }
}

fn classify<E, R>(op: &str, err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = err.code().unwrap_or_default().to_string();
    let message = format!("{op}: {}", DisplayErrorContext(&err));
    match code.as_str() {
        "ConditionalCheckFailedException" => StoreError::Conflict(message),
        "ResourceNotFoundException" => StoreError::NotFound(message),
        "ValidationException" => StoreError::Invalid(message),
        _ => {
            warn!("DynamoDB {} error: {}", op, message);
            StoreError::Unavailable(message)
        }
    }
}

fn to_attr(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(to_attr).collect()),
        Value::Object(map) => AttributeValue::M(to_attr_map(map)),
    }
}

fn to_attr_map(item: &Item) -> AttrMap {
    item.iter().map(|(k, v)| (k.clone(), to_attr(v))).collect()
}

fn parse_number(raw: &str) -> Result<Value, StoreError> {
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Value::Number(i.into()));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| StoreError::DecodeFailure(format!("bad number attribute: {raw}")))
}

fn blob_to_value(blob: &Blob) -> Value {
    Value::String(base64::engine::general_purpose::STANDARD.encode(blob.as_ref()))
}

fn from_attr(attr: &AttributeValue) -> Result<Value, StoreError> {
    Ok(match attr {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => parse_number(n)?,
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::L(items) => {
            Value::Array(items.iter().map(from_attr).collect::<Result<_, _>>()?)
        }
        AttributeValue::M(map) => Value::Object(from_attr_map(map)?),
        AttributeValue::Ss(items) => {
            Value::Array(items.iter().cloned().map(Value::String).collect())
        }
        AttributeValue::Ns(items) => {
            Value::Array(items.iter().map(|n| parse_number(n)).collect::<Result<_, _>>()?)
        }
        AttributeValue::B(blob) => blob_to_value(blob),
        AttributeValue::Bs(blobs) => Value::Array(blobs.iter().map(blob_to_value).collect()),
        other => {
            return Err(StoreError::DecodeFailure(format!(
                "unsupported attribute type: {other:?}"
            )))
        }
    })
}

fn from_attr_map(map: &AttrMap) -> Result<Item, StoreError> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), from_attr(v)?)))
        .collect()
}

fn key_element(name: &str, key_type: KeyType) -> Result<KeySchemaElement, StoreError> {
    KeySchemaElement::builder()
        .attribute_name(name)
        .key_type(key_type)
        .build()
        .map_err(|e| StoreError::Invalid(e.to_string()))
}

fn string_attribute(name: &str) -> Result<AttributeDefinition, StoreError> {
    AttributeDefinition::builder()
        .attribute_name(name)
        .attribute_type(ScalarAttributeType::S)
        .build()
        .map_err(|e| StoreError::Invalid(e.to_string()))
}

impl RecordStore for DynamoRecordStore {
    fn get(&self, table: &str, key: &Item) -> Result<Option<Item>, StoreError> {
        let client = self.client.clone();
        let table = table.to_string();
        let key = to_attr_map(key);

        self.run_blocking(async move {
            let output = client
                .get_item()
                .table_name(&table)
                .set_key(Some(key))
                .consistent_read(true)
                .send()
                .await
                .map_err(|e| classify("get_item", e))?;

            output.item.as_ref().map(from_attr_map).transpose()
        })
    }

    fn put(&self, table: &str, item: Item, condition: PutCondition) -> Result<(), StoreError> {
        let client = self.client.clone();
        let table = table.to_string();
        let item = to_attr_map(&item);

        self.run_blocking(async move {
            let mut request = client.put_item().table_name(&table).set_item(Some(item));
            if let PutCondition::IfNotExists(attr) = condition {
                request = request
                    .condition_expression("attribute_not_exists(#k)")
                    .expression_attribute_names("#k", attr);
            }
            request.send().await.map_err(|e| classify("put_item", e))?;
            Ok(())
        })
    }

    fn update(&self, table: &str, key: &Item, set: Item) -> Result<(), StoreError> {
        let client = self.client.clone();
        let table = table.to_string();
        let key = to_attr_map(key);

        self.run_blocking(async move {
            let mut request = client.update_item().table_name(&table).set_key(Some(key));
            if !set.is_empty() {
                let mut clauses = Vec::with_capacity(set.len());
                for (i, (attr, value)) in set.iter().enumerate() {
                    clauses.push(format!("#a{i} = :v{i}"));
                    request = request
                        .expression_attribute_names(format!("#a{i}"), attr)
                        .expression_attribute_values(format!(":v{i}"), to_attr(value));
                }
                request = request.update_expression(format!("SET {}", clauses.join(", ")));
            }
            request.send().await.map_err(|e| classify("update_item", e))?;
            Ok(())
        })
    }

    fn delete(&self, table: &str, key: &Item) -> Result<(), StoreError> {
        let client = self.client.clone();
        let table = table.to_string();
        let key = to_attr_map(key);

        self.run_blocking(async move {
            client
                .delete_item()
                .table_name(&table)
                .set_key(Some(key))
                .send()
                .await
                .map_err(|e| classify("delete_item", e))?;
            Ok(())
        })
    }

    fn query(&self, table: &str, query: &Query) -> Result<Vec<Item>, StoreError> {
        let client = self.client.clone();
        let table = table.to_string();
        let query = query.clone();

        self.run_blocking(async move {
            let mut items = Vec::new();
            let mut start_key: Option<AttrMap> = None;
            loop {
                let mut request = client
                    .query()
                    .table_name(&table)
                    .key_condition_expression("#pk = :pk")
                    .expression_attribute_names("#pk", &query.partition_key)
                    .expression_attribute_values(":pk", to_attr(&query.partition_value))
                    .scan_index_forward(!query.newest_first)
                    .consistent_read(true)
                    .set_exclusive_start_key(start_key.take());
                if let Some(limit) = query.limit {
                    let remaining = limit.saturating_sub(items.len());
                    request = request.limit(i32::try_from(remaining).unwrap_or(i32::MAX));
                }

                let output = request.send().await.map_err(|e| classify("query", e))?;
                for item in output.items() {
                    items.push(from_attr_map(item)?);
                }

                let done = query.limit.is_some_and(|l| items.len() >= l);
                match output.last_evaluated_key {
                    Some(next) if !done => start_key = Some(next),
                    _ => break,
                }
            }
            if let Some(limit) = query.limit {
                items.truncate(limit);
            }
            Ok(items)
        })
    }

    fn scan(&self, table: &str) -> Result<Vec<Item>, StoreError> {
        let client = self.client.clone();
        let table = table.to_string();

        self.run_blocking(async move {
            let mut items = Vec::new();
            let mut start_key: Option<AttrMap> = None;
            loop {
                let output = client
                    .scan()
                    .table_name(&table)
                    .set_exclusive_start_key(start_key.take())
                    .send()
                    .await
                    .map_err(|e| classify("scan", e))?;
                for item in output.items() {
                    items.push(from_attr_map(item)?);
                }
                match output.last_evaluated_key {
                    Some(next) => start_key = Some(next),
                    None => break,
                }
            }
            debug!("Scanned {} items from {}", items.len(), table);
            Ok(items)
        })
    }

    fn ensure_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let client = self.client.clone();
        let schema = schema.clone();

        self.run_blocking(async move {
            let mut request = client
                .create_table()
                .table_name(&schema.name)
                .billing_mode(BillingMode::PayPerRequest)
                .attribute_definitions(string_attribute(&schema.partition_key)?)
                .key_schema(key_element(&schema.partition_key, KeyType::Hash)?);
            if let Some(sort_key) = &schema.sort_key {
                request = request
                    .attribute_definitions(string_attribute(sort_key)?)
                    .key_schema(key_element(sort_key, KeyType::Range)?);
            }

            match request.send().await {
                Ok(_) => {
                    info!("Created table {}", schema.name);
                    Ok(())
                }
                Err(e) if e.code() == Some("ResourceInUseException") => {
                    debug!("Table {} already exists", schema.name);
                    Ok(())
                }
                Err(e) => Err(classify("create_table", e)),
            }
        })
    }
}
