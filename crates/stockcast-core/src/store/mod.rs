//! Key-value record store.
//!
//! Tables are keyed by a partition key and an optional sort key. Items are JSON
//! objects; the DynamoDB backend maps them onto attribute values.

pub mod memory;

#[cfg(feature = "dynamodb-backend")]
pub mod dynamo;

use serde_json::Value;

use crate::config::{Config, TablesConfig};
use crate::error::StoreError;

pub use memory::MemoryRecordStore;

/// A stored record (or a key, which is the subset of key attributes).
pub type Item = serde_json::Map<String, Value>;

/// Precondition for a put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutCondition {
    /// Unconditional overwrite.
    Always,
    /// Succeeds only if no item with this key exists. The attribute named is
    /// the partition key of the table.
    IfNotExists(String),
}

/// Partition query.
#[derive(Debug, Clone)]
pub struct Query {
    pub partition_key: String,
    pub partition_value: Value,
    pub limit: Option<usize>,
    /// Descending sort-key order.
    pub newest_first: bool,
}

impl Query {
    pub fn partition(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            partition_key: key.into(),
            partition_value: value.into(),
            limit: None,
            newest_first: false,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }
}

/// Key layout of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub partition_key: String,
    pub sort_key: Option<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition_key: partition_key.into(),
            sort_key: None,
        }
    }

    pub fn with_sort_key(mut self, sort_key: impl Into<String>) -> Self {
        self.sort_key = Some(sort_key.into());
        self
    }
}

/// Trait for record storage backends.
///
/// Calls are blocking. Implementations must be safe to share across request
/// workers.
pub trait RecordStore: Send + Sync {
    /// Strongly-consistent point read.
    fn get(&self, table: &str, key: &Item) -> Result<Option<Item>, StoreError>;

    /// Write a whole item, subject to `condition`.
    fn put(&self, table: &str, item: Item, condition: PutCondition) -> Result<(), StoreError>;

    /// Set attributes on an item, creating it if absent.
    fn update(&self, table: &str, key: &Item, set: Item) -> Result<(), StoreError>;

    /// Delete an item. Deleting an absent item is not an error.
    fn delete(&self, table: &str, key: &Item) -> Result<(), StoreError>;

    /// Items of one partition, ordered by sort key.
    fn query(&self, table: &str, query: &Query) -> Result<Vec<Item>, StoreError>;

    /// Every item of a table.
    fn scan(&self, table: &str) -> Result<Vec<Item>, StoreError>;

    /// Create the table if it does not exist yet.
    fn ensure_table(&self, schema: &TableSchema) -> Result<(), StoreError>;
}

/// Build a single-attribute key.
pub fn key(attr: &str, value: impl Into<Value>) -> Item {
    let mut item = Item::new();
    item.insert(attr.to_string(), value.into());
    item
}

/// Build a partition + sort key.
pub fn compound_key(
    partition: (&str, impl Into<Value>),
    sort: (&str, impl Into<Value>),
) -> Item {
    let mut item = key(partition.0, partition.1);
    item.insert(sort.0.to_string(), sort.1.into());
    item
}

/// Read a string attribute.
pub fn get_str<'a>(item: &'a Item, attr: &str) -> Option<&'a str> {
    item.get(attr).and_then(|v| v.as_str())
}

/// Read a numeric attribute; numbers stored as strings are accepted.
pub fn get_f64(item: &Item, attr: &str) -> Option<f64> {
    match item.get(attr)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Schemas of every table the application uses.
pub fn app_tables(config: &Config) -> Vec<TableSchema> {
    let TablesConfig {
        users,
        user_activities,
        predictions,
        news_cache,
        sentiment_cache,
    } = &config.tables;

    vec![
        TableSchema::new(&config.session.table_name, crate::session::SESSION_KEY_ATTR),
        TableSchema::new(users, "username"),
        TableSchema::new(user_activities, "UserId").with_sort_key("Timestamp"),
        TableSchema::new(predictions, "UserId").with_sort_key("Timestamp"),
        TableSchema::new(news_cache, "Company"),
        TableSchema::new(sentiment_cache, "Company"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_builders() {
        let k = key("username", "alice");
        assert_eq!(Value::Object(k), json!({"username": "alice"}));

        let k = compound_key(("UserId", "alice"), ("Timestamp", "2024-01-01T00:00:00Z"));
        assert_eq!(k.len(), 2);
        assert_eq!(get_str(&k, "Timestamp"), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_get_f64_accepts_strings() {
        let mut item = Item::new();
        item.insert("a".into(), json!(0.9));
        item.insert("b".into(), json!("0.1"));
        item.insert("c".into(), json!(true));
        assert_eq!(get_f64(&item, "a"), Some(0.9));
        assert_eq!(get_f64(&item, "b"), Some(0.1));
        assert_eq!(get_f64(&item, "c"), None);
        assert_eq!(get_f64(&item, "missing"), None);
    }

    #[test]
    fn test_app_tables() {
        let cfg = Config::default();
        let tables = app_tables(&cfg);
        assert_eq!(tables.len(), 6);
        let sessions = tables.iter().find(|t| t.name == "Sessions").unwrap();
        assert_eq!(sessions.partition_key, "session_key");
        assert!(sessions.sort_key.is_none());
        let activities = tables.iter().find(|t| t.name == "UserActivities").unwrap();
        assert_eq!(activities.sort_key.as_deref(), Some("Timestamp"));
    }
}
