use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tracing::debug;

use super::{Item, PutCondition, Query, RecordStore, TableSchema};
use crate::error::StoreError;

struct MemoryTable {
    schema: TableSchema,
    /// (partition, sort) -> item; sort is empty for hash-only tables.
    rows: BTreeMap<(String, String), Item>,
}

impl MemoryTable {
    fn row_key(&self, item: &Item) -> Result<(String, String), StoreError> {
        let partition = item.get(&self.schema.partition_key).ok_or_else(|| {
            StoreError::Invalid(format!(
                "missing key attribute {} for table {}",
                self.schema.partition_key, self.schema.name
            ))
        })?;
        let sort = match &self.schema.sort_key {
            Some(attr) => {
                let value = item.get(attr).ok_or_else(|| {
                    StoreError::Invalid(format!(
                        "missing key attribute {} for table {}",
                        attr, self.schema.name
                    ))
                })?;
                key_component(value)
            }
            None => String::new(),
        };
        Ok((key_component(partition), sort))
    }
}

fn key_component(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// In-process record store.
///
/// Used for local runs and tests. `set_available(false)` makes every call fail
/// with `StoreError::Unavailable`, which is how outages are simulated.
pub struct MemoryRecordStore {
    tables: Mutex<HashMap<String, MemoryTable>>,
    available: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            puts: AtomicUsize::new(0),
        }
    }

    /// Create a store with the given tables already present.
    pub fn with_tables(schemas: &[TableSchema]) -> Self {
        let store = Self::new();
        {
            let mut tables = store.lock();
            for schema in schemas {
                tables.insert(
                    schema.name.clone(),
                    MemoryTable {
                        schema: schema.clone(),
                        rows: BTreeMap::new(),
                    },
                );
            }
        }
        store
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of put attempts, including rejected ones.
    pub fn put_attempts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of items in a table, ignoring any expiry attributes.
    pub fn len(&self, table: &str) -> usize {
        self.lock().get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryTable>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

fn table_mut<'a>(
    tables: &'a mut HashMap<String, MemoryTable>,
    name: &str,
) -> Result<&'a mut MemoryTable, StoreError> {
    tables
        .get_mut(name)
        .ok_or_else(|| StoreError::NotFound(format!("table {name}")))
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, table: &str, key: &Item) -> Result<Option<Item>, StoreError> {
        self.check_available()?;
        let mut tables = self.lock();
        let table = table_mut(&mut tables, table)?;
        let row_key = table.row_key(key)?;
        Ok(table.rows.get(&row_key).cloned())
    }

    fn put(&self, table: &str, item: Item, condition: PutCondition) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut tables = self.lock();
        let table = table_mut(&mut tables, table)?;
        let row_key = table.row_key(&item)?;

        if let PutCondition::IfNotExists(attr) = &condition {
            let existing = table.rows.get(&row_key);
            if existing.is_some_and(|row| row.contains_key(attr)) {
                debug!("Conditional put rejected in {}: {:?}", table.schema.name, row_key);
                return Err(StoreError::Conflict(format!(
                    "{} already exists in {}",
                    row_key.0, table.schema.name
                )));
            }
        }

        table.rows.insert(row_key, item);
        Ok(())
    }

    fn update(&self, table: &str, key: &Item, set: Item) -> Result<(), StoreError> {
        self.check_available()?;
        let mut tables = self.lock();
        let table = table_mut(&mut tables, table)?;
        let row_key = table.row_key(key)?;
        let row = table.rows.entry(row_key).or_insert_with(|| key.clone());
        for (attr, value) in set {
            row.insert(attr, value);
        }
        Ok(())
    }

    fn delete(&self, table: &str, key: &Item) -> Result<(), StoreError> {
        self.check_available()?;
        let mut tables = self.lock();
        let table = table_mut(&mut tables, table)?;
        let row_key = table.row_key(key)?;
        table.rows.remove(&row_key);
        Ok(())
    }

    fn query(&self, table: &str, query: &Query) -> Result<Vec<Item>, StoreError> {
        self.check_available()?;
        let mut tables = self.lock();
        let table = table_mut(&mut tables, table)?;
        if query.partition_key != table.schema.partition_key {
            return Err(StoreError::Invalid(format!(
                "{} is not the partition key of {}",
                query.partition_key, table.schema.name
            )));
        }

        let partition = key_component(&query.partition_value);
        let rows = table
            .rows
            .iter()
            .filter(|((pk, _), _)| *pk == partition)
            .map(|(_, item)| item.clone());

        let mut items: Vec<Item> = if query.newest_first {
            rows.rev().collect()
        } else {
            rows.collect()
        };
        if let Some(limit) = query.limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    fn scan(&self, table: &str) -> Result<Vec<Item>, StoreError> {
        self.check_available()?;
        let mut tables = self.lock();
        let table = table_mut(&mut tables, table)?;
        Ok(table.rows.values().cloned().collect())
    }

    fn ensure_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock()
            .entry(schema.name.clone())
            .or_insert_with(|| MemoryTable {
                schema: schema.clone(),
                rows: BTreeMap::new(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{compound_key, key};
    use serde_json::json;

    fn users_store() -> MemoryRecordStore {
        MemoryRecordStore::with_tables(&[
            TableSchema::new("Users", "username"),
            TableSchema::new("Activities", "UserId").with_sort_key("Timestamp"),
        ])
    }

    fn item(value: serde_json::Value) -> Item {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_put_and_get() {
        let store = users_store();
        store
            .put("Users", item(json!({"username": "alice", "email": "a@x"})), PutCondition::Always)
            .unwrap();

        let found = store.get("Users", &key("username", "alice")).unwrap().unwrap();
        assert_eq!(found.get("email"), Some(&json!("a@x")));
        assert!(store.get("Users", &key("username", "bob")).unwrap().is_none());
    }

    #[test]
    fn test_conditional_put_conflict_keeps_original() {
        let store = users_store();
        let cond = PutCondition::IfNotExists("username".into());
        store
            .put("Users", item(json!({"username": "alice", "email": "first"})), cond.clone())
            .unwrap();

        let err = store
            .put("Users", item(json!({"username": "alice", "email": "second"})), cond)
            .unwrap_err();
        assert!(err.is_conflict());

        let found = store.get("Users", &key("username", "alice")).unwrap().unwrap();
        assert_eq!(found.get("email"), Some(&json!("first")));
        assert_eq!(store.put_attempts(), 2);
    }

    #[test]
    fn test_update_creates_and_merges() {
        let store = users_store();
        let k = key("username", "carol");
        store.update("Users", &k, item(json!({"last_login": "now"}))).unwrap();
        store.update("Users", &k, item(json!({"is_active": false}))).unwrap();

        let found = store.get("Users", &k).unwrap().unwrap();
        assert_eq!(found.get("username"), Some(&json!("carol")));
        assert_eq!(found.get("last_login"), Some(&json!("now")));
        assert_eq!(found.get("is_active"), Some(&json!(false)));
    }

    #[test]
    fn test_delete_absent_is_ok() {
        let store = users_store();
        store.delete("Users", &key("username", "nobody")).unwrap();
    }

    #[test]
    fn test_query_orders_by_sort_key() {
        let store = users_store();
        for ts in ["2024-01-02", "2024-01-01", "2024-01-03"] {
            store
                .put(
                    "Activities",
                    item(json!({"UserId": "alice", "Timestamp": ts})),
                    PutCondition::Always,
                )
                .unwrap();
        }
        store
            .put(
                "Activities",
                item(json!({"UserId": "bob", "Timestamp": "2024-01-04"})),
                PutCondition::Always,
            )
            .unwrap();

        let q = Query::partition("UserId", "alice");
        let asc = store.query("Activities", &q).unwrap();
        let stamps: Vec<_> = asc.iter().map(|i| i["Timestamp"].as_str().unwrap()).collect();
        assert_eq!(stamps, vec!["2024-01-01", "2024-01-02", "2024-01-03"]);

        let desc = store.query("Activities", &q.newest_first().limit(2)).unwrap();
        let stamps: Vec<_> = desc.iter().map(|i| i["Timestamp"].as_str().unwrap()).collect();
        assert_eq!(stamps, vec!["2024-01-03", "2024-01-02"]);
    }

    #[test]
    fn test_compound_key_get() {
        let store = users_store();
        store
            .put(
                "Activities",
                item(json!({"UserId": "alice", "Timestamp": "t1", "Activity": "Login"})),
                PutCondition::Always,
            )
            .unwrap();
        let found = store
            .get("Activities", &compound_key(("UserId", "alice"), ("Timestamp", "t1")))
            .unwrap()
            .unwrap();
        assert_eq!(found["Activity"], json!("Login"));
    }

    #[test]
    fn test_missing_table_and_key_attr() {
        let store = users_store();
        let err = store.get("Nope", &key("username", "a")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let err = store
            .put("Users", item(json!({"email": "x"})), PutCondition::Always)
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn test_unavailable() {
        let store = users_store();
        store.set_available(false);
        let err = store.get("Users", &key("username", "a")).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.delete("Users", &key("username", "a")).is_err());

        store.set_available(true);
        assert!(store.get("Users", &key("username", "a")).unwrap().is_none());
    }

    #[test]
    fn test_ensure_table_is_idempotent() {
        let store = MemoryRecordStore::new();
        let schema = TableSchema::new("Sessions", "session_key");
        store.ensure_table(&schema).unwrap();
        store
            .put("Sessions", item(json!({"session_key": "k"})), PutCondition::Always)
            .unwrap();
        store.ensure_table(&schema).unwrap();
        assert_eq!(store.len("Sessions"), 1);
    }
}
