use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use crate::error::StoreError;
use crate::store::{Item, PutCondition, Query, RecordStore};
use crate::util::{format_timestamp, Clock, SystemClock};

/// Activity names written by the web layer.
pub mod kinds {
    pub const LOGIN: &str = "Login";
    pub const LOGOUT: &str = "Logout";
    pub const DASHBOARD: &str = "AccessedDashboard";
}

/// One row of the activity table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Activity {
    pub user_id: String,
    pub timestamp: String,
    pub activity: String,
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(default)]
    pub user_agent: String,
}

/// Append-only per-user activity log.
#[derive(Clone)]
pub struct ActivityLog {
    store: Arc<dyn RecordStore>,
    table: String,
    clock: Arc<dyn Clock>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn RecordStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Write an activity row. Failures are logged, never returned.
    pub fn record(&self, user: &str, activity: &str, ip: &str, user_agent: &str) {
        let row = Activity {
            user_id: user.to_string(),
            timestamp: format_timestamp(self.clock.now()),
            activity: activity.to_string(),
            ip_address: ip.to_string(),
            user_agent: user_agent.to_string(),
        };
        let item = match serde_json::to_value(&row) {
            Ok(Value::Object(map)) => map,
            _ => return,
        };
        if let Err(e) = self.store.put(&self.table, item, PutCondition::Always) {
            error!("Error logging user activity: {}", e);
        }
    }

    /// Most recent activities first.
    pub fn recent(&self, user: &str, limit: usize) -> Result<Vec<Activity>, StoreError> {
        let items = self.store.query(
            &self.table,
            &Query::partition("UserId", user).newest_first().limit(limit),
        )?;
        Ok(items.into_iter().filter_map(decode).collect())
    }
}

fn decode(item: Item) -> Option<Activity> {
    match serde_json::from_value(Value::Object(item)) {
        Ok(activity) => Some(activity),
        Err(e) => {
            warn!("Skipping malformed activity row: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryRecordStore, TableSchema};
    use crate::util::ManualClock;
    use chrono::Duration;

    fn log() -> (Arc<MemoryRecordStore>, Arc<ManualClock>, ActivityLog) {
        let store = Arc::new(MemoryRecordStore::with_tables(&[TableSchema::new(
            "UserActivities",
            "UserId",
        )
        .with_sort_key("Timestamp")]));
        let clock = Arc::new(ManualClock::default());
        let log = ActivityLog::new(store.clone(), "UserActivities").with_clock(clock.clone());
        (store, clock, log)
    }

    #[test]
    fn test_recent_is_newest_first() {
        let (_, clock, log) = log();
        for activity in [kinds::LOGIN, kinds::DASHBOARD, kinds::LOGOUT] {
            log.record("alice", activity, "127.0.0.1", "test-agent");
            clock.advance(Duration::seconds(1));
        }
        log.record("bob", kinds::LOGIN, "", "");

        let recent = log.recent("alice", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].activity, kinds::LOGOUT);
        assert_eq!(recent[1].activity, kinds::DASHBOARD);
        assert_eq!(recent[0].ip_address, "127.0.0.1");
    }

    #[test]
    fn test_record_swallows_failures() {
        let (store, _, log) = log();
        store.set_available(false);
        log.record("alice", kinds::LOGIN, "", "");
        assert!(log.recent("alice", 10).is_err());

        store.set_available(true);
        assert!(log.recent("alice", 10).unwrap().is_empty());
    }

    #[test]
    fn test_row_attribute_names() {
        let (store, _, log) = log();
        log.record("alice", kinds::LOGIN, "10.0.0.1", "ua");
        let rows = store.scan("UserActivities").unwrap();
        assert_eq!(rows.len(), 1);
        for attr in ["UserId", "Timestamp", "Activity", "IPAddress", "UserAgent"] {
            assert!(rows[0].contains_key(attr), "missing {attr}");
        }
    }
}
