// =============================================================================
// ExecutionLog — append-only record of executed (or failed) actions
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Newest entries retained in the `executionLogs` collection.
pub const EXECUTION_LOGS_RING: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: String,
    pub sector_id: String,
    pub timestamp: DateTime<Utc>,
    /// Action wire form ("BUY", "SELL", ...), or a failure marker.
    pub action: String,
    /// Price impact as a percentage of the previous price.
    pub impact: f64,
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub manager_id: Option<String>,
}

impl ExecutionLog {
    pub fn new(
        sector_id: impl Into<String>,
        action: impl Into<String>,
        impact: f64,
        item_id: Option<String>,
        manager_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sector_id: sector_id.into(),
            timestamp: Utc::now(),
            action: action.into(),
            impact,
            item_id,
            manager_id,
        }
    }
}

/// Evict oldest entries past the ring cap. Called inside the collection
/// write that appends.
pub fn enforce_ring(logs: &mut Vec<ExecutionLog>) {
    if logs.len() > EXECUTION_LOGS_RING {
        let excess = logs.len() - EXECUTION_LOGS_RING;
        logs.drain(0..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_newest() {
        let mut logs: Vec<ExecutionLog> = (0..EXECUTION_LOGS_RING + 5)
            .map(|i| ExecutionLog::new("s1", "BUY", i as f64, None, None))
            .collect();
        enforce_ring(&mut logs);
        assert_eq!(logs.len(), EXECUTION_LOGS_RING);
        assert!((logs[0].impact - 5.0).abs() < 1e-9);
    }

    #[test]
    fn serde_roundtrip() {
        let log = ExecutionLog::new("s1", "SELL", -0.2, Some("item-1".into()), None);
        let json = serde_json::to_string(&log).unwrap();
        let back: ExecutionLog = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, log.id);
        assert_eq!(back.action, "SELL");
        assert_eq!(back.item_id.as_deref(), Some("item-1"));
    }
}
