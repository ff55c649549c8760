// =============================================================================
// Central application state — Concord sector engine
// =============================================================================
//
// Ties the storage facade, runtime configuration, and candle feed together
// and provides the serialisable snapshot for the dashboard API.
//
// Thread safety:
//   - AtomicU64 for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::CoreResult;
use crate::market_data::SharedCandleFeed;
use crate::model::{Agent, Discussion, ExecutionLog, Sector};
use crate::runtime_config::RuntimeConfig;
use crate::storage::{collections, KeyedStore};
use crate::types::{DiscussionStatus, SystemMode};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// Execution logs included in a snapshot.
const SNAPSHOT_LOG_TAIL: usize = 50;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Central application state shared across all async tasks.
pub struct AppState {
    /// Monotonically increasing version counter, incremented on every
    /// meaningful state mutation.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub store: Arc<KeyedStore>,
    pub feed: SharedCandleFeed,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Instant the engine was started; used for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<KeyedStore>,
        feed: SharedCandleFeed,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            store,
            feed,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error logging ───────────────────────────────────────────────────

    /// Record an error. The ring is capped at [`MAX_RECENT_ERRORS`].
    pub fn push_error(&self, msg: String) {
        let record = ErrorRecord {
            message: msg,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Build a complete, serialisable snapshot of the engine state for the
    /// dashboard `GET /api/v1/state` endpoint.
    pub async fn build_snapshot(&self) -> CoreResult<StateSnapshot> {
        let sectors: Vec<Sector> = self.store.read(collections::SECTORS).await?;
        let agents: Vec<Agent> = self.store.read(collections::AGENTS).await?;
        let discussions: Vec<Discussion> = self.store.read(collections::DISCUSSIONS).await?;
        let logs: Vec<ExecutionLog> = self.store.read(collections::EXECUTION_LOGS).await?;

        let mode = self.runtime_config.read().mode;

        let sector_summaries = sectors
            .iter()
            .map(|s| {
                let sector_agents: Vec<&Agent> =
                    agents.iter().filter(|a| a.sector_id == s.id).collect();
                SectorSummary {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    symbol: s.symbol.clone(),
                    balance: s.balance,
                    position: s.position,
                    current_price: s.current_price,
                    change_percent: s.change_percent,
                    agent_count: sector_agents.len(),
                    pending_executions: s.execution_queue.len(),
                    in_cooldown: s.in_cooldown(Utc::now()),
                    active_discussion_id: discussions
                        .iter()
                        .find(|d| d.sector_id == s.id && d.is_in_progress())
                        .map(|d| d.id.clone()),
                }
            })
            .collect();

        let active_discussions = discussions
            .iter()
            .filter(|d| d.status == DiscussionStatus::InProgress)
            .count();

        let recent_logs: Vec<ExecutionLog> = logs
            .iter()
            .rev()
            .take(SNAPSHOT_LOG_TAIL)
            .cloned()
            .collect();

        Ok(StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_s: self.start_time.elapsed().as_secs(),
            mode,
            sectors: sector_summaries,
            total_agents: agents.len(),
            active_discussions,
            recent_execution_logs: recent_logs,
            recent_errors: self.recent_errors.read().clone(),
        })
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_s: u64,
    pub mode: SystemMode,
    pub sectors: Vec<SectorSummary>,
    pub total_agents: usize,
    pub active_discussions: usize,
    pub recent_execution_logs: Vec<ExecutionLog>,
    pub recent_errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectorSummary {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub balance: f64,
    pub position: f64,
    pub current_price: f64,
    pub change_percent: f64,
    pub agent_count: usize,
    pub pending_executions: usize,
    pub in_cooldown: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_discussion_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::CandleFeed;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("concord-state-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn error_ring_is_capped_and_bumps_version() {
        let dir = temp_dir();
        let store = Arc::new(
            KeyedStore::open(&dir, std::time::Duration::from_secs(2), 3).unwrap(),
        );
        let state = AppState::new(
            RuntimeConfig::default(),
            store,
            Arc::new(CandleFeed::new()),
        );

        let v0 = state.current_state_version();
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            state.push_error(format!("err {i}"));
        }
        assert_eq!(state.recent_errors.read().len(), MAX_RECENT_ERRORS);
        assert!(state.current_state_version() > v0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn snapshot_reflects_store_contents() {
        let dir = temp_dir();
        let store = Arc::new(
            KeyedStore::open(&dir, std::time::Duration::from_secs(2), 3).unwrap(),
        );
        let sector = Sector::new(
            "Energy",
            "ENRG",
            1000.0,
            100.0,
            0.02,
            40,
            0.0,
            vec!["ENRG".into()],
            SystemMode::Simulation,
        );
        let s = sector.clone();
        store
            .update::<Sector, _, _>(collections::SECTORS, move |v| {
                v.push(s.clone());
                Ok(())
            })
            .await
            .unwrap();

        let state = AppState::new(
            RuntimeConfig::default(),
            store,
            Arc::new(CandleFeed::new()),
        );
        let snapshot = state.build_snapshot().await.unwrap();
        assert_eq!(snapshot.sectors.len(), 1);
        assert_eq!(snapshot.sectors[0].symbol, "ENRG");
        assert_eq!(snapshot.active_discussions, 0);
        assert_eq!(snapshot.mode, SystemMode::Simulation);

        std::fs::remove_dir_all(&dir).ok();
    }
}
