// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every bounded constant of the engine contract lives here as a serde
// default, so the engine can be reconfigured without a rebuild and older
// config files keep loading when fields are added.
//
// Persistence uses the atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::scorer::ScorerWeights;
use crate::types::SystemMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_max_sectors() -> usize {
    6
}

fn default_max_agents_per_sector() -> usize {
    12
}

fn default_max_total_agents() -> usize {
    100
}

fn default_confidence_gate() -> f64 {
    65.0
}

fn default_approval_threshold() -> f64 {
    65.0
}

fn default_max_revisions() -> u32 {
    2
}

fn default_max_rounds() -> u32 {
    2
}

fn default_stall_timeout_s() -> u64 {
    30
}

fn default_item_pending_timeout_s() -> u64 {
    300
}

fn default_item_revise_timeout_s() -> u64 {
    600
}

fn default_tick_period_ms() -> u64 {
    1500
}

fn default_watchdog_period_ms() -> u64 {
    10_000
}

fn default_execution_drain_per_tick() -> usize {
    3
}

fn default_discussion_cooldown_s() -> u64 {
    120
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_storage_op_timeout_ms() -> u64 {
    5000
}

fn default_storage_retry_attempts() -> u32 {
    3
}

fn default_oracle_timeout_ms() -> u64 {
    10_000
}

fn default_user_account_balance() -> f64 {
    100_000.0
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Concord engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Global mode --------------------------------------------------------
    #[serde(default)]
    pub mode: SystemMode,

    // --- Bounded constants (engine contract) --------------------------------
    #[serde(default = "default_max_sectors")]
    pub max_sectors: usize,

    #[serde(default = "default_max_agents_per_sector")]
    pub max_agents_per_sector: usize,

    #[serde(default = "default_max_total_agents")]
    pub max_total_agents: usize,

    /// Confidence every non-manager must reach before a discussion opens.
    #[serde(default = "default_confidence_gate")]
    pub confidence_gate: f64,

    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: f64,

    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,

    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    // --- Timers -------------------------------------------------------------
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,

    #[serde(default = "default_watchdog_period_ms")]
    pub watchdog_period_ms: u64,

    /// Discussions with no checklist movement for this long are force-closed.
    #[serde(default = "default_stall_timeout_s")]
    pub stall_timeout_s: u64,

    #[serde(default = "default_item_pending_timeout_s")]
    pub item_pending_timeout_s: u64,

    #[serde(default = "default_item_revise_timeout_s")]
    pub item_revise_timeout_s: u64,

    /// Cooldown after a discussion closes before the sector may open another.
    #[serde(default = "default_discussion_cooldown_s")]
    pub discussion_cooldown_s: u64,

    // --- Execution ----------------------------------------------------------
    /// Execution-list items drained per sector tick.
    #[serde(default = "default_execution_drain_per_tick")]
    pub execution_drain_per_tick: usize,

    // --- Scoring ------------------------------------------------------------
    #[serde(default)]
    pub scorer_weights: ScorerWeights,

    /// Offer REVISE_REQUIRED inside the band below the threshold instead of
    /// rejecting outright.
    #[serde(default = "default_true")]
    pub rejection_refinement: bool,

    // --- Deposits -----------------------------------------------------------
    /// Mirror deposits into the current price (the documented behavior of
    /// the original system; withdrawals never touch the price).
    #[serde(default = "default_true")]
    pub deposit_moves_price: bool,

    // --- Oracle -------------------------------------------------------------
    /// Route proposals through the HTTP oracle instead of the deterministic
    /// one. Overridden by the USE_LLM environment variable.
    #[serde(default)]
    pub use_llm: bool,

    #[serde(default)]
    pub oracle_endpoint: Option<String>,

    #[serde(default = "default_oracle_timeout_ms")]
    pub oracle_timeout_ms: u64,

    // --- Registry mirror ----------------------------------------------------
    /// Fire-and-forget mirror of execution logs. Overridden by the
    /// MAX_REGISTRY environment variable.
    #[serde(default)]
    pub registry_endpoint: Option<String>,

    // --- Storage ------------------------------------------------------------
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_storage_op_timeout_ms")]
    pub storage_op_timeout_ms: u64,

    #[serde(default = "default_storage_retry_attempts")]
    pub storage_retry_attempts: u32,

    /// Seed balance for the user account when the store is empty.
    #[serde(default = "default_user_account_balance")]
    pub user_account_balance: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: SystemMode::Simulation,
            max_sectors: default_max_sectors(),
            max_agents_per_sector: default_max_agents_per_sector(),
            max_total_agents: default_max_total_agents(),
            confidence_gate: default_confidence_gate(),
            approval_threshold: default_approval_threshold(),
            max_revisions: default_max_revisions(),
            max_rounds: default_max_rounds(),
            tick_period_ms: default_tick_period_ms(),
            watchdog_period_ms: default_watchdog_period_ms(),
            stall_timeout_s: default_stall_timeout_s(),
            item_pending_timeout_s: default_item_pending_timeout_s(),
            item_revise_timeout_s: default_item_revise_timeout_s(),
            discussion_cooldown_s: default_discussion_cooldown_s(),
            execution_drain_per_tick: default_execution_drain_per_tick(),
            scorer_weights: ScorerWeights::default(),
            rejection_refinement: true,
            deposit_moves_price: true,
            use_llm: false,
            oracle_endpoint: None,
            oracle_timeout_ms: default_oracle_timeout_ms(),
            registry_endpoint: None,
            data_dir: default_data_dir(),
            storage_op_timeout_ms: default_storage_op_timeout_ms(),
            storage_retry_attempts: default_storage_retry_attempts(),
            user_account_balance: default_user_account_balance(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            mode = %config.mode,
            max_sectors = config.max_sectors,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` with an atomic write (tmp sibling, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply environment overrides. `USE_LLM` selects the HTTP oracle path;
    /// `MAX_REGISTRY` enables the fire-and-forget log mirror.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("USE_LLM") {
            self.use_llm = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("MAX_REGISTRY") {
            if !v.is_empty() {
                self.registry_endpoint = Some(v);
            }
        }
    }
}
