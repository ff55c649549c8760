// =============================================================================
// Sector ticker — the per-sector cooperative control loop
// =============================================================================
//
// One tokio task per sector, waking every tick_period_ms. Each tick, in
// order:
//   1. Refresh sector + agents from storage.
//   2. Record a simulated candle and update every agent's confidence.
//   3. If discussion-ready, attempt start_discussion (DuplicateActive from a
//      racing writer is benign).
//   4. If a discussion is IN_PROGRESS, drive exactly one state-machine step
//      under the per-discussion mutex shared with the watchdog.
//   5. Drain at most K execution-list items.
//   6. Start the sector cooldown when a discussion transitions to DECIDED.
//
// Shutdown is cooperative: the watch channel is only observed between
// ticks, so in-flight execution always completes.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::confidence;
use crate::discussion_engine::{DiscussionEngine, StepOutcome};
use crate::error::{CoreError, CoreResult};
use crate::execution::ExecutionEngine;
use crate::market_data::{MarketSnapshot, SharedCandleFeed};
use crate::model::{Agent, Discussion, Sector, SimulationRule};
use crate::runtime_config::RuntimeConfig;
use crate::storage::{collections, KeyedStore};

/// Per-discussion mutexes shared between tickers and the watchdog so a
/// force-close never races a round step.
#[derive(Clone, Default)]
pub struct DiscussionLocks {
    inner: Arc<parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl DiscussionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, discussion_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .lock()
            .entry(discussion_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn forget(&self, discussion_id: &str) {
        self.inner.lock().remove(discussion_id);
    }
}

/// Everything a ticker needs; shared by all sector tickers.
pub struct TickerContext {
    pub store: Arc<KeyedStore>,
    pub config: Arc<RwLock<RuntimeConfig>>,
    pub feed: SharedCandleFeed,
    pub discussions: Arc<DiscussionEngine>,
    pub execution: Arc<ExecutionEngine>,
    pub locks: DiscussionLocks,
}

/// Snapshot returned by a single tick (the confidence-tick endpoint's
/// response body).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub agents: Vec<AgentConfidence>,
    pub discussion_ready: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentConfidence {
    pub id: String,
    pub name: String,
    pub confidence: f64,
}

/// Run one full tick for a sector.
pub async fn tick_once(ctx: &TickerContext, sector_id: &str) -> CoreResult<TickReport> {
    // ── 1. Refresh ──────────────────────────────────────────────────────
    let sector = load_sector(ctx, sector_id).await?;
    let rules: Vec<SimulationRule> = ctx.store.read(collections::SIMULATION_RULES).await?;

    // ── 2. Candle + confidences ─────────────────────────────────────────
    let volume = rand::thread_rng().gen_range(10.0..1000.0);
    ctx.feed.record(
        &sector.id,
        sector.current_price,
        volume,
        Utc::now().timestamp_millis(),
    );
    let market = MarketSnapshot::capture(&sector, &ctx.feed, volume);

    let sid = sector.id.clone();
    let agents = ctx
        .store
        .update::<Agent, _, _>(collections::AGENTS, move |all| {
            let now = Utc::now();
            for a in all.iter_mut().filter(|a| a.sector_id == sid) {
                if !a.is_manager() {
                    a.confidence = confidence::next_confidence(a, &market, &rules);
                    a.updated_at = now;
                }
            }
            // Manager confidence derives from the fresh worker values.
            let sector_agents: Vec<Agent> = all
                .iter()
                .filter(|a| a.sector_id == sid)
                .cloned()
                .collect();
            let manager_value = confidence::manager_confidence(&sector_agents);
            for a in all.iter_mut().filter(|a| a.sector_id == sid && a.is_manager()) {
                a.confidence = manager_value;
                a.updated_at = now;
            }
            Ok(sector_agents
                .iter()
                .map(|a| a.id.clone())
                .collect::<Vec<_>>())
        })
        .await?;
    // Re-read post-update values for the report and the gate.
    let agents: Vec<Agent> = ctx
        .store
        .read::<Agent>(collections::AGENTS)
        .await?
        .into_iter()
        .filter(|a| agents.contains(&a.id))
        .collect();

    // ── 3. Gate + start ─────────────────────────────────────────────────
    let active = active_discussion(ctx, &sector.id).await?;
    let gate = ctx.config.read().confidence_gate;
    let ready = confidence::discussion_ready(
        &agents,
        gate,
        active.is_some(),
        sector.cooldown_until,
        Utc::now(),
    );

    let mut active_id = active;
    if ready {
        match ctx.discussions.start_discussion(&sector, &agents).await {
            Ok(d) => active_id = Some(d.id),
            Err(CoreError::DuplicateActive { .. }) => {
                debug!(sector = %sector.id, "lost the start race, continuing");
            }
            Err(e) => {
                warn!(sector = %sector.id, error = %e, "start_discussion failed");
            }
        }
    }

    // ── 4. One discussion step under the shared mutex ───────────────────
    if let Some(did) = &active_id {
        let lock = ctx.locks.lock_for(did);
        let _guard = lock.lock().await;
        match ctx.discussions.step(did).await {
            Ok(StepOutcome::Closed { reason }) => {
                info!(sector = %sector.id, discussion = %did, reason, "discussion decided");
                ctx.discussions.after_close(&sector.id).await?;
                ctx.locks.forget(did);
            }
            Ok(outcome) => debug!(sector = %sector.id, ?outcome, "discussion step"),
            Err(e) => warn!(sector = %sector.id, discussion = %did, error = %e, "discussion step failed"),
        }
    }

    // ── 5. Drain the execution list ─────────────────────────────────────
    let drain_limit = ctx.config.read().execution_drain_per_tick;
    let report = ctx.execution.drain(&sector.id, drain_limit).await?;
    if report.executed + report.rejected > 0 {
        debug!(sector = %sector.id, executed = report.executed, rejected = report.rejected, "execution drained");
    }

    // ── 6. Cooldown bookkeeping happens in after_close ──────────────────
    // If execution just finished the last open item, the next tick's step
    // observes all-terminal and closes the discussion.

    Ok(TickReport {
        discussion_ready: ready,
        agents: agents
            .iter()
            .map(|a| AgentConfidence {
                id: a.id.clone(),
                name: a.name.clone(),
                confidence: a.confidence,
            })
            .collect(),
    })
}

/// The ticker loop. Spawned once per sector; exits when the shutdown signal
/// flips or the sector disappears.
pub async fn run(ctx: Arc<TickerContext>, sector_id: String, mut shutdown: watch::Receiver<bool>) {
    let period = ctx.config.read().tick_period_ms;
    let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(period.max(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(sector = %sector_id, period_ms = period, "sector ticker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match tick_once(&ctx, &sector_id).await {
                    Ok(_) => {}
                    Err(CoreError::NotFound(what)) => {
                        info!(sector = %sector_id, what, "sector gone, ticker exiting");
                        break;
                    }
                    Err(e) => {
                        warn!(sector = %sector_id, error = %e, "tick failed");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(sector = %sector_id, "sector ticker stopped");
}

async fn load_sector(ctx: &TickerContext, sector_id: &str) -> CoreResult<Sector> {
    ctx.store
        .read::<Sector>(collections::SECTORS)
        .await?
        .into_iter()
        .find(|s| s.id == sector_id)
        .ok_or_else(|| CoreError::NotFound(format!("sector {sector_id}")))
}

async fn active_discussion(ctx: &TickerContext, sector_id: &str) -> CoreResult<Option<String>> {
    Ok(ctx
        .store
        .read::<Discussion>(collections::DISCUSSIONS)
        .await?
        .into_iter()
        .find(|d| d.sector_id == sector_id && d.is_in_progress())
        .map(|d| d.id))
}
