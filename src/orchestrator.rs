// =============================================================================
// System orchestrator — owns tickers, the watchdog, mode, and sector lifecycle
// =============================================================================
//
// One ticker task per sector, each with its own shutdown channel so sectors
// can be stopped individually; `shutdown()` stops everything cooperatively.
// The orchestrator is also the service layer behind the HTTP surface for
// operations that touch task lifecycle (create/delete sector, set mode,
// tick-once).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::discussion_engine::{force_close, DiscussionEngine};
use crate::error::{CoreError, CoreResult};
use crate::execution::ExecutionEngine;
use crate::model::{Agent, Discussion, Sector, UserAccount};
use crate::oracle::{DeterministicOracle, HttpOracle, ProposalOracle};
use crate::registry::RegistryMirror;
use crate::storage::collections;
use crate::ticker::{self, DiscussionLocks, TickReport, TickerContext};
use crate::types::SystemMode;
use crate::watchdog::{self, Watchdog};

struct TickerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct SystemOrchestrator {
    pub state: Arc<AppState>,
    ctx: Arc<TickerContext>,
    watchdog: Arc<Watchdog>,
    tickers: Mutex<HashMap<String, TickerHandle>>,
    watchdog_handle: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl SystemOrchestrator {
    /// Wire up the engines from the app state. The oracle implementation is
    /// chosen once at startup: USE_LLM plus an endpoint selects the HTTP
    /// oracle, anything else the deterministic one.
    pub fn new(state: Arc<AppState>) -> Arc<Self> {
        let (use_llm, oracle_endpoint, oracle_timeout_ms, registry_endpoint) = {
            let cfg = state.runtime_config.read();
            (
                cfg.use_llm,
                cfg.oracle_endpoint.clone(),
                cfg.oracle_timeout_ms,
                cfg.registry_endpoint.clone(),
            )
        };

        let oracle: Arc<dyn ProposalOracle> = match (use_llm, oracle_endpoint) {
            (true, Some(endpoint)) => {
                info!(endpoint = %endpoint, "HTTP oracle selected");
                Arc::new(HttpOracle::new(
                    endpoint,
                    std::time::Duration::from_millis(oracle_timeout_ms),
                ))
            }
            (true, None) => {
                warn!("USE_LLM set but no oracle endpoint configured, using deterministic oracle");
                Arc::new(DeterministicOracle)
            }
            _ => Arc::new(DeterministicOracle),
        };

        let registry = registry_endpoint.map(|endpoint| {
            info!(endpoint = %endpoint, "registry mirror enabled");
            RegistryMirror::new(endpoint)
        });

        let discussions = Arc::new(DiscussionEngine::new(
            state.store.clone(),
            oracle,
            state.runtime_config.clone(),
            state.feed.clone(),
        ));
        let execution = Arc::new(ExecutionEngine::new(
            state.store.clone(),
            state.runtime_config.clone(),
            registry,
        ));
        let locks = DiscussionLocks::new();

        let ctx = Arc::new(TickerContext {
            store: state.store.clone(),
            config: state.runtime_config.clone(),
            feed: state.feed.clone(),
            discussions: discussions.clone(),
            execution,
            locks: locks.clone(),
        });

        let watchdog = Arc::new(Watchdog::new(
            state.store.clone(),
            state.runtime_config.clone(),
            discussions,
            locks,
        ));

        Arc::new(Self {
            state,
            ctx,
            watchdog,
            tickers: Mutex::new(HashMap::new()),
            watchdog_handle: Mutex::new(None),
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the watchdog and one ticker per persisted sector.
    pub async fn start(&self) -> CoreResult<()> {
        {
            let (tx, rx) = watch::channel(false);
            let task = tokio::spawn(watchdog::run(self.watchdog.clone(), rx));
            *self.watchdog_handle.lock() = Some((tx, task));
        }

        let sectors: Vec<Sector> = self.state.store.read(collections::SECTORS).await?;
        for sector in &sectors {
            self.start_sector(&sector.id);
        }
        info!(sectors = sectors.len(), "orchestrator started");
        Ok(())
    }

    /// Start the ticker for one sector; a no-op if it is already running.
    pub fn start_sector(&self, sector_id: &str) {
        let mut tickers = self.tickers.lock();
        if let Some(existing) = tickers.get(sector_id) {
            if !existing.task.is_finished() {
                return;
            }
        }
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(ticker::run(
            self.ctx.clone(),
            sector_id.to_string(),
            rx,
        ));
        tickers.insert(
            sector_id.to_string(),
            TickerHandle { shutdown: tx, task },
        );
        info!(sector = %sector_id, "sector ticker registered");
    }

    /// Signal a sector's ticker to stop after its current tick.
    pub fn stop_sector(&self, sector_id: &str) {
        if let Some(handle) = self.tickers.lock().remove(sector_id) {
            let _ = handle.shutdown.send(true);
            info!(sector = %sector_id, "sector ticker stopping");
        }
    }

    /// Cooperative engine shutdown: every ticker finishes its in-flight tick.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, TickerHandle)> = self.tickers.lock().drain().collect();
        for (sector_id, handle) in &handles {
            let _ = handle.shutdown.send(true);
            info!(sector = %sector_id, "shutdown signalled");
        }
        for (_, handle) in handles {
            let _ = handle.task.await;
        }

        if let Some((tx, task)) = self.watchdog_handle.lock().take() {
            let _ = tx.send(true);
            drop(task); // detached; it observes the channel and exits
        }
        info!("orchestrator shut down");
    }

    // -------------------------------------------------------------------------
    // Mode
    // -------------------------------------------------------------------------

    /// Switch the global mode; sectors mirror it so the execution engine can
    /// decide per sector whether to move prices.
    pub async fn set_mode(&self, mode: SystemMode) -> CoreResult<()> {
        self.state.runtime_config.write().mode = mode;
        self.state
            .store
            .update::<Sector, _, _>(collections::SECTORS, move |sectors| {
                for s in sectors.iter_mut() {
                    s.mode = mode;
                    s.updated_at = Utc::now();
                }
                Ok(())
            })
            .await?;
        self.state.increment_version();
        info!(mode = %mode, "system mode changed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Test / API hooks
    // -------------------------------------------------------------------------

    /// Run exactly one tick for a sector (the confidence-tick endpoint).
    pub async fn tick_once(&self, sector_id: &str) -> CoreResult<TickReport> {
        ticker::tick_once(&self.ctx, sector_id).await
    }

    // -------------------------------------------------------------------------
    // Sector delete cascade
    // -------------------------------------------------------------------------

    /// Delete a sector after a case-insensitive name confirmation. Cascade:
    /// open discussions are terminally closed, agents are deleted, the
    /// balance returns to the user account. Returns the refunded balance.
    pub async fn handle_sector_delete(
        &self,
        sector_id: &str,
        confirm_name: &str,
    ) -> CoreResult<f64> {
        let sectors: Vec<Sector> = self.state.store.read(collections::SECTORS).await?;
        let sector = sectors
            .into_iter()
            .find(|s| s.id == sector_id)
            .ok_or_else(|| CoreError::NotFound(format!("sector {sector_id}")))?;

        if !sector.name.eq_ignore_ascii_case(confirm_name.trim()) {
            return Err(CoreError::Validation(format!(
                "confirmation '{confirm_name}' does not match sector name '{}'",
                sector.name
            )));
        }

        self.stop_sector(sector_id);

        // Terminally close anything still deliberating.
        let sid = sector.id.clone();
        self.state
            .store
            .update::<Discussion, _, _>(collections::DISCUSSIONS, move |discussions| {
                for d in discussions
                    .iter_mut()
                    .filter(|d| d.sector_id == sid && d.is_in_progress())
                {
                    force_close(d, "sector_deleted");
                }
                Ok(())
            })
            .await?;

        // Delete the sector's agents (the manager included; its lifecycle is
        // bound to the sector).
        let sid = sector.id.clone();
        self.state
            .store
            .update::<Agent, _, _>(collections::AGENTS, move |agents| {
                agents.retain(|a| a.sector_id != sid);
                Ok(())
            })
            .await?;

        // Refund whatever is liquid; open positions evaporate with the
        // simulated sector.
        let refund = sector.balance;
        self.state
            .store
            .update::<UserAccount, _, _>(collections::USER_ACCOUNT, move |accounts| {
                match accounts.first_mut() {
                    Some(acct) => {
                        acct.balance += refund;
                        acct.updated_at = Utc::now();
                    }
                    None => {
                        let mut acct = UserAccount::new(0.0);
                        acct.balance = refund;
                        accounts.push(acct);
                    }
                }
                Ok(())
            })
            .await?;

        let sid = sector.id.clone();
        self.state
            .store
            .update::<Sector, _, _>(collections::SECTORS, move |sectors| {
                sectors.retain(|s| s.id != sid);
                Ok(())
            })
            .await?;

        self.state.feed.drop_sector(&sector.id);
        self.state.increment_version();

        info!(sector = %sector.id, refund, "sector deleted");
        Ok(refund)
    }
}
