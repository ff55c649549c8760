// =============================================================================
// Execution engine — drains a sector's FIFO execution list
// =============================================================================
//
// Per item:
//   1. Re-validate against the current portfolio (stale approvals are marked
//      REJECTED post-hoc and draining continues).
//   2. Apply the portfolio operation.
//   3. Update the price (simulation mode only) and persist {balance,
//      position, holdings, current_price, change, change_percent} in one
//      sector write.
//   4. Append an ExecutionLog (capped ring) and mirror it if configured.
//   5. Update agent rewards: proposer +2, supporters +1, opposers -1,
//      manager +1.
//
// In realtime mode portfolio operations still apply but the price is never
// mutated here.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::model::execution_log::enforce_ring;
use crate::model::{Agent, ChecklistItem, Discussion, ExecutionLog, ExecutionTicket, Sector};
use crate::portfolio::RebalanceTarget;
use crate::price_model;
use crate::registry::RegistryMirror;
use crate::runtime_config::RuntimeConfig;
use crate::storage::{collections, KeyedStore};
use crate::types::{ActionType, ItemStatus, SystemMode};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub executed: usize,
    pub rejected: usize,
}

pub struct ExecutionEngine {
    store: Arc<KeyedStore>,
    config: Arc<RwLock<RuntimeConfig>>,
    registry: Option<Arc<RegistryMirror>>,
}

struct AppliedAction {
    prev_price: f64,
    new_price: f64,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<KeyedStore>,
        config: Arc<RwLock<RuntimeConfig>>,
        registry: Option<Arc<RegistryMirror>>,
    ) -> Self {
        Self {
            store,
            config,
            registry,
        }
    }

    /// Drain up to `max_items` tickets from the sector's execution queue.
    pub async fn drain(&self, sector_id: &str, max_items: usize) -> CoreResult<DrainReport> {
        let mut report = DrainReport::default();

        for _ in 0..max_items {
            let Some(ticket) = self.peek_ticket(sector_id).await? else {
                break;
            };

            let Some(item) = self.load_item(&ticket).await? else {
                // The discussion or item vanished; drop the ticket.
                warn!(item = %ticket.item_id, "ticket without a backing item, dropped");
                self.pop_ticket(sector_id, &ticket).await?;
                continue;
            };

            if item.status != ItemStatus::Approved {
                debug!(item = %item.id, status = %item.status, "non-approved ticket dropped");
                self.pop_ticket(sector_id, &ticket).await?;
                continue;
            }

            match self.apply(sector_id, &ticket, &item).await? {
                Ok(applied) => {
                    self.finish_executed(sector_id, &ticket, &item, &applied).await?;
                    report.executed += 1;
                }
                Err(reason) => {
                    self.finish_rejected(&ticket, &item, &reason).await?;
                    report.rejected += 1;
                }
            }
        }

        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Queue access
    // -------------------------------------------------------------------------

    async fn peek_ticket(&self, sector_id: &str) -> CoreResult<Option<ExecutionTicket>> {
        let sectors: Vec<Sector> = self.store.read(collections::SECTORS).await?;
        Ok(sectors
            .into_iter()
            .find(|s| s.id == sector_id)
            .and_then(|s| s.execution_queue.first().cloned()))
    }

    async fn pop_ticket(&self, sector_id: &str, ticket: &ExecutionTicket) -> CoreResult<()> {
        let sid = sector_id.to_string();
        let item_id = ticket.item_id.clone();
        self.store
            .update::<Sector, _, _>(collections::SECTORS, move |sectors| {
                if let Some(s) = sectors.iter_mut().find(|s| s.id == sid) {
                    s.execution_queue.retain(|t| t.item_id != item_id);
                    s.updated_at = Utc::now();
                }
                Ok(())
            })
            .await
    }

    async fn load_item(&self, ticket: &ExecutionTicket) -> CoreResult<Option<ChecklistItem>> {
        let discussions: Vec<Discussion> = self.store.read(collections::DISCUSSIONS).await?;
        Ok(discussions
            .into_iter()
            .find(|d| d.id == ticket.discussion_id)
            .and_then(|d| d.checklist.into_iter().find(|i| i.id == ticket.item_id)))
    }

    // -------------------------------------------------------------------------
    // Applying the action
    // -------------------------------------------------------------------------

    /// Pop the ticket and apply the portfolio + price transition in a single
    /// sector write. The outer Result is a storage fault; the inner one is
    /// the business verdict (Err = re-validation failed).
    async fn apply(
        &self,
        sector_id: &str,
        ticket: &ExecutionTicket,
        item: &ChecklistItem,
    ) -> CoreResult<Result<AppliedAction, String>> {
        let sid = sector_id.to_string();
        let item = item.clone();
        let item_id = ticket.item_id.clone();
        let noise_unit = price_model::draw_noise_unit(&mut rand::thread_rng());

        self.store
            .update::<Sector, _, _>(collections::SECTORS, move |sectors| {
                let Some(s) = sectors.iter_mut().find(|s| s.id == sid) else {
                    return Err(CoreError::NotFound(format!("sector {sid}")));
                };
                let now = Utc::now();
                s.execution_queue.retain(|t| t.item_id != item_id);

                let applied = match item.action_type {
                    ActionType::Buy => s.apply_buy(&item.symbol, item.amount),
                    ActionType::Sell => s.apply_sell(&item.symbol, item.amount),
                    ActionType::Hold => {
                        s.apply_hold();
                        Ok(())
                    }
                    ActionType::Rebalance => s.apply_rebalance(RebalanceTarget::Fraction(
                        item.allocation_percent / 100.0,
                    )),
                };

                if let Err(e) = applied {
                    s.updated_at = now;
                    return Ok(Err(e.to_string()));
                }

                let prev_price = s.current_price;
                let new_price = if s.mode == SystemMode::Simulation {
                    let next = price_model::new_price(
                        prev_price,
                        price_model::manager_impact(item.action_type),
                        s.trend_factor,
                        s.volatility,
                        noise_unit,
                    );
                    s.set_price(next, now);
                    next
                } else {
                    s.updated_at = now;
                    prev_price
                };

                Ok(Ok(AppliedAction {
                    prev_price,
                    new_price,
                }))
            })
            .await
    }

    // -------------------------------------------------------------------------
    // Post-execution bookkeeping
    // -------------------------------------------------------------------------

    async fn finish_executed(
        &self,
        sector_id: &str,
        ticket: &ExecutionTicket,
        item: &ChecklistItem,
        applied: &AppliedAction,
    ) -> CoreResult<()> {
        self.mark_item(ticket, ItemStatus::Executed, None).await?;

        let impact_pct = if applied.prev_price > 0.0 {
            (applied.new_price - applied.prev_price) / applied.prev_price * 100.0
        } else {
            0.0
        };

        // Supporters echo the executed action; opposers pushed a different
        // action for the same symbol. The manager earns a cut per execution.
        let discussions: Vec<Discussion> = self.store.read(collections::DISCUSSIONS).await?;
        let discussion = discussions.into_iter().find(|d| d.id == ticket.discussion_id);

        let agents: Vec<Agent> = self.store.read(collections::AGENTS).await?;
        let manager_id = agents
            .iter()
            .find(|a| a.sector_id == sector_id && a.is_manager())
            .map(|a| a.id.clone());

        let log = ExecutionLog::new(
            sector_id,
            item.action_type.as_str(),
            impact_pct,
            Some(item.id.clone()),
            manager_id.clone(),
        );
        let entry = log.clone();
        self.store
            .update::<ExecutionLog, _, _>(collections::EXECUTION_LOGS, move |logs| {
                logs.push(entry.clone());
                enforce_ring(logs);
                Ok(())
            })
            .await?;

        if let Some(registry) = &self.registry {
            registry.mirror(&log);
        }

        self.award_rewards(item, discussion.as_ref(), manager_id.as_deref())
            .await?;

        info!(
            sector = %sector_id,
            item = %item.id,
            action = %item.action_type,
            amount = item.amount,
            impact_pct,
            "item executed"
        );
        Ok(())
    }

    async fn finish_rejected(
        &self,
        ticket: &ExecutionTicket,
        item: &ChecklistItem,
        reason: &str,
    ) -> CoreResult<()> {
        warn!(item = %item.id, reason, "execution re-validation failed, item rejected");
        self.mark_item(ticket, ItemStatus::Rejected, Some(reason.to_string()))
            .await
    }

    async fn mark_item(
        &self,
        ticket: &ExecutionTicket,
        status: ItemStatus,
        reason: Option<String>,
    ) -> CoreResult<()> {
        let did = ticket.discussion_id.clone();
        let item_id = ticket.item_id.clone();
        self.store
            .update::<Discussion, _, _>(collections::DISCUSSIONS, move |discussions| {
                let Some(d) = discussions.iter_mut().find(|d| d.id == did) else {
                    return Ok(());
                };
                let now = Utc::now();
                if let Some(i) = d.checklist.iter_mut().find(|i| i.id == item_id) {
                    i.status = status;
                    i.updated_at = now;
                    if let Some(r) = &reason {
                        i.rejection_reason =
                            Some(crate::model::ScoreRecord::watchdog(r.clone()));
                    }
                }
                d.last_checklist_item_at = now;
                d.updated_at = now;
                Ok(())
            })
            .await
    }

    async fn award_rewards(
        &self,
        item: &ChecklistItem,
        discussion: Option<&Discussion>,
        manager_id: Option<&str>,
    ) -> CoreResult<()> {
        use std::collections::HashMap;

        let mut deltas: HashMap<String, i64> = HashMap::new();

        if item.source_agent_id != crate::model::discussion::CONSENSUS_SOURCE {
            *deltas.entry(item.source_agent_id.clone()).or_insert(0) += 2;
        }

        if let Some(d) = discussion {
            for message in d.messages.iter().filter(|m| !m.observation) {
                if message.agent_id == item.source_agent_id {
                    continue;
                }
                let Some(parsed) = crate::checklist::parse_proposal(&message.proposal) else {
                    continue;
                };
                if parsed.symbol != item.symbol {
                    continue;
                }
                let delta = if parsed.action == item.action_type { 1 } else { -1 };
                *deltas.entry(message.agent_id.clone()).or_insert(0) += delta;
            }
        }

        if let Some(m) = manager_id {
            *deltas.entry(m.to_string()).or_insert(0) += 1;
        }

        if deltas.is_empty() {
            return Ok(());
        }

        self.store
            .update::<Agent, _, _>(collections::AGENTS, move |agents| {
                for a in agents.iter_mut() {
                    if let Some(delta) = deltas.get(&a.id) {
                        a.rewards += delta;
                        a.updated_at = Utc::now();
                    }
                }
                Ok(())
            })
            .await
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("registry", &self.registry.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, Personality};
    use crate::types::AgentRole;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("concord-exec-{}", uuid::Uuid::new_v4()))
    }

    struct Fixture {
        dir: PathBuf,
        store: Arc<KeyedStore>,
        engine: ExecutionEngine,
        sector_id: String,
        discussion_id: String,
        manager_id: String,
        proposer_id: String,
        supporter_id: String,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    async fn fixture(action: ActionType, amount: f64, mode: SystemMode) -> Fixture {
        let dir = temp_dir();
        let store = Arc::new(
            KeyedStore::open(&dir, std::time::Duration::from_secs(2), 3).unwrap(),
        );
        let config = Arc::new(RwLock::new(RuntimeConfig::default()));

        // Volatility 0 and trend 0 make price updates exact.
        let mut sector = Sector::new(
            "Energy",
            "ENRG",
            1000.0,
            100.0,
            0.0,
            40,
            0.0,
            vec!["ENRG".into()],
            mode,
        );

        let manager = Agent::new(sector.id.clone(), "chief", AgentRole::Manager, Personality::default());
        let proposer = Agent::new(sector.id.clone(), "prop", AgentRole::Trader, Personality::default());
        let supporter = Agent::new(sector.id.clone(), "supp", AgentRole::Analyst, Personality::default());
        sector.agent_ids = vec![manager.id.clone(), proposer.id.clone(), supporter.id.clone()];

        let mut discussion = Discussion::new(
            sector.id.clone(),
            vec![proposer.id.clone(), supporter.id.clone()],
            2,
        );
        discussion.current_round = 2;
        discussion.messages.push(Message::new(
            proposer.id.clone(),
            2,
            "lead",
            format!("{} ENRG amount={:.2} alloc=20.0%", action.as_str(), amount),
            0.8,
            false,
        ));
        discussion.messages.push(Message::new(
            supporter.id.clone(),
            2,
            "agree",
            format!("{} ENRG amount=50.00 alloc=5.0%", action.as_str()),
            0.7,
            false,
        ));

        let mut item = ChecklistItem::new(
            proposer.id.clone(),
            2,
            action,
            "ENRG",
            amount,
            20.0,
            80.0,
            "consolidated",
        );
        item.status = ItemStatus::Approved;
        let item_id = item.id.clone();
        discussion.checklist.push(item);

        sector.execution_queue.push(ExecutionTicket {
            discussion_id: discussion.id.clone(),
            item_id,
            enqueued_at: Utc::now(),
        });

        let ids = Fixture {
            dir,
            engine: ExecutionEngine::new(store.clone(), config, None),
            sector_id: sector.id.clone(),
            discussion_id: discussion.id.clone(),
            manager_id: manager.id.clone(),
            proposer_id: proposer.id.clone(),
            supporter_id: supporter.id.clone(),
            store: store.clone(),
        };

        let s = sector.clone();
        store
            .update::<Sector, _, _>(collections::SECTORS, move |v| {
                v.push(s.clone());
                Ok(())
            })
            .await
            .unwrap();
        let d = discussion.clone();
        store
            .update::<Discussion, _, _>(collections::DISCUSSIONS, move |v| {
                v.push(d.clone());
                Ok(())
            })
            .await
            .unwrap();
        let agents = vec![manager, proposer, supporter];
        store
            .update::<Agent, _, _>(collections::AGENTS, move |v| {
                v.extend(agents.iter().cloned());
                Ok(())
            })
            .await
            .unwrap();

        ids
    }

    async fn sector_of(f: &Fixture) -> Sector {
        f.store
            .read::<Sector>(collections::SECTORS)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.id == f.sector_id)
            .unwrap()
    }

    async fn item_status(f: &Fixture) -> ItemStatus {
        f.store
            .read::<Discussion>(collections::DISCUSSIONS)
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.id == f.discussion_id)
            .unwrap()
            .checklist[0]
            .status
    }

    async fn rewards_of(f: &Fixture, id: &str) -> i64 {
        f.store
            .read::<Agent>(collections::AGENTS)
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.id == id)
            .unwrap()
            .rewards
    }

    #[tokio::test]
    async fn happy_path_buy_updates_portfolio_price_log_and_rewards() {
        let f = fixture(ActionType::Buy, 200.0, SystemMode::Simulation).await;
        let report = f.engine.drain(&f.sector_id, 3).await.unwrap();
        assert_eq!(report, DrainReport { executed: 1, rejected: 0 });

        let s = sector_of(&f).await;
        assert!((s.balance - 800.0).abs() < 1e-9);
        assert!((s.position - 200.0).abs() < 1e-9);
        // 100 * (1 + 0.002) with zero volatility and trend.
        assert!((s.current_price - 100.20).abs() < 1e-9);
        assert!(s.execution_queue.is_empty());

        assert_eq!(item_status(&f).await, ItemStatus::Executed);

        let logs: Vec<ExecutionLog> = f.store.read(collections::EXECUTION_LOGS).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "BUY");
        assert!((logs[0].impact - 0.2).abs() < 1e-9);
        assert_eq!(logs[0].manager_id.as_deref(), Some(f.manager_id.as_str()));

        assert_eq!(rewards_of(&f, &f.proposer_id).await, 2);
        assert_eq!(rewards_of(&f, &f.supporter_id).await, 1);
        assert_eq!(rewards_of(&f, &f.manager_id).await, 1);
    }

    #[tokio::test]
    async fn insufficient_balance_marks_item_rejected_and_continues() {
        let f = fixture(ActionType::Buy, 5000.0, SystemMode::Simulation).await;
        let report = f.engine.drain(&f.sector_id, 3).await.unwrap();
        assert_eq!(report, DrainReport { executed: 0, rejected: 1 });

        let s = sector_of(&f).await;
        assert!((s.balance - 1000.0).abs() < 1e-9);
        assert!((s.current_price - 100.0).abs() < 1e-9);
        assert!(s.execution_queue.is_empty());
        assert_eq!(item_status(&f).await, ItemStatus::Rejected);

        let logs: Vec<ExecutionLog> = f.store.read(collections::EXECUTION_LOGS).await.unwrap();
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn realtime_mode_applies_portfolio_but_never_price() {
        let f = fixture(ActionType::Buy, 200.0, SystemMode::Realtime).await;
        f.engine.drain(&f.sector_id, 3).await.unwrap();

        let s = sector_of(&f).await;
        assert!((s.balance - 800.0).abs() < 1e-9);
        assert!((s.position - 200.0).abs() < 1e-9);
        assert!((s.current_price - 100.0).abs() < 1e-9);

        let logs: Vec<ExecutionLog> = f.store.read(collections::EXECUTION_LOGS).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!((logs[0].impact - 0.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn hold_executes_with_tiny_positive_impact() {
        let f = fixture(ActionType::Hold, 0.0, SystemMode::Simulation).await;
        let report = f.engine.drain(&f.sector_id, 3).await.unwrap();
        assert_eq!(report.executed, 1);

        let s = sector_of(&f).await;
        assert!((s.balance - 1000.0).abs() < 1e-9);
        assert!((s.current_price - 100.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn opposing_messages_cost_a_reward_point() {
        let f = fixture(ActionType::Buy, 200.0, SystemMode::Simulation).await;
        // Flip the supporter's message into an opposing SELL.
        let did = f.discussion_id.clone();
        let supporter = f.supporter_id.clone();
        f.store
            .update::<Discussion, _, _>(collections::DISCUSSIONS, move |v| {
                let d = v.iter_mut().find(|d| d.id == did).unwrap();
                let m = d
                    .messages
                    .iter_mut()
                    .find(|m| m.agent_id == supporter)
                    .unwrap();
                m.proposal = "SELL ENRG amount=50.00 alloc=5.0%".into();
                Ok(())
            })
            .await
            .unwrap();

        f.engine.drain(&f.sector_id, 3).await.unwrap();
        assert_eq!(rewards_of(&f, &f.supporter_id).await, -1);
    }

    #[tokio::test]
    async fn empty_queue_is_a_quiet_noop() {
        let f = fixture(ActionType::Buy, 200.0, SystemMode::Simulation).await;
        f.engine.drain(&f.sector_id, 3).await.unwrap();
        let report = f.engine.drain(&f.sector_id, 3).await.unwrap();
        assert_eq!(report, DrainReport::default());
    }
}
