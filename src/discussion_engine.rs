// =============================================================================
// Discussion state machine — round progression, scoring, revision, closure
// =============================================================================
//
//             start_discussion()                synth/score/execute
//  (none) ─────────────────────▶ IN_PROGRESS ───────────────────────▶ DECIDED
//                                    │  ▲
//                    round<max       │  │ worker_respond_to_rejection
//                  round advance ────┘  │
//                                       │
//                    watchdog force-close (close_reason != null)
//
// One bounded unit of work per `step` call, so a sector tick never blocks on
// a whole deliberation. Oracle calls happen outside the storage lock; the
// per-sector single-writer discipline (ticker + watchdog mutex) keeps the
// read-compute-write windows race-free.
//
// Serial-execution invariant: the IN_PROGRESS check runs under the same
// atomic `discussions` write that inserts the new record, so two concurrent
// starts cannot both succeed.
// =============================================================================

use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::checklist;
use crate::error::{CoreError, CoreResult};
use crate::market_data::{MarketSnapshot, SharedCandleFeed};
use crate::model::{Agent, ChecklistItem, Discussion, ManagerDecision, Message, Sector};
use crate::oracle::{ProposalOracle, RevisionContext};
use crate::runtime_config::RuntimeConfig;
use crate::scorer::ManagerScorer;
use crate::storage::{collections, KeyedStore};
use crate::types::{AgentStatus, DiscussionStatus, ItemStatus};

/// What a single `step` call accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do (no active discussion, or waiting on execution).
    Idle,
    RoundCollected { round: u32, messages: usize },
    RoundAdvanced { round: u32 },
    ChecklistSynthesized { items: usize },
    ItemsScored { approved: usize, revise: usize, rejected: usize },
    RevisionsProcessed { resubmitted: usize, accepted: usize },
    Closed { reason: String },
}

pub struct DiscussionEngine {
    store: Arc<KeyedStore>,
    oracle: Arc<dyn ProposalOracle>,
    config: Arc<RwLock<RuntimeConfig>>,
    feed: SharedCandleFeed,
}

impl DiscussionEngine {
    pub fn new(
        store: Arc<KeyedStore>,
        oracle: Arc<dyn ProposalOracle>,
        config: Arc<RwLock<RuntimeConfig>>,
        feed: SharedCandleFeed,
    ) -> Self {
        Self {
            store,
            oracle,
            config,
            feed,
        }
    }

    fn scorer(&self) -> ManagerScorer {
        let cfg = self.config.read();
        ManagerScorer {
            weights: cfg.scorer_weights,
            approval_threshold: cfg.approval_threshold,
            rejection_refinement: cfg.rejection_refinement,
        }
    }

    // -------------------------------------------------------------------------
    // start_discussion
    // -------------------------------------------------------------------------

    /// Open a discussion for `sector`. Preconditions, in order:
    ///   1. no IN_PROGRESS discussion exists for the sector (checked under
    ///      the same atomic write that creates the new record),
    ///   2. sector balance is positive,
    ///   3. every non-manager participant meets the confidence gate,
    ///   4. allowed symbols are non-empty and market data is well-formed.
    pub async fn start_discussion(
        &self,
        sector: &Sector,
        agents: &[Agent],
    ) -> CoreResult<Discussion> {
        let (gate, max_rounds) = {
            let cfg = self.config.read();
            (cfg.confidence_gate, cfg.max_rounds)
        };

        let participants: Vec<&Agent> = agents.iter().filter(|a| !a.is_manager()).collect();
        if participants.is_empty() {
            return Err(CoreError::Validation(
                "no non-manager participants in sector".into(),
            ));
        }
        if sector.balance <= 0.0 {
            return Err(CoreError::Validation(format!(
                "sector balance {:.2} must be positive",
                sector.balance
            )));
        }
        if let Some(below) = participants.iter().find(|a| a.confidence < gate) {
            return Err(CoreError::Validation(format!(
                "agent {} confidence {:.2} below gate {:.0}",
                below.id, below.confidence, gate
            )));
        }
        if sector.allowed_symbols.is_empty() {
            return Err(CoreError::Validation("sector allows no symbols".into()));
        }
        if !sector.market_data_valid() {
            return Err(CoreError::Validation("market data failed validation".into()));
        }

        let participant_ids: Vec<String> = participants.iter().map(|a| a.id.clone()).collect();
        let sector_id = sector.id.clone();

        let discussion = self
            .store
            .update::<Discussion, _, _>(collections::DISCUSSIONS, move |discussions| {
                if discussions
                    .iter()
                    .any(|d| d.sector_id == sector_id && d.is_in_progress())
                {
                    return Err(CoreError::DuplicateActive {
                        sector_id: sector_id.clone(),
                    });
                }
                let d = Discussion::new(sector_id.clone(), participant_ids.clone(), max_rounds);
                discussions.push(d.clone());
                Ok(d)
            })
            .await?;

        // Back-reference on the sector and mark participants active. These
        // live in other collections; the serial invariant above does not
        // depend on them.
        let did = discussion.id.clone();
        let sid = sector.id.clone();
        self.store
            .update::<Sector, _, _>(collections::SECTORS, move |sectors| {
                if let Some(s) = sectors.iter_mut().find(|s| s.id == sid) {
                    s.discussion_ids.push(did.clone());
                    s.updated_at = Utc::now();
                }
                Ok(())
            })
            .await?;

        let ids = discussion.agent_ids.clone();
        self.store
            .update::<Agent, _, _>(collections::AGENTS, move |agents| {
                for a in agents.iter_mut().filter(|a| ids.contains(&a.id)) {
                    a.status = AgentStatus::Active;
                    a.updated_at = Utc::now();
                }
                Ok(())
            })
            .await?;

        info!(
            discussion = %discussion.id,
            sector = %discussion.sector_id,
            participants = discussion.agent_ids.len(),
            max_rounds = discussion.max_rounds,
            "discussion opened"
        );
        Ok(discussion)
    }

    // -------------------------------------------------------------------------
    // step
    // -------------------------------------------------------------------------

    /// Drive one bounded unit of work on a discussion.
    pub async fn step(&self, discussion_id: &str) -> CoreResult<StepOutcome> {
        let discussion = self.load_discussion(discussion_id).await?;
        if !discussion.is_in_progress() {
            return Ok(StepOutcome::Idle);
        }

        let sector = self.load_sector(&discussion.sector_id).await?;
        let agents: Vec<Agent> = self
            .store
            .read::<Agent>(collections::AGENTS)
            .await?
            .into_iter()
            .filter(|a| a.sector_id == sector.id)
            .collect();

        let round = discussion.current_round;
        let round_collected = !discussion.messages_for_round(round).is_empty();

        if !round_collected {
            return self.collect_round(&discussion, &sector, &agents).await;
        }
        if round < discussion.max_rounds {
            return self.advance(&discussion).await;
        }
        if discussion.checklist.is_empty() {
            return self.synthesize_checklist(&discussion, &sector).await;
        }
        if !discussion.scoreable_items().is_empty() {
            return self.score_items(&discussion, &sector, &agents).await;
        }
        if discussion
            .checklist
            .iter()
            .any(|i| i.status == ItemStatus::ReviseRequired)
        {
            return self.process_revisions(&discussion).await;
        }
        if discussion.all_items_terminal() {
            return self.close(discussion_id, "completed").await;
        }

        // Approved items are waiting in the execution queue.
        Ok(StepOutcome::Idle)
    }

    // -------------------------------------------------------------------------
    // Phase: collect one round of messages
    // -------------------------------------------------------------------------

    async fn collect_round(
        &self,
        discussion: &Discussion,
        sector: &Sector,
        agents: &[Agent],
    ) -> CoreResult<StepOutcome> {
        let round = discussion.current_round;
        let market = MarketSnapshot::capture(sector, &self.feed, 0.0);

        let mut collected: Vec<Message> = Vec::new();
        let mut failures = 0usize;

        for agent_id in &discussion.agent_ids {
            let Some(agent) = agents.iter().find(|a| &a.id == agent_id) else {
                warn!(agent = %agent_id, "participant vanished mid-discussion");
                failures += 1;
                continue;
            };

            // Hand back any of the agent's revise-flagged items so a model
            // oracle can react to the rejection reasons.
            let rejected: Vec<ChecklistItem> = discussion
                .checklist
                .iter()
                .filter(|i| {
                    i.source_agent_id == agent.id && i.rejection_reason.is_some()
                })
                .cloned()
                .collect();
            let revision_ctx = if rejected.is_empty() {
                None
            } else {
                Some(RevisionContext { rejected })
            };

            let result = self
                .oracle
                .propose(agent, sector, &market, &collected, revision_ctx.as_ref())
                .await;
            match result {
                Ok(proposal) => {
                    collected.push(Message::new(
                        agent.id.clone(),
                        round,
                        proposal.reasoning,
                        proposal.proposal,
                        proposal.confidence,
                        proposal.observation,
                    ));
                }
                Err(e) => {
                    // A failing agent contributes nothing; the round goes on.
                    warn!(agent = %agent.id, error = %e, "oracle failure, agent skipped");
                    failures += 1;
                }
            }
        }

        if collected.is_empty() {
            warn!(
                discussion = %discussion.id,
                failures,
                "whole round failed, closing discussion"
            );
            return self.close(&discussion.id, "round_failure").await;
        }

        let count = collected.len();
        let did = discussion.id.clone();
        self.store
            .update::<Discussion, _, _>(collections::DISCUSSIONS, move |discussions| {
                let d = find_in_progress(discussions, &did)?;
                d.messages.extend(collected.iter().cloned());
                d.updated_at = Utc::now();
                Ok(())
            })
            .await?;

        info!(discussion = %discussion.id, round, messages = count, "round collected");
        Ok(StepOutcome::RoundCollected {
            round,
            messages: count,
        })
    }

    // -------------------------------------------------------------------------
    // Phase: advance to the next round
    // -------------------------------------------------------------------------

    async fn advance(&self, discussion: &Discussion) -> CoreResult<StepOutcome> {
        let did = discussion.id.clone();
        let next = self
            .store
            .update::<Discussion, _, _>(collections::DISCUSSIONS, move |discussions| {
                let d = find_in_progress(discussions, &did)?;
                advance_round(d);
                Ok(d.current_round)
            })
            .await?;

        info!(discussion = %discussion.id, round = next, "round advanced");
        Ok(StepOutcome::RoundAdvanced { round: next })
    }

    // -------------------------------------------------------------------------
    // Phase: synthesize the checklist after the final round
    // -------------------------------------------------------------------------

    async fn synthesize_checklist(
        &self,
        discussion: &Discussion,
        sector: &Sector,
    ) -> CoreResult<StepOutcome> {
        let items = checklist::synthesize(discussion, sector);
        if items.is_empty() {
            info!(discussion = %discussion.id, "no items synthesized, closing");
            return self.close(&discussion.id, "no_items_synthesized").await;
        }

        let count = items.len();
        let did = discussion.id.clone();
        self.store
            .update::<Discussion, _, _>(collections::DISCUSSIONS, move |discussions| {
                let d = find_in_progress(discussions, &did)?;
                d.checklist = items.clone();
                d.touch_checklist(Utc::now());
                Ok(())
            })
            .await?;

        info!(discussion = %discussion.id, items = count, "checklist synthesized");
        Ok(StepOutcome::ChecklistSynthesized { items: count })
    }

    // -------------------------------------------------------------------------
    // Phase: manager scores pending items
    // -------------------------------------------------------------------------

    async fn score_items(
        &self,
        discussion: &Discussion,
        sector: &Sector,
        agents: &[Agent],
    ) -> CoreResult<StepOutcome> {
        let scorer = self.scorer();
        let manager_id = agents.iter().find(|a| a.is_manager()).map(|a| a.id.clone());

        let mut approved_ids: Vec<String> = Vec::new();
        let (mut approved, mut revise, mut rejected) = (0usize, 0usize, 0usize);

        let did = discussion.id.clone();
        let sector_snapshot = sector.clone();
        self.store
            .update::<Discussion, _, _>(collections::DISCUSSIONS, |discussions| {
                let d = find_in_progress(discussions, &did)?;
                let now = Utc::now();
                approved_ids.clear();
                approved = 0;
                revise = 0;
                rejected = 0;

                for item in d.checklist.iter_mut().filter(|i| {
                    matches!(i.status, ItemStatus::Pending | ItemStatus::Resubmitted)
                }) {
                    let (status, record) = scorer.decide(item, &sector_snapshot);
                    item.status = status;
                    item.evaluated_at = Some(now);
                    item.updated_at = now;
                    match status {
                        ItemStatus::Approved => {
                            approved += 1;
                            approved_ids.push(item.id.clone());
                        }
                        ItemStatus::ReviseRequired => {
                            revise += 1;
                            item.rejection_reason = Some(record.clone());
                        }
                        _ => {
                            rejected += 1;
                            item.rejection_reason = Some(record.clone());
                        }
                    }
                    d.manager_decisions.push(ManagerDecision {
                        item_id: item.id.clone(),
                        status,
                        score: record.score,
                        reason: record.reason,
                        decided_at: now,
                    });
                }
                d.touch_checklist(now);
                Ok(())
            })
            .await?;

        // Approved items enter the sector's FIFO execution queue.
        if !approved_ids.is_empty() {
            let sid = sector.id.clone();
            let did = discussion.id.clone();
            let ids = approved_ids.clone();
            self.store
                .update::<Sector, _, _>(collections::SECTORS, move |sectors| {
                    let Some(s) = sectors.iter_mut().find(|s| s.id == sid) else {
                        return Err(CoreError::NotFound(format!("sector {sid}")));
                    };
                    let now = Utc::now();
                    for item_id in &ids {
                        s.execution_queue.push(crate::model::ExecutionTicket {
                            discussion_id: did.clone(),
                            item_id: item_id.clone(),
                            enqueued_at: now,
                        });
                    }
                    s.updated_at = now;
                    Ok(())
                })
                .await?;
        }

        info!(
            discussion = %discussion.id,
            manager = manager_id.as_deref().unwrap_or("none"),
            approved, revise, rejected,
            "items scored"
        );
        Ok(StepOutcome::ItemsScored {
            approved,
            revise,
            rejected,
        })
    }

    // -------------------------------------------------------------------------
    // Phase: workers respond to REVISE_REQUIRED items
    // -------------------------------------------------------------------------

    async fn process_revisions(&self, discussion: &Discussion) -> CoreResult<StepOutcome> {
        let max_revisions = self.config.read().max_revisions;
        let did = discussion.id.clone();
        let (mut resubmitted, mut accepted) = (0usize, 0usize);

        self.store
            .update::<Discussion, _, _>(collections::DISCUSSIONS, |discussions| {
                let d = find_in_progress(discussions, &did)?;
                resubmitted = 0;
                accepted = 0;
                let revise_ids: Vec<String> = d
                    .checklist
                    .iter()
                    .filter(|i| i.status == ItemStatus::ReviseRequired)
                    .map(|i| i.id.clone())
                    .collect();
                for item_id in revise_ids {
                    match worker_respond_to_rejection(d, &item_id, max_revisions)? {
                        ItemStatus::Resubmitted => resubmitted += 1,
                        ItemStatus::AcceptRejection => accepted += 1,
                        other => {
                            warn!(item = %item_id, status = %other, "unexpected revision outcome");
                        }
                    }
                }
                d.touch_checklist(Utc::now());
                Ok(())
            })
            .await?;

        info!(discussion = %discussion.id, resubmitted, accepted, "revisions processed");
        Ok(StepOutcome::RevisionsProcessed {
            resubmitted,
            accepted,
        })
    }

    // -------------------------------------------------------------------------
    // Closing
    // -------------------------------------------------------------------------

    /// Terminally close a discussion, force-resolving non-terminal items.
    pub async fn close(&self, discussion_id: &str, reason: &str) -> CoreResult<StepOutcome> {
        let did = discussion_id.to_string();
        let reason_owned = reason.to_string();
        self.store
            .update::<Discussion, _, _>(collections::DISCUSSIONS, move |discussions| {
                let Some(d) = discussions.iter_mut().find(|d| d.id == did) else {
                    return Err(CoreError::NotFound(format!("discussion {did}")));
                };
                if d.status == DiscussionStatus::Decided {
                    return Ok(());
                }
                force_close(d, &reason_owned);
                Ok(())
            })
            .await?;

        info!(discussion = %discussion_id, reason, "discussion closed");
        Ok(StepOutcome::Closed {
            reason: reason.to_string(),
        })
    }

    /// Post-close bookkeeping: start the sector cooldown and idle its agents.
    pub async fn after_close(&self, sector_id: &str) -> CoreResult<()> {
        let cooldown_s = self.config.read().discussion_cooldown_s;
        let sid = sector_id.to_string();
        self.store
            .update::<Sector, _, _>(collections::SECTORS, move |sectors| {
                if let Some(s) = sectors.iter_mut().find(|s| s.id == sid) {
                    let now = Utc::now();
                    s.cooldown_until = Some(now + Duration::seconds(cooldown_s as i64));
                    s.updated_at = now;
                }
                Ok(())
            })
            .await?;

        let sid = sector_id.to_string();
        self.store
            .update::<Agent, _, _>(collections::AGENTS, move |agents| {
                for a in agents.iter_mut().filter(|a| a.sector_id == sid) {
                    a.status = AgentStatus::Idle;
                    a.updated_at = Utc::now();
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Loaders
    // -------------------------------------------------------------------------

    async fn load_discussion(&self, id: &str) -> CoreResult<Discussion> {
        self.store
            .read::<Discussion>(collections::DISCUSSIONS)
            .await?
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("discussion {id}")))
    }

    async fn load_sector(&self, id: &str) -> CoreResult<Sector> {
        self.store
            .read::<Sector>(collections::SECTORS)
            .await?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("sector {id}")))
    }
}

// ---------------------------------------------------------------------------
// Pure state-machine helpers (shared with the watchdog and tests)
// ---------------------------------------------------------------------------

fn find_in_progress<'a>(
    discussions: &'a mut [Discussion],
    id: &str,
) -> CoreResult<&'a mut Discussion> {
    let d = discussions
        .iter_mut()
        .find(|d| d.id == id)
        .ok_or_else(|| CoreError::NotFound(format!("discussion {id}")))?;
    if d.status == DiscussionStatus::Decided {
        return Err(CoreError::Stalled(format!(
            "discussion {id} already decided"
        )));
    }
    Ok(d)
}

/// Snapshot the closing round and move to the next one. Only items still in
/// the revision pipeline carry forward; RESUBMITTED items reset to PENDING
/// for re-scoring.
pub fn advance_round(d: &mut Discussion) {
    let now = Utc::now();
    let closing = d.current_round;
    d.round_history.push(crate::model::RoundSnapshot {
        round: closing,
        checklist: d.checklist.clone(),
        messages: d
            .messages
            .iter()
            .filter(|m| m.round == closing)
            .cloned()
            .collect(),
        manager_decisions: d.manager_decisions.clone(),
        timestamp: now,
    });

    d.checklist.retain(|i| {
        matches!(i.status, ItemStatus::ReviseRequired | ItemStatus::Resubmitted)
    });
    for item in &mut d.checklist {
        if item.status == ItemStatus::Resubmitted {
            item.status = ItemStatus::Pending;
            item.updated_at = now;
        }
    }
    d.manager_decisions.clear();
    d.current_round += 1;
    d.updated_at = now;
}

/// The worker's reaction to a REVISE_REQUIRED item:
///   - revision budget exhausted       -> ACCEPT_REJECTION (terminal),
///   - hard-constraint rejection       -> ACCEPT_REJECTION (terminal),
///   - otherwise                       -> a NEW item (old one preserved in
///     its `previous_versions`), RESUBMITTED, revision_count + 1; risk-driven
///     rejections halve the amount and shave 10% off the confidence.
pub fn worker_respond_to_rejection(
    d: &mut Discussion,
    item_id: &str,
    max_revisions: u32,
) -> CoreResult<ItemStatus> {
    let idx = d
        .checklist
        .iter()
        .position(|i| i.id == item_id)
        .ok_or_else(|| CoreError::NotFound(format!("checklist item {item_id}")))?;

    let item = &d.checklist[idx];
    if item.status != ItemStatus::ReviseRequired {
        return Err(CoreError::Validation(format!(
            "item {item_id} is {} and cannot be revised",
            item.status
        )));
    }

    let now = Utc::now();
    if item.revision_count >= max_revisions {
        let item = &mut d.checklist[idx];
        item.status = ItemStatus::AcceptRejection;
        item.updated_at = now;
        return Ok(ItemStatus::AcceptRejection);
    }

    let hard = item
        .rejection_reason
        .as_ref()
        .map(|r| r.is_hard_constraint())
        .unwrap_or(false);
    if hard {
        let item = &mut d.checklist[idx];
        item.status = ItemStatus::AcceptRejection;
        item.updated_at = now;
        return Ok(ItemStatus::AcceptRejection);
    }

    let risk_driven = item
        .rejection_reason
        .as_ref()
        .map(|r| r.is_risk_rejection())
        .unwrap_or(false);

    // The old item lives on inside the new item's revision chain; the slot
    // in the checklist is taken over by the successor.
    let replacement = item.revised(risk_driven);
    d.checklist[idx] = replacement;
    Ok(ItemStatus::Resubmitted)
}

/// Force-resolve every item still in the pipeline and mark the discussion
/// DECIDED with the given close reason.
pub fn force_close(d: &mut Discussion, reason: &str) {
    let now = Utc::now();
    for item in d.checklist.iter_mut().filter(|i| {
        matches!(
            i.status,
            ItemStatus::Pending | ItemStatus::ReviseRequired | ItemStatus::Resubmitted
        )
    }) {
        item.status = ItemStatus::Rejected;
        item.updated_at = now;
    }
    d.status = DiscussionStatus::Decided;
    d.close_reason = Some(reason.to_string());
    d.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Personality, ScoreBreakdown, ScoreRecord};
    use crate::oracle::DeterministicOracle;
    use crate::types::{ActionType, AgentRole, SystemMode};
    use async_trait::async_trait;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("concord-engine-{}", uuid::Uuid::new_v4()))
    }

    struct Fixture {
        dir: PathBuf,
        store: Arc<KeyedStore>,
        config: Arc<RwLock<RuntimeConfig>>,
        feed: SharedCandleFeed,
        sector: Sector,
        agents: Vec<Agent>,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    async fn fixture(confidences: &[f64], trend_percent: f64) -> Fixture {
        let dir = temp_dir();
        let store = Arc::new(
            KeyedStore::open(&dir, std::time::Duration::from_secs(2), 3).unwrap(),
        );
        let config = Arc::new(RwLock::new(RuntimeConfig::default()));
        let feed: SharedCandleFeed = Arc::new(crate::market_data::CandleFeed::new());

        let mut sector = Sector::new(
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
        sector.change_percent = trend_percent;

        let mut agents = vec![Agent::new(
            sector.id.clone(),
            "chief",
            AgentRole::Manager,
            Personality::default(),
        )];
        for (i, c) in confidences.iter().enumerate() {
            let mut a = Agent::new(
                sector.id.clone(),
                format!("worker-{i}"),
                AgentRole::Researcher,
                Personality::default(),
            );
            a.confidence = *c;
            agents.push(a);
        }
        sector.agent_ids = agents.iter().map(|a| a.id.clone()).collect();

        let s = sector.clone();
        store
            .update::<Sector, _, _>(collections::SECTORS, move |sectors| {
                sectors.push(s.clone());
                Ok(())
            })
            .await
            .unwrap();
        let list = agents.clone();
        store
            .update::<Agent, _, _>(collections::AGENTS, move |all| {
                all.extend(list.iter().cloned());
                Ok(())
            })
            .await
            .unwrap();

        Fixture {
            dir,
            store,
            config,
            feed,
            sector,
            agents,
        }
    }

    fn engine(f: &Fixture, oracle: Arc<dyn ProposalOracle>) -> DiscussionEngine {
        DiscussionEngine::new(f.store.clone(), oracle, f.config.clone(), f.feed.clone())
    }

    async fn read_discussion(f: &Fixture, id: &str) -> Discussion {
        f.store
            .read::<Discussion>(collections::DISCUSSIONS)
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.id == id)
            .unwrap()
    }

    /// Oracle returning pure commentary: synthesizes nothing.
    struct CommentaryOracle;

    #[async_trait]
    impl ProposalOracle for CommentaryOracle {
        async fn propose(
            &self,
            agent: &Agent,
            _sector: &Sector,
            _market: &MarketSnapshot,
            _prior: &[Message],
            _revision: Option<&RevisionContext>,
        ) -> CoreResult<crate::oracle::Proposal> {
            Ok(crate::oracle::Proposal {
                reasoning: "nothing actionable".into(),
                proposal: "no action today".into(),
                confidence: agent.confidence / 100.0,
                observation: false,
            })
        }
    }

    /// Oracle that always fails.
    struct FailingOracle;

    #[async_trait]
    impl ProposalOracle for FailingOracle {
        async fn propose(
            &self,
            _agent: &Agent,
            _sector: &Sector,
            _market: &MarketSnapshot,
            _prior: &[Message],
            _revision: Option<&RevisionContext>,
        ) -> CoreResult<crate::oracle::Proposal> {
            Err(CoreError::OracleFailure("model offline".into()))
        }
    }

    #[tokio::test]
    async fn gate_failure_reports_the_exact_precondition() {
        let f = fixture(&[64.0, 70.0, 80.0], 2.0).await;
        let e = engine(&f, Arc::new(DeterministicOracle));
        let err = e.start_discussion(&f.sector, &f.agents).await.unwrap_err();
        match err {
            CoreError::Validation(msg) => assert!(msg.contains("below gate"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_start_fails_with_duplicate_active() {
        let f = fixture(&[70.0, 75.0], 2.0).await;
        let e = engine(&f, Arc::new(DeterministicOracle));
        e.start_discussion(&f.sector, &f.agents).await.unwrap();
        let err = e.start_discussion(&f.sector, &f.agents).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateActive { .. }));
        assert!(err.is_invariant_violation());
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one() {
        let f = fixture(&[70.0, 75.0], 2.0).await;
        let e = Arc::new(engine(&f, Arc::new(DeterministicOracle)));
        let (r1, r2) = tokio::join!(
            e.start_discussion(&f.sector, &f.agents),
            e.start_discussion(&f.sector, &f.agents),
        );
        let successes = [&r1, &r2].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        let loser = if r1.is_err() { r1.unwrap_err() } else { r2.unwrap_err() };
        assert!(matches!(loser, CoreError::DuplicateActive { .. }));
    }

    #[tokio::test]
    async fn zero_balance_blocks_start() {
        let mut f = fixture(&[70.0, 75.0], 2.0).await;
        f.sector.balance = 0.0;
        let e = engine(&f, Arc::new(DeterministicOracle));
        let err = e.start_discussion(&f.sector, &f.agents).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn full_run_reaches_approved_items() {
        let f = fixture(&[70.0, 75.0], 2.0).await;
        let e = engine(&f, Arc::new(DeterministicOracle));
        let d = e.start_discussion(&f.sector, &f.agents).await.unwrap();

        // Round 1 collect, advance, round 2 collect, synthesize, score.
        assert!(matches!(
            e.step(&d.id).await.unwrap(),
            StepOutcome::RoundCollected { round: 1, .. }
        ));
        assert!(matches!(
            e.step(&d.id).await.unwrap(),
            StepOutcome::RoundAdvanced { round: 2 }
        ));
        assert!(matches!(
            e.step(&d.id).await.unwrap(),
            StepOutcome::RoundCollected { round: 2, .. }
        ));
        assert!(matches!(
            e.step(&d.id).await.unwrap(),
            StepOutcome::ChecklistSynthesized { .. }
        ));
        let outcome = e.step(&d.id).await.unwrap();
        let StepOutcome::ItemsScored { approved, .. } = outcome else {
            panic!("expected scoring, got {outcome:?}");
        };
        assert!(approved >= 1);

        // Approved items landed in the sector execution queue.
        let sector: Sector = f
            .store
            .read::<Sector>(collections::SECTORS)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.id == f.sector.id)
            .unwrap();
        assert_eq!(sector.execution_queue.len(), approved);

        let stored = read_discussion(&f, &d.id).await;
        assert_eq!(stored.round_history.len(), 1);
        assert!(stored.messages.iter().any(|m| m.round == 1));
        assert!(stored.messages.iter().any(|m| m.round == 2));
    }

    #[tokio::test]
    async fn single_participant_runs_one_round() {
        let f = fixture(&[80.0], 2.0).await;
        let e = engine(&f, Arc::new(DeterministicOracle));
        let d = e.start_discussion(&f.sector, &f.agents).await.unwrap();
        assert_eq!(d.max_rounds, 1);

        assert!(matches!(
            e.step(&d.id).await.unwrap(),
            StepOutcome::RoundCollected { round: 1, .. }
        ));
        // No advance: straight to synthesis.
        assert!(matches!(
            e.step(&d.id).await.unwrap(),
            StepOutcome::ChecklistSynthesized { .. }
        ));
        let stored = read_discussion(&f, &d.id).await;
        assert_eq!(stored.current_round, 1);
        assert!(stored.round_history.is_empty());
    }

    #[tokio::test]
    async fn zero_synthesized_items_closes_the_discussion() {
        let f = fixture(&[70.0, 75.0], 0.0).await;
        let e = engine(&f, Arc::new(CommentaryOracle));
        let d = e.start_discussion(&f.sector, &f.agents).await.unwrap();

        e.step(&d.id).await.unwrap(); // round 1
        e.step(&d.id).await.unwrap(); // advance
        e.step(&d.id).await.unwrap(); // round 2
        let outcome = e.step(&d.id).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Closed {
                reason: "no_items_synthesized".into()
            }
        );
        let stored = read_discussion(&f, &d.id).await;
        assert_eq!(stored.status, DiscussionStatus::Decided);
        assert_eq!(stored.close_reason.as_deref(), Some("no_items_synthesized"));
    }

    #[tokio::test]
    async fn whole_round_failure_closes_with_round_failure() {
        let f = fixture(&[70.0, 75.0], 2.0).await;
        let e = engine(&f, Arc::new(FailingOracle));
        let d = e.start_discussion(&f.sector, &f.agents).await.unwrap();
        let outcome = e.step(&d.id).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Closed {
                reason: "round_failure".into()
            }
        );
    }

    #[tokio::test]
    async fn decided_discussions_accept_no_further_steps() {
        let f = fixture(&[70.0, 75.0], 2.0).await;
        let e = engine(&f, Arc::new(FailingOracle));
        let d = e.start_discussion(&f.sector, &f.agents).await.unwrap();
        e.step(&d.id).await.unwrap(); // closes with round_failure
        assert_eq!(e.step(&d.id).await.unwrap(), StepOutcome::Idle);
        // Closing again is a no-op, not an error.
        e.close(&d.id, "again").await.unwrap();
        let stored = read_discussion(&f, &d.id).await;
        assert_eq!(stored.close_reason.as_deref(), Some("round_failure"));
    }

    // -- pure helper tests ---------------------------------------------------

    fn revise_record(reason: &str) -> ScoreRecord {
        ScoreRecord {
            score: 60.0,
            approval_threshold: 65.0,
            breakdown: ScoreBreakdown::default(),
            reason: reason.into(),
            required_improvements: vec![],
        }
    }

    fn discussion_with_revise_item(reason: &str, revision_count: u32) -> (Discussion, String) {
        let mut d = Discussion::new("s1", vec!["a1".into(), "a2".into()], 2);
        d.current_round = 2;
        let mut item =
            ChecklistItem::new("a1", 2, ActionType::Buy, "ENRG", 400.0, 20.0, 70.0, "entry");
        item.status = ItemStatus::ReviseRequired;
        item.revision_count = revision_count;
        item.rejection_reason = Some(revise_record(reason));
        let id = item.id.clone();
        d.checklist.push(item);
        (d, id)
    }

    #[test]
    fn risk_rejection_resubmits_with_halved_amount() {
        let (mut d, id) = discussion_with_revise_item("risk too high", 0);
        let status = worker_respond_to_rejection(&mut d, &id, 2).unwrap();
        assert_eq!(status, ItemStatus::Resubmitted);
        let item = &d.checklist[0];
        assert_ne!(item.id, id);
        assert_eq!(item.revision_count, 1);
        assert!((item.amount - 200.0).abs() < 1e-9);
        assert!((item.confidence - 63.0).abs() < 1e-9);
        assert_eq!(item.previous_versions.len(), 1);
        assert_eq!(item.previous_versions[0].id, id);
    }

    #[test]
    fn exhausted_budget_accepts_the_rejection() {
        let (mut d, id) = discussion_with_revise_item("risk too high", 2);
        let status = worker_respond_to_rejection(&mut d, &id, 2).unwrap();
        assert_eq!(status, ItemStatus::AcceptRejection);
        assert_eq!(d.checklist[0].id, id);
        assert_eq!(d.checklist[0].status, ItemStatus::AcceptRejection);
    }

    #[test]
    fn hard_constraint_rejection_is_not_revisable() {
        let (mut d, id) = discussion_with_revise_item("symbol OILX not allowed by sector policy", 0);
        let status = worker_respond_to_rejection(&mut d, &id, 2).unwrap();
        assert_eq!(status, ItemStatus::AcceptRejection);
    }

    #[test]
    fn advance_round_snapshots_and_carries_the_pipeline() {
        let mut d = Discussion::new("s1", vec!["a1".into(), "a2".into()], 2);
        d.messages.push(Message::new("a1", 1, "r", "BUY ENRG amount=10.00 alloc=5.0%", 0.7, false));

        let mut keep = ChecklistItem::new("a1", 1, ActionType::Buy, "ENRG", 10.0, 5.0, 70.0, "x");
        keep.status = ItemStatus::ReviseRequired;
        let mut resub = ChecklistItem::new("a2", 1, ActionType::Sell, "ENRG", 5.0, 2.0, 60.0, "y");
        resub.status = ItemStatus::Resubmitted;
        let mut done = ChecklistItem::new("a2", 1, ActionType::Hold, "ENRG", 0.0, 0.0, 50.0, "z");
        done.status = ItemStatus::Rejected;
        d.checklist = vec![keep.clone(), resub.clone(), done.clone()];

        advance_round(&mut d);

        assert_eq!(d.current_round, 2);
        assert_eq!(d.round_history.len(), 1);
        assert_eq!(d.round_history[0].checklist.len(), 3);
        assert_eq!(d.round_history[0].messages.len(), 1);
        // Only the revision pipeline carries forward; RESUBMITTED resets.
        assert_eq!(d.checklist.len(), 2);
        assert_eq!(d.checklist[0].status, ItemStatus::ReviseRequired);
        assert_eq!(d.checklist[1].status, ItemStatus::Pending);
    }

    #[test]
    fn force_close_resolves_the_pipeline_only() {
        let mut d = Discussion::new("s1", vec!["a1".into(), "a2".into()], 2);
        let mut pending = ChecklistItem::new("a1", 2, ActionType::Buy, "ENRG", 10.0, 5.0, 70.0, "x");
        pending.status = ItemStatus::Pending;
        let mut approved = ChecklistItem::new("a2", 2, ActionType::Buy, "ENRG", 20.0, 5.0, 70.0, "y");
        approved.status = ItemStatus::Approved;
        let mut executed = ChecklistItem::new("a2", 2, ActionType::Hold, "ENRG", 0.0, 0.0, 70.0, "z");
        executed.status = ItemStatus::Executed;
        d.checklist = vec![pending, approved, executed];

        force_close(&mut d, "watchdog_force_close_stalled_31s");

        assert_eq!(d.status, DiscussionStatus::Decided);
        assert_eq!(d.checklist[0].status, ItemStatus::Rejected);
        assert_eq!(d.checklist[1].status, ItemStatus::Approved);
        assert_eq!(d.checklist[2].status, ItemStatus::Executed);
        assert!(d
            .close_reason
            .as_deref()
            .unwrap()
            .starts_with("watchdog_force_close_stalled_"));
    }
}
