// =============================================================================
// Discussion — a bounded multi-round deliberation and its artifacts
// =============================================================================
//
// Ownership: a Discussion exclusively owns its Messages, ChecklistItems, and
// RoundSnapshots. Messages are immutable after insertion. ChecklistItems are
// immutable across revisions: a revision creates a NEW item linked via
// `previous_versions`, never mutates the old one.
//
// Once a discussion is DECIDED it is immutable.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ActionType, DiscussionStatus, ItemStatus};

/// Source id used when a checklist item consolidates several agents'
/// proposals.
pub const CONSENSUS_SOURCE: &str = "consensus";

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub agent_id: String,
    pub round: u32,
    pub reasoning: String,
    pub proposal: String,
    /// In [0, 1].
    pub confidence: f64,
    /// Observation-only messages never source checklist items.
    #[serde(default)]
    pub observation: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        agent_id: impl Into<String>,
        round: u32,
        reasoning: impl Into<String>,
        proposal: impl Into<String>,
        confidence: f64,
        observation: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            round,
            reasoning: reasoning.into(),
            proposal: proposal.into(),
            confidence: confidence.clamp(0.0, 1.0),
            observation,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring artifacts
// ---------------------------------------------------------------------------

/// Per-factor breakdown behind a manager score. All components in [0, 100].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub worker_confidence: f64,
    pub expected_impact: f64,
    pub risk_level: f64,
    pub alignment_with_sector_goal: f64,
}

/// The manager's verdict on a single checklist item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRecord {
    /// In [0, 100].
    pub score: f64,
    pub approval_threshold: f64,
    pub breakdown: ScoreBreakdown,
    pub reason: String,
    #[serde(default)]
    pub required_improvements: Vec<String>,
}

impl ScoreRecord {
    /// Minimal record used when the watchdog rejects an item by timeout.
    pub fn watchdog(reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            approval_threshold: 0.0,
            breakdown: ScoreBreakdown::default(),
            reason: reason.into(),
            required_improvements: Vec::new(),
        }
    }

    /// Hard-constraint rejections are never revisable: the item violated a
    /// sector rule rather than scoring poorly.
    pub fn is_hard_constraint(&self) -> bool {
        let r = self.reason.to_lowercase();
        r.contains("not allowed") || r.contains("rule violation") || r.contains("policy")
    }

    /// Risk-driven rejections let the worker resubmit a smaller item.
    pub fn is_risk_rejection(&self) -> bool {
        self.reason.to_lowercase().contains("risk")
    }
}

/// A single manager decision, kept for the round snapshot audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerDecision {
    pub item_id: String,
    pub status: ItemStatus,
    pub score: f64,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ChecklistItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    /// Proposing agent id, or [`CONSENSUS_SOURCE`].
    pub source_agent_id: String,
    pub round: u32,
    pub action_type: ActionType,
    pub symbol: String,
    /// Money amount; zero only for HOLD.
    pub amount: f64,
    /// In [0, 100].
    pub allocation_percent: f64,
    /// In [0, 100].
    pub confidence: f64,
    pub reasoning: String,
    pub status: ItemStatus,
    #[serde(default)]
    pub revision_count: u32,
    /// Prior versions of this item, oldest first. Append-only.
    #[serde(default)]
    pub previous_versions: Vec<ChecklistItem>,
    #[serde(default)]
    pub rejection_reason: Option<ScoreRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub evaluated_at: Option<DateTime<Utc>>,
}

impl ChecklistItem {
    pub fn new(
        source_agent_id: impl Into<String>,
        round: u32,
        action_type: ActionType,
        symbol: impl Into<String>,
        amount: f64,
        allocation_percent: f64,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            source_agent_id: source_agent_id.into(),
            round,
            action_type,
            symbol: symbol.into().to_uppercase(),
            amount,
            allocation_percent: allocation_percent.clamp(0.0, 100.0),
            confidence: confidence.clamp(0.0, 100.0),
            reasoning: reasoning.into(),
            status: ItemStatus::Pending,
            revision_count: 0,
            previous_versions: Vec::new(),
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            evaluated_at: None,
        }
    }

    /// Build the revised successor of a rejected item. The original is moved
    /// into `previous_versions`; the revision counter increments.
    ///
    /// Risk-driven rejections halve the amount and shave 10% off the
    /// confidence.
    pub fn revised(&self, risk_driven: bool) -> Self {
        let now = Utc::now();
        let mut chain = self.previous_versions.clone();
        // The stored prior version drops its own chain to keep records flat.
        let mut prior = self.clone();
        prior.previous_versions = Vec::new();
        chain.push(prior);

        let (amount, confidence) = if risk_driven {
            (self.amount / 2.0, self.confidence * 0.9)
        } else {
            (self.amount, self.confidence)
        };

        Self {
            id: Uuid::new_v4().to_string(),
            source_agent_id: self.source_agent_id.clone(),
            round: self.round,
            action_type: self.action_type,
            symbol: self.symbol.clone(),
            amount,
            allocation_percent: self.allocation_percent,
            confidence,
            reasoning: self.reasoning.clone(),
            status: ItemStatus::Resubmitted,
            revision_count: self.revision_count + 1,
            previous_versions: chain,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            evaluated_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RoundSnapshot
// ---------------------------------------------------------------------------

/// Deep copy of a round's state, taken when the round closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub round: u32,
    pub checklist: Vec<ChecklistItem>,
    pub messages: Vec<Message>,
    pub manager_decisions: Vec<ManagerDecision>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Discussion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discussion {
    pub id: String,
    pub sector_id: String,
    pub status: DiscussionStatus,
    /// 1-based.
    pub current_round: u32,
    pub max_rounds: u32,
    /// Non-manager participants.
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    #[serde(default)]
    pub round_history: Vec<RoundSnapshot>,
    /// Manager decisions for the current round.
    #[serde(default)]
    pub manager_decisions: Vec<ManagerDecision>,
    /// Bumped whenever a checklist item is created or changes status; the
    /// watchdog treats a stale value as a stall.
    pub last_checklist_item_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub close_reason: Option<String>,
}

impl Discussion {
    pub fn new(sector_id: impl Into<String>, agent_ids: Vec<String>, max_rounds: u32) -> Self {
        let now = Utc::now();
        // A lone participant has nobody to deliberate with; one round.
        let max_rounds = if agent_ids.len() == 1 { 1 } else { max_rounds.max(1) };
        Self {
            id: Uuid::new_v4().to_string(),
            sector_id: sector_id.into(),
            status: DiscussionStatus::InProgress,
            current_round: 1,
            max_rounds,
            agent_ids,
            messages: Vec::new(),
            checklist: Vec::new(),
            round_history: Vec::new(),
            manager_decisions: Vec::new(),
            last_checklist_item_at: now,
            created_at: now,
            updated_at: now,
            close_reason: None,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == DiscussionStatus::InProgress
    }

    pub fn messages_for_round(&self, round: u32) -> Vec<&Message> {
        self.messages.iter().filter(|m| m.round == round).collect()
    }

    /// True once every checklist item has reached a terminal status. A
    /// discussion with an empty checklist is not closeable by this rule.
    pub fn all_items_terminal(&self) -> bool {
        !self.checklist.is_empty() && self.checklist.iter().all(|i| i.status.is_terminal())
    }

    /// Items awaiting a manager score.
    pub fn scoreable_items(&self) -> Vec<&ChecklistItem> {
        self.checklist
            .iter()
            .filter(|i| matches!(i.status, ItemStatus::Pending | ItemStatus::Resubmitted))
            .collect()
    }

    pub fn touch_checklist(&mut self, now: DateTime<Utc>) {
        self.last_checklist_item_at = now;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_participant_forces_one_round() {
        let d = Discussion::new("s1", vec!["a1".into()], 2);
        assert_eq!(d.max_rounds, 1);
        let d2 = Discussion::new("s1", vec!["a1".into(), "a2".into()], 2);
        assert_eq!(d2.max_rounds, 2);
    }

    #[test]
    fn revision_links_previous_version_and_increments_count() {
        let item = ChecklistItem::new(
            "a1",
            2,
            ActionType::Buy,
            "ENRG",
            400.0,
            20.0,
            80.0,
            "momentum entry",
        );
        let revised = item.revised(true);

        assert_ne!(revised.id, item.id);
        assert_eq!(revised.revision_count, 1);
        assert_eq!(revised.status, ItemStatus::Resubmitted);
        assert!((revised.amount - 200.0).abs() < 1e-9);
        assert!((revised.confidence - 72.0).abs() < 1e-9);
        assert_eq!(revised.previous_versions.len(), 1);
        assert_eq!(revised.previous_versions[0].id, item.id);
        // Original untouched.
        assert_eq!(item.revision_count, 0);
        assert!(item.previous_versions.is_empty());
    }

    #[test]
    fn second_revision_keeps_full_chain() {
        let item = ChecklistItem::new("a1", 2, ActionType::Sell, "ENRG", 100.0, 10.0, 70.0, "x");
        let r1 = item.revised(false);
        let r2 = r1.revised(true);
        assert_eq!(r2.revision_count, 2);
        assert_eq!(r2.previous_versions.len(), 2);
        assert_eq!(r2.previous_versions[0].id, item.id);
        assert_eq!(r2.previous_versions[1].id, r1.id);
        // Flat chain: stored versions carry no nested chains of their own.
        assert!(r2.previous_versions.iter().all(|v| v.previous_versions.is_empty()));
    }

    #[test]
    fn non_risk_revision_preserves_amount() {
        let item = ChecklistItem::new("a1", 1, ActionType::Buy, "ENRG", 300.0, 15.0, 60.0, "x");
        let r = item.revised(false);
        assert!((r.amount - 300.0).abs() < 1e-9);
        assert!((r.confidence - 60.0).abs() < 1e-9);
    }

    #[test]
    fn hard_constraint_and_risk_reason_detection() {
        let hard = ScoreRecord {
            score: 10.0,
            approval_threshold: 65.0,
            breakdown: ScoreBreakdown::default(),
            reason: "symbol OILX not allowed by sector policy".into(),
            required_improvements: vec![],
        };
        assert!(hard.is_hard_constraint());

        let risk = ScoreRecord {
            score: 60.0,
            approval_threshold: 65.0,
            breakdown: ScoreBreakdown::default(),
            reason: "risk too high for current exposure".into(),
            required_improvements: vec!["reduce allocation".into()],
        };
        assert!(!risk.is_hard_constraint());
        assert!(risk.is_risk_rejection());
    }

    #[test]
    fn all_items_terminal_requires_nonempty_checklist() {
        let mut d = Discussion::new("s1", vec!["a1".into(), "a2".into()], 2);
        assert!(!d.all_items_terminal());
        let mut item = ChecklistItem::new("a1", 2, ActionType::Hold, "ENRG", 0.0, 0.0, 50.0, "x");
        item.status = ItemStatus::Executed;
        d.checklist.push(item);
        assert!(d.all_items_terminal());
        let pending = ChecklistItem::new("a2", 2, ActionType::Buy, "ENRG", 10.0, 1.0, 50.0, "y");
        d.checklist.push(pending);
        assert!(!d.all_items_terminal());
    }

    #[test]
    fn serde_roundtrip_preserves_discussion() {
        let mut d = Discussion::new("s1", vec!["a1".into(), "a2".into()], 2);
        d.messages.push(Message::new("a1", 1, "watching", "HOLD ENRG", 0.5, true));
        let json = serde_json::to_string(&d).unwrap();
        let back: Discussion = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, d.id);
        assert_eq!(back.status, DiscussionStatus::InProgress);
        assert_eq!(back.messages.len(), 1);
        assert!(back.messages[0].observation);
    }
}
