// =============================================================================
// Manager scorer — multi-factor scoring and approve/revise/reject decisions
// =============================================================================
//
// score = w1 * worker_confidence
//       + w2 * expected_impact
//       + w3 * (100 - risk_level)
//       + w4 * alignment_with_sector_goal
//
// Weights are configuration and sum to 1. Decision policy:
//   score >= threshold                      -> APPROVED
//   threshold-10 <= score < threshold AND
//     revision_count < MAX_REVISIONS AND
//     rejection-refinement enabled          -> REVISE_REQUIRED
//   otherwise                               -> REJECTED
//
// Hard constraints (symbol not allowed) are rejected before scoring with a
// reason the revision logic treats as non-revisable.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::model::{ChecklistItem, ScoreBreakdown, ScoreRecord, Sector};
use crate::types::{ActionType, ItemStatus};

/// Default approval threshold; part of the engine contract.
pub const APPROVAL_THRESHOLD: f64 = 65.0;

/// Band below the threshold in which revision (rather than rejection) is
/// offered.
pub const REVISE_BAND: f64 = 10.0;

/// Maximum revisions per item chain.
pub const MAX_REVISIONS: u32 = 2;

/// Trend magnitude (percent) under which HOLD counts as aligned.
const HOLD_ALIGNMENT_BAND: f64 = 0.5;

/// Scoring weights. `Default` sums to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScorerWeights {
    pub worker_confidence: f64,
    pub expected_impact: f64,
    pub risk_level: f64,
    pub alignment: f64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        Self {
            worker_confidence: 0.30,
            expected_impact: 0.20,
            risk_level: 0.30,
            alignment: 0.20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerScorer {
    pub weights: ScorerWeights,
    pub approval_threshold: f64,
    pub rejection_refinement: bool,
}

impl Default for ManagerScorer {
    fn default() -> Self {
        Self {
            weights: ScorerWeights::default(),
            approval_threshold: APPROVAL_THRESHOLD,
            rejection_refinement: true,
        }
    }
}

impl ManagerScorer {
    /// Directional alignment of an action with the sector trend, in [0, 100].
    fn alignment(action: ActionType, trend_percent: f64) -> f64 {
        let aligned = match action {
            ActionType::Buy => trend_percent > 0.0,
            ActionType::Sell => trend_percent < 0.0,
            ActionType::Hold => trend_percent.abs() < HOLD_ALIGNMENT_BAND,
            ActionType::Rebalance => trend_percent.abs() <= 1.0,
        };
        if aligned {
            100.0
        } else {
            (100.0 - trend_percent.abs() * 25.0).clamp(0.0, 100.0)
        }
    }

    /// Expected impact: allocation-scaled trend capture, centered at 50.
    fn expected_impact(item: &ChecklistItem, trend_percent: f64) -> f64 {
        let direction = match item.action_type {
            ActionType::Buy => 1.0,
            ActionType::Sell => -1.0,
            ActionType::Hold => 0.0,
            ActionType::Rebalance => 0.5,
        };
        (50.0 + trend_percent * item.allocation_percent * direction).clamp(0.0, 100.0)
    }

    /// Risk of the item: sector riskiness blended with the exposure the item
    /// takes relative to total sector value.
    fn risk_level(item: &ChecklistItem, sector: &Sector) -> f64 {
        let total = sector.balance + sector.position;
        let exposure_pct = if total > 0.0 {
            (item.amount / total * 100.0).clamp(0.0, 100.0)
        } else {
            100.0
        };
        (0.3 * sector.risk_score as f64 + 0.7 * exposure_pct).clamp(0.0, 100.0)
    }

    /// Compute the full score record for an item.
    pub fn score_item(&self, item: &ChecklistItem, sector: &Sector) -> ScoreRecord {
        let trend = sector.trend_percent();

        let breakdown = ScoreBreakdown {
            worker_confidence: item.confidence,
            expected_impact: Self::expected_impact(item, trend),
            risk_level: Self::risk_level(item, sector),
            alignment_with_sector_goal: Self::alignment(item.action_type, trend),
        };

        let w = &self.weights;
        let score = w.worker_confidence * breakdown.worker_confidence
            + w.expected_impact * breakdown.expected_impact
            + w.risk_level * (100.0 - breakdown.risk_level)
            + w.alignment * breakdown.alignment_with_sector_goal;

        ScoreRecord {
            score,
            approval_threshold: self.approval_threshold,
            breakdown,
            reason: String::new(),
            required_improvements: Vec::new(),
        }
    }

    /// Score an item and decide its fate.
    pub fn decide(&self, item: &ChecklistItem, sector: &Sector) -> (ItemStatus, ScoreRecord) {
        // Hard constraint: never revisable, rejected before scoring.
        if !sector.allows_symbol(&item.symbol) {
            let mut record = ScoreRecord {
                score: 0.0,
                approval_threshold: self.approval_threshold,
                breakdown: ScoreBreakdown::default(),
                reason: format!("symbol {} not allowed by sector policy", item.symbol),
                required_improvements: vec![format!(
                    "propose one of: {}",
                    sector.allowed_symbols.join(", ")
                )],
            };
            record.breakdown.worker_confidence = item.confidence;
            return (ItemStatus::Rejected, record);
        }

        let mut record = self.score_item(item, sector);

        if record.score >= self.approval_threshold {
            record.reason = format!(
                "approved: score {:.1} meets threshold {:.0}",
                record.score, self.approval_threshold
            );
            return (ItemStatus::Approved, record);
        }

        let revisable = record.score >= self.approval_threshold - REVISE_BAND
            && item.revision_count < MAX_REVISIONS
            && self.rejection_refinement;

        // Name the dominant deficit so the revision path knows how to react.
        let risk_driven = record.breakdown.risk_level > 50.0;
        if risk_driven {
            record.reason = format!(
                "risk too high: risk level {:.1} drags score {:.1} below threshold {:.0}",
                record.breakdown.risk_level, record.score, self.approval_threshold
            );
            record.required_improvements.push("reduce position size".into());
        } else {
            record.reason = format!(
                "score {:.1} below threshold {:.0}",
                record.score, self.approval_threshold
            );
            record
                .required_improvements
                .push("strengthen the case or wait for a clearer trend".into());
        }

        if revisable {
            (ItemStatus::ReviseRequired, record)
        } else {
            (ItemStatus::Rejected, record)
        }
    }
}
