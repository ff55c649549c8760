// =============================================================================
// Persisted entities — sectors, agents, discussions, execution logs
// =============================================================================

pub mod agent;
pub mod discussion;
pub mod execution_log;
pub mod sector;

pub use agent::{Agent, Performance, Personality};
pub use discussion::{
    ChecklistItem, Discussion, ManagerDecision, Message, RoundSnapshot, ScoreBreakdown,
    ScoreRecord,
};
pub use execution_log::ExecutionLog;
pub use sector::{ExecutionTicket, Sector, UserAccount};

use serde::{Deserialize, Serialize};

/// Additive confidence adjustment applied by the confidence engine.
///
/// `target` is an agent role name, an agent id, or `"*"` for everyone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationRule {
    pub id: String,
    pub target: String,
    #[serde(default)]
    pub adjustment: f64,
    #[serde(default)]
    pub note: String,
}

impl SimulationRule {
    /// Whether this rule applies to the given agent.
    pub fn applies_to(&self, agent_id: &str, role: crate::types::AgentRole) -> bool {
        self.target == "*"
            || self.target.eq_ignore_ascii_case(agent_id)
            || self.target.eq_ignore_ascii_case(role.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentRole;

    #[test]
    fn rule_targeting() {
        let wildcard = SimulationRule {
            id: "r1".into(),
            target: "*".into(),
            adjustment: 5.0,
            note: String::new(),
        };
        let by_role = SimulationRule {
            id: "r2".into(),
            target: "trader".into(),
            adjustment: -3.0,
            note: String::new(),
        };
        let by_id = SimulationRule {
            id: "r3".into(),
            target: "agent-7".into(),
            adjustment: 1.0,
            note: String::new(),
        };

        assert!(wildcard.applies_to("agent-1", AgentRole::Risk));
        assert!(by_role.applies_to("agent-1", AgentRole::Trader));
        assert!(!by_role.applies_to("agent-1", AgentRole::Risk));
        assert!(by_id.applies_to("agent-7", AgentRole::General));
        assert!(!by_id.applies_to("agent-8", AgentRole::General));
    }
}
