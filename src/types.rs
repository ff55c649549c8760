// =============================================================================
// Shared types used across the Concord sector engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Whether prices move in response to executed actions or are pinned to an
/// external feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    Simulation,
    Realtime,
}

impl Default for SystemMode {
    fn default() -> Self {
        Self::Simulation
    }
}

impl std::fmt::Display for SystemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulation => write!(f, "simulation"),
            Self::Realtime => write!(f, "realtime"),
        }
    }
}

/// Executable action proposed by an agent and carried on a checklist item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionType {
    Buy,
    Sell,
    Hold,
    Rebalance,
}

impl ActionType {
    /// Parse from the uppercase wire form ("BUY", "SELL", ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            "HOLD" => Some(Self::Hold),
            "REBALANCE" => Some(Self::Rebalance),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
            Self::Rebalance => "REBALANCE",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role a deliberative agent plays inside its sector. Exactly one `Manager`
/// exists per sector; all other roles participate in discussions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Manager,
    Researcher,
    Analyst,
    Trader,
    Execution,
    Risk,
    Advisor,
    General,
}

impl AgentRole {
    pub fn is_manager(&self) -> bool {
        matches!(self, Self::Manager)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "manager" => Some(Self::Manager),
            "researcher" => Some(Self::Researcher),
            "analyst" => Some(Self::Analyst),
            "trader" => Some(Self::Trader),
            "execution" => Some(Self::Execution),
            "risk" => Some(Self::Risk),
            "advisor" => Some(Self::Advisor),
            "general" => Some(Self::General),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Researcher => "researcher",
            Self::Analyst => "analyst",
            Self::Trader => "trader",
            Self::Execution => "execution",
            Self::Risk => "risk",
            Self::Advisor => "advisor",
            Self::General => "general",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether an agent is currently deliberating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Active,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Idle
    }
}

/// Lifecycle status of a discussion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscussionStatus {
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "DECIDED")]
    Decided,
}

impl std::fmt::Display for DiscussionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Decided => write!(f, "DECIDED"),
        }
    }
}

/// Status of a checklist item. Items are append-only: a revision creates a
/// new item; the statuses below are the only in-place transitions allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    Approved,
    ReviseRequired,
    Resubmitted,
    Rejected,
    AcceptRejection,
    Executed,
}

impl ItemStatus {
    /// Terminal statuses: nothing further happens to the item, and a
    /// discussion can close once every item is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::AcceptRejection | Self::Executed)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::ReviseRequired => "REVISE_REQUIRED",
            Self::Resubmitted => "RESUBMITTED",
            Self::Rejected => "REJECTED",
            Self::AcceptRejection => "ACCEPT_REJECTION",
            Self::Executed => "EXECUTED",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_type_wire_form_roundtrips() {
        for (action, wire) in [
            (ActionType::Buy, "\"BUY\""),
            (ActionType::Sell, "\"SELL\""),
            (ActionType::Hold, "\"HOLD\""),
            (ActionType::Rebalance, "\"REBALANCE\""),
        ] {
            assert_eq!(serde_json::to_string(&action).unwrap(), wire);
            let back: ActionType = serde_json::from_str(wire).unwrap();
            assert_eq!(back, action);
        }
    }

    #[test]
    fn action_type_parse_is_case_insensitive() {
        assert_eq!(ActionType::parse("buy"), Some(ActionType::Buy));
        assert_eq!(ActionType::parse(" Rebalance "), Some(ActionType::Rebalance));
        assert_eq!(ActionType::parse("short"), None);
    }

    #[test]
    fn role_parse_and_display_agree() {
        for role in [
            AgentRole::Manager,
            AgentRole::Researcher,
            AgentRole::Analyst,
            AgentRole::Trader,
            AgentRole::Execution,
            AgentRole::Risk,
            AgentRole::Advisor,
            AgentRole::General,
        ] {
            assert_eq!(AgentRole::parse(&role.to_string()), Some(role));
        }
    }

    #[test]
    fn item_terminal_statuses() {
        assert!(ItemStatus::Rejected.is_terminal());
        assert!(ItemStatus::AcceptRejection.is_terminal());
        assert!(ItemStatus::Executed.is_terminal());
        assert!(!ItemStatus::Pending.is_terminal());
        assert!(!ItemStatus::Approved.is_terminal());
        assert!(!ItemStatus::ReviseRequired.is_terminal());
        assert!(!ItemStatus::Resubmitted.is_terminal());
    }

    #[test]
    fn discussion_status_wire_form() {
        assert_eq!(
            serde_json::to_string(&DiscussionStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
        assert_eq!(
            serde_json::to_string(&DiscussionStatus::Decided).unwrap(),
            "\"DECIDED\""
        );
    }
}
