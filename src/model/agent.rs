// =============================================================================
// Agent — a deliberative actor with a role, personality, and confidence
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AgentRole, AgentStatus};

/// How an agent weighs risk when forming proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStyle {
    Conservative,
    Balanced,
    Aggressive,
}

impl Default for DecisionStyle {
    fn default() -> Self {
        Self::Balanced
    }
}

/// Fixed personality traits assigned at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Personality {
    /// In [0, 1]; 0.5 is neutral.
    #[serde(default = "default_risk_tolerance")]
    pub risk_tolerance: f64,
    #[serde(default)]
    pub decision_style: DecisionStyle,
}

fn default_risk_tolerance() -> f64 {
    0.5
}

impl Default for Personality {
    fn default() -> Self {
        Self {
            risk_tolerance: 0.5,
            decision_style: DecisionStyle::Balanced,
        }
    }
}

/// Rolling trade performance used by the confidence engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Performance {
    #[serde(default)]
    pub pnl: f64,
    /// In [0, 1].
    #[serde(default)]
    pub win_rate: f64,
    #[serde(default)]
    pub total_trades: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub sector_id: String,
    pub name: String,
    pub role: AgentRole,
    #[serde(default)]
    pub personality: Personality,
    /// In [-100, 100]; smoothed by the confidence engine on every tick.
    #[serde(default)]
    pub confidence: f64,
    /// In [0, 100].
    #[serde(default = "default_morale")]
    pub morale: u32,
    #[serde(default)]
    pub performance: Performance,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub rewards: i64,
    /// Manager memory: memos appended via the message-manager endpoint.
    /// Bounded to the most recent [`MANAGER_MEMORY_CAP`] entries.
    #[serde(default)]
    pub memory: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_morale() -> u32 {
    50
}

/// Most recent memos retained per manager.
pub const MANAGER_MEMORY_CAP: usize = 100;

impl Agent {
    pub fn new(
        sector_id: impl Into<String>,
        name: impl Into<String>,
        role: AgentRole,
        personality: Personality,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            sector_id: sector_id.into(),
            name: name.into(),
            role,
            personality,
            confidence: 0.0,
            morale: 50,
            performance: Performance::default(),
            status: AgentStatus::Idle,
            rewards: 0,
            memory: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_manager(&self) -> bool {
        self.role.is_manager()
    }

    /// Append a memo, evicting the oldest entries past the cap.
    pub fn remember(&mut self, memo: impl Into<String>) {
        self.memory.push(memo.into());
        while self.memory.len() > MANAGER_MEMORY_CAP {
            self.memory.remove(0);
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_agent_defaults() {
        let a = Agent::new("s1", "scout", AgentRole::Researcher, Personality::default());
        assert_eq!(a.sector_id, "s1");
        assert_eq!(a.morale, 50);
        assert_eq!(a.rewards, 0);
        assert_eq!(a.status, AgentStatus::Idle);
        assert!(!a.is_manager());
    }

    #[test]
    fn memory_is_capped() {
        let mut a = Agent::new("s1", "boss", AgentRole::Manager, Personality::default());
        for i in 0..(MANAGER_MEMORY_CAP + 10) {
            a.remember(format!("memo {i}"));
        }
        assert_eq!(a.memory.len(), MANAGER_MEMORY_CAP);
        assert_eq!(a.memory[0], "memo 10");
        assert_eq!(a.memory.last().unwrap(), &format!("memo {}", MANAGER_MEMORY_CAP + 9));
    }

    #[test]
    fn serde_roundtrip_preserves_agent() {
        let a = Agent::new(
            "s1",
            "quant",
            AgentRole::Analyst,
            Personality {
                risk_tolerance: 0.8,
                decision_style: DecisionStyle::Aggressive,
            },
        );
        let json = serde_json::to_string(&a).unwrap();
        let back: Agent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, a.id);
        assert_eq!(back.role, AgentRole::Analyst);
        assert_eq!(back.personality.decision_style, DecisionStyle::Aggressive);
        assert!((back.personality.risk_tolerance - 0.8).abs() < 1e-9);
    }

    #[test]
    fn missing_fields_fill_defaults() {
        // Older records without morale/personality keep loading.
        let json = r#"{
            "id": "A1", "sector_id": "s1", "name": "x", "role": "trader",
            "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let a: Agent = serde_json::from_str(json).unwrap();
        assert_eq!(a.morale, 50);
        assert!((a.personality.risk_tolerance - 0.5).abs() < 1e-9);
        assert_eq!(a.status, AgentStatus::Idle);
    }
}
