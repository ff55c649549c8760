// =============================================================================
// Confidence engine — per-agent confidence from market, performance,
// personality, morale, and configured simulation rules
// =============================================================================
//
// Deterministic given its inputs. The raw value is smoothed against the
// previous confidence (70/30) and clamped to [-100, 100].
//
// The discussion gate lives here too: a sector is discussion-ready iff every
// non-manager agent sits at or above the gate, no discussion is active, and
// the cooldown has elapsed. Manager confidence is the mean of non-managers
// and is never part of the gate.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::market_data::MarketSnapshot;
use crate::model::{Agent, SimulationRule};
use crate::model::agent::DecisionStyle;
use crate::types::AgentRole;

/// Confidence a non-manager must reach before a discussion can open.
/// Exactly the gate value passes; anything below does not.
pub const CONFIDENCE_GATE: f64 = 65.0;

/// Volatility above which personality interaction kicks in.
const HIGH_VOLATILITY: f64 = 0.03;

/// Smoothing weights: `new = prev * PREV_WEIGHT + raw * RAW_WEIGHT`.
const PREV_WEIGHT: f64 = 0.7;
const RAW_WEIGHT: f64 = 0.3;

/// Role base confidence table.
pub fn role_base(role: AgentRole) -> f64 {
    match role {
        AgentRole::Manager => 20.0,
        AgentRole::Researcher | AgentRole::Analyst => 30.0,
        AgentRole::Trader => 15.0,
        AgentRole::Execution => 10.0,
        AgentRole::Risk => 5.0,
        AgentRole::Advisor => 25.0,
        AgentRole::General => 10.0,
    }
}

fn market_influence(market: &MarketSnapshot) -> f64 {
    let volume_term = ((market.volume + 1.0).log10() * 2.0).clamp(0.0, 10.0);
    2.0 * market.change_percent + volume_term - 500.0 * market.volatility
        + (50.0 - market.risk_score as f64) * 0.4
        + 5.0 * market.avg_candle_change
}

fn performance_influence(agent: &Agent) -> f64 {
    let perf = &agent.performance;
    (perf.win_rate - 0.5) * 60.0
        + (perf.pnl / 1000.0).clamp(-20.0, 20.0)
        + ((perf.total_trades as f64 + 1.0).log10()).min(5.0)
}

fn personality_influence(agent: &Agent, market: &MarketSnapshot) -> f64 {
    let p = &agent.personality;
    let tolerance_term = ((p.risk_tolerance - 0.5) * 20.0).clamp(-10.0, 10.0);
    let style_term = match p.decision_style {
        DecisionStyle::Aggressive => 5.0,
        DecisionStyle::Balanced => 0.0,
        DecisionStyle::Conservative => -5.0,
    };
    // High volatility rewards tolerant agents mildly and rattles the rest.
    let volatility_term = if market.volatility > HIGH_VOLATILITY {
        if p.risk_tolerance >= 0.5 {
            5.0
        } else {
            -10.0
        }
    } else {
        0.0
    };
    tolerance_term + style_term + volatility_term
}

fn morale_influence(agent: &Agent) -> f64 {
    (agent.morale as f64 - 50.0) * 0.4
}

fn rules_adjustment(agent: &Agent, rules: &[SimulationRule]) -> f64 {
    rules
        .iter()
        .filter(|r| r.applies_to(&agent.id, agent.role))
        .map(|r| r.adjustment)
        .sum()
}

/// Raw (unsmoothed) confidence for an agent.
pub fn raw_confidence(agent: &Agent, market: &MarketSnapshot, rules: &[SimulationRule]) -> f64 {
    role_base(agent.role)
        + market_influence(market)
        + performance_influence(agent)
        + personality_influence(agent, market)
        + morale_influence(agent)
        + rules_adjustment(agent, rules)
}

/// Next confidence: smoothed against the previous value and clamped.
pub fn next_confidence(agent: &Agent, market: &MarketSnapshot, rules: &[SimulationRule]) -> f64 {
    let raw = raw_confidence(agent, market, rules);
    (agent.confidence * PREV_WEIGHT + raw * RAW_WEIGHT).clamp(-100.0, 100.0)
}

/// Manager confidence: mean of non-manager confidences (0 when there are
/// none).
pub fn manager_confidence(agents: &[Agent]) -> f64 {
    let workers: Vec<&Agent> = agents.iter().filter(|a| !a.is_manager()).collect();
    if workers.is_empty() {
        return 0.0;
    }
    workers.iter().map(|a| a.confidence).sum::<f64>() / workers.len() as f64
}

/// Gate on confidences alone: every non-manager at or above `gate`.
pub fn workers_meet_gate(agents: &[Agent], gate: f64) -> bool {
    let mut saw_worker = false;
    for agent in agents.iter().filter(|a| !a.is_manager()) {
        saw_worker = true;
        if agent.confidence < gate {
            return false;
        }
    }
    saw_worker
}

/// Full discussion-readiness check for a sector.
pub fn discussion_ready(
    agents: &[Agent],
    gate: f64,
    has_active_discussion: bool,
    cooldown_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if has_active_discussion {
        return false;
    }
    if let Some(until) = cooldown_until {
        if now < until {
            return false;
        }
    }
    workers_meet_gate(agents, gate)
}
