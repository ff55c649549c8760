// =============================================================================
// Sector — an asset-like container owning agents, a portfolio, and a price
// =============================================================================
//
// Invariants:
//   - balance >= 0 and position >= 0 at all times.
//   - current_price > 0.
//   - at most one IN_PROGRESS discussion references this sector.
//
// The sector record carries the portfolio fields directly so that a single
// atomic write to the `sectors` collection persists `{balance, position,
// holdings, current_price}` together, as the execution engine requires.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::SystemMode;

/// Reference to an approved checklist item waiting in the sector's FIFO
/// execution queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTicket {
    pub discussion_id: String,
    pub item_id: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sector {
    pub id: String,
    pub name: String,
    /// Primary trading symbol for the sector (always a member of
    /// `allowed_symbols`).
    pub symbol: String,

    // ── Portfolio ───────────────────────────────────────────────────────
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub position: f64,
    #[serde(default)]
    pub holdings: BTreeMap<String, f64>,

    // ── Price model state ───────────────────────────────────────────────
    pub current_price: f64,
    pub initial_price: f64,
    #[serde(default)]
    pub change: f64,
    #[serde(default)]
    pub change_percent: f64,
    #[serde(default)]
    pub last_price_update: Option<DateTime<Utc>>,

    // ── Market character ────────────────────────────────────────────────
    /// Volatility in [0, 1]; scales the bounded price noise.
    #[serde(default)]
    pub volatility: f64,
    /// Risk score in [0, 100].
    #[serde(default)]
    pub risk_score: u32,
    /// Trend factor in [-1, 1]; drifts the price per trading day.
    #[serde(default)]
    pub trend_factor: f64,

    pub allowed_symbols: Vec<String>,

    // ── Ownership by id ─────────────────────────────────────────────────
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub discussion_ids: Vec<String>,
    #[serde(default)]
    pub execution_queue: Vec<ExecutionTicket>,

    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mode: SystemMode,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sector {
    pub fn new(
        name: impl Into<String>,
        symbol: impl Into<String>,
        initial_balance: f64,
        initial_price: f64,
        volatility: f64,
        risk_score: u32,
        trend_factor: f64,
        allowed_symbols: Vec<String>,
        mode: SystemMode,
    ) -> Self {
        let now = Utc::now();
        let symbol = symbol.into().to_uppercase();
        let mut allowed: Vec<String> =
            allowed_symbols.into_iter().map(|s| s.to_uppercase()).collect();
        if !allowed.contains(&symbol) {
            allowed.push(symbol.clone());
        }

        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            symbol,
            balance: initial_balance,
            position: 0.0,
            holdings: BTreeMap::new(),
            current_price: initial_price,
            initial_price,
            change: 0.0,
            change_percent: 0.0,
            last_price_update: None,
            volatility: volatility.clamp(0.0, 1.0),
            risk_score: risk_score.min(100),
            trend_factor: trend_factor.clamp(-1.0, 1.0),
            allowed_symbols: allowed,
            agent_ids: Vec::new(),
            discussion_ids: Vec::new(),
            execution_queue: Vec::new(),
            cooldown_until: None,
            mode,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn allows_symbol(&self, symbol: &str) -> bool {
        self.allowed_symbols.iter().any(|s| s.eq_ignore_ascii_case(symbol))
    }

    /// Trend expressed as a percentage of the initial price. This is what the
    /// manager scorer aligns actions against.
    pub fn trend_percent(&self) -> f64 {
        self.change_percent
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|t| now < t).unwrap_or(false)
    }

    /// Record a new price, keeping the change fields consistent.
    pub fn set_price(&mut self, price: f64, now: DateTime<Utc>) {
        self.change = price - self.current_price;
        self.change_percent = if self.current_price > 0.0 {
            (price - self.current_price) / self.current_price * 100.0
        } else {
            0.0
        };
        self.current_price = price;
        self.last_price_update = Some(now);
        self.updated_at = now;
    }

    /// Market data sanity gate: a discussion only opens against a sector whose
    /// price and volatility are well-formed.
    pub fn market_data_valid(&self) -> bool {
        self.current_price > 0.0
            && self.current_price.is_finite()
            && (0.0..=1.0).contains(&self.volatility)
    }
}

/// External user account that funds sectors and receives refunds on delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    #[serde(default)]
    pub balance: f64,
    pub updated_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn new(balance: f64) -> Self {
        Self {
            id: "primary".to_string(),
            balance,
            updated_at: Utc::now(),
        }
    }
}
