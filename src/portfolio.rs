// =============================================================================
// Portfolio operations — invariant-preserving transitions on sector state
// =============================================================================
//
// State lives on the Sector record ({balance, position, holdings}) so a
// single collection write persists a transition together with the price it
// caused. Invariants enforced here:
//   - balance >= 0 and position >= 0 after every operation,
//   - position tracks the sum of holdings,
//   - rebalance leftovers return to balance,
//   - rebalancing an already-balanced portfolio is a no-op (up to EPSILON).
// =============================================================================

use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};
use crate::model::Sector;

/// Tolerance for "already balanced" comparisons.
pub const BALANCE_EPSILON: f64 = 1e-9;

/// Target shape for a rebalance.
#[derive(Debug, Clone)]
pub enum RebalanceTarget {
    /// Fraction of total value to keep invested, spread over current
    /// holdings (or the sector's primary symbol when nothing is held).
    Fraction(f64),
    /// Per-symbol fractions of total value. Must sum to <= 1; the remainder
    /// stays in balance.
    Ratios(BTreeMap<String, f64>),
}

impl Sector {
    /// BUY: move `amount` from balance into the position for `symbol`.
    pub fn apply_buy(&mut self, symbol: &str, amount: f64) -> CoreResult<()> {
        if amount <= 0.0 || !amount.is_finite() {
            return Err(CoreError::Validation(format!("invalid buy amount {amount}")));
        }
        if amount > self.balance + BALANCE_EPSILON {
            return Err(CoreError::InsufficientBalance {
                need: amount,
                available: self.balance,
            });
        }
        self.balance = (self.balance - amount).max(0.0);
        self.position += amount;
        *self.holdings.entry(symbol.to_uppercase()).or_insert(0.0) += amount;
        Ok(())
    }

    /// SELL: move `amount` from the position for `symbol` back into balance.
    pub fn apply_sell(&mut self, symbol: &str, amount: f64) -> CoreResult<()> {
        if amount <= 0.0 || !amount.is_finite() {
            return Err(CoreError::Validation(format!("invalid sell amount {amount}")));
        }
        let key = symbol.to_uppercase();
        let held = self.holdings.get(&key).copied().unwrap_or(0.0);
        if amount > held + BALANCE_EPSILON || amount > self.position + BALANCE_EPSILON {
            return Err(CoreError::InsufficientPosition {
                need: amount,
                available: held.min(self.position),
            });
        }
        self.position = (self.position - amount).max(0.0);
        self.balance += amount;
        let remaining = held - amount;
        if remaining <= BALANCE_EPSILON {
            self.holdings.remove(&key);
        } else {
            self.holdings.insert(key, remaining);
        }
        Ok(())
    }

    /// HOLD: no-op by contract.
    pub fn apply_hold(&mut self) {}

    /// REBALANCE: redistribute `balance + holdings` to the target; leftover
    /// returns to balance.
    pub fn apply_rebalance(&mut self, target: RebalanceTarget) -> CoreResult<()> {
        let total = self.balance + self.position;
        if total <= 0.0 {
            return Ok(());
        }

        let targets: BTreeMap<String, f64> = match target {
            RebalanceTarget::Fraction(fraction) => {
                if !(0.0..=1.0).contains(&fraction) || !fraction.is_finite() {
                    return Err(CoreError::Validation(format!(
                        "rebalance fraction {fraction} outside [0, 1]"
                    )));
                }
                let invested = total * fraction;
                if self.position > BALANCE_EPSILON && !self.holdings.is_empty() {
                    // Keep the current mix, scaled to the new invested total.
                    self.holdings
                        .iter()
                        .map(|(sym, held)| (sym.clone(), invested * held / self.position))
                        .collect()
                } else if invested > BALANCE_EPSILON {
                    BTreeMap::from([(self.symbol.clone(), invested)])
                } else {
                    BTreeMap::new()
                }
            }
            RebalanceTarget::Ratios(ratios) => {
                let sum: f64 = ratios.values().sum();
                if ratios.values().any(|r| *r < 0.0 || !r.is_finite()) || sum > 1.0 + BALANCE_EPSILON
                {
                    return Err(CoreError::Validation(
                        "rebalance ratios must be non-negative and sum to at most 1".into(),
                    ));
                }
                for symbol in ratios.keys() {
                    if !self.allows_symbol(symbol) {
                        return Err(CoreError::SymbolNotAllowed {
                            symbol: symbol.clone(),
                        });
                    }
                }
                ratios
                    .into_iter()
                    .filter(|(_, r)| *r > BALANCE_EPSILON)
                    .map(|(sym, r)| (sym.to_uppercase(), total * r))
                    .collect()
            }
        };

        let invested: f64 = targets.values().sum();
        self.holdings = targets;
        self.position = invested;
        self.balance = (total - invested).max(0.0);
        Ok(())
    }
}
