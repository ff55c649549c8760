// =============================================================================
// Price model — deterministic price update from action impact + trend + noise
// =============================================================================
//
// new = max(EPSILON, prev * (1 + impact + trend * DT + noise))
//
// where noise = noise_unit * volatility * sqrt(DT), noise_unit in [-1, 1].
// The model is pure: the caller draws the noise unit and persists the result
// alongside its portfolio deltas.
// =============================================================================

use crate::types::ActionType;

/// One trading day as a fraction of a trading year.
pub const DT: f64 = 1.0 / 252.0;

/// Floor for the resulting price.
pub const EPSILON: f64 = 0.000_001;

/// Price impact of an executed action. These constants are part of the
/// engine's contract.
pub fn manager_impact(action: ActionType) -> f64 {
    match action {
        ActionType::Buy => 0.002,
        ActionType::Sell => -0.002,
        ActionType::Hold => 0.000_1,
        ActionType::Rebalance => 0.000_5,
    }
}

/// Compute the next price.
///
/// `noise_unit` must lie in [-1, 1]; it is clamped defensively. Pass `0.0`
/// for a noiseless (fully deterministic) update.
pub fn new_price(
    prev: f64,
    manager_impact: f64,
    trend_factor: f64,
    volatility: f64,
    noise_unit: f64,
) -> f64 {
    let noise = noise_unit.clamp(-1.0, 1.0) * volatility * DT.sqrt();
    let next = prev * (1.0 + manager_impact + trend_factor * DT + noise);
    next.max(EPSILON)
}

/// Uniform noise unit in [-1, 1].
pub fn draw_noise_unit<R: rand::Rng>(rng: &mut R) -> f64 {
    rng.gen_range(-1.0..=1.0)
}
