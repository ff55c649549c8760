// =============================================================================
// Simulated market data — per-sector candle ring and market snapshot
// =============================================================================
//
// There is no external feed: each sector tick records one candle from the
// sector's current price plus a simulated volume, and the confidence engine
// reads its signals from the resulting ring.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::model::Sector;

/// Candles retained per sector.
const CANDLE_RING_CAP: usize = 500;

/// A single simulated OHLCV candle. One candle is recorded per sector tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Close-over-open change as a fraction.
    pub fn change(&self) -> f64 {
        if self.open > 0.0 {
            (self.close - self.open) / self.open
        } else {
            0.0
        }
    }
}

/// Thread-safe per-sector candle rings.
#[derive(Default)]
pub struct CandleFeed {
    rings: RwLock<HashMap<String, VecDeque<Candle>>>,
}

pub type SharedCandleFeed = Arc<CandleFeed>;

impl CandleFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one candle for `sector_id` at `price` with the given volume.
    /// The open is the previous close (or `price` for the first candle).
    pub fn record(&self, sector_id: &str, price: f64, volume: f64, open_time: i64) {
        let mut rings = self.rings.write();
        let ring = rings.entry(sector_id.to_string()).or_default();

        let open = ring.back().map(|c| c.close).unwrap_or(price);
        ring.push_back(Candle {
            open_time,
            open,
            high: open.max(price),
            low: open.min(price),
            close: price,
            volume,
        });
        while ring.len() > CANDLE_RING_CAP {
            ring.pop_front();
        }
    }

    /// The most recent `count` candles, oldest first.
    pub fn recent(&self, sector_id: &str, count: usize) -> Vec<Candle> {
        let rings = self.rings.read();
        match rings.get(sector_id) {
            Some(ring) => ring.iter().rev().take(count).rev().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Mean close-over-open change of the last `count` candles, as a percent.
    pub fn avg_change_percent(&self, sector_id: &str, count: usize) -> f64 {
        let candles = self.recent(sector_id, count);
        if candles.is_empty() {
            return 0.0;
        }
        candles.iter().map(|c| c.change() * 100.0).sum::<f64>() / candles.len() as f64
    }

    pub fn drop_sector(&self, sector_id: &str) {
        self.rings.write().remove(sector_id);
    }
}

/// Signals the confidence engine consumes, snapshotted once per tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub change_percent: f64,
    pub volume: f64,
    pub volatility: f64,
    pub risk_score: u32,
    pub trend_percent: f64,
    /// Mean change of the last five candles, in percent.
    pub avg_candle_change: f64,
}

impl MarketSnapshot {
    pub fn capture(sector: &Sector, feed: &CandleFeed, volume: f64) -> Self {
        Self {
            change_percent: sector.change_percent,
            volume,
            volatility: sector.volatility,
            risk_score: sector.risk_score,
            trend_percent: sector.trend_percent(),
            avg_candle_change: feed.avg_change_percent(&sector.id, 5),
        }
    }
}
