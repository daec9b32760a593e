// =============================================================================
// Candle Aggregator — rolls raw ticks into fixed-interval OHLCV candles
// =============================================================================
//
// One mutable "current" candle per (symbol, interval); finalized candles are
// immutable and contiguous. Rollover happens when a tick lands in a later
// bucket: the current candle freezes, joins the ring, and a new candle opens
// at the tick's price. Late ticks (earlier bucket) are dropped — finalized
// candles are never retroactively mutated.
//
// Thread-safety: all series live behind a single `parking_lot::RwLock`.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::PriceTick;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle. Mutable while current, immutable once finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Epoch seconds, aligned to the interval.
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    fn from_tick(bucket_start: i64, tick: &PriceTick) -> Self {
        Self {
            bucket_start,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
        }
    }

    fn apply_tick(&mut self, tick: &PriceTick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.volume;
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub interval_secs: u64,
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}s", self.symbol, self.interval_secs)
    }
}

/// Read-only view of one series for downstream consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    pub finalized: Vec<Candle>,
    pub current: Option<Candle>,
}

struct Series {
    finalized: VecDeque<Candle>,
    current: Option<Candle>,
}

impl Series {
    fn new(capacity: usize) -> Self {
        Self {
            finalized: VecDeque::with_capacity(capacity + 1),
            current: None,
        }
    }
}

// ---------------------------------------------------------------------------
// CandleAggregator
// ---------------------------------------------------------------------------

/// Aggregates per-instrument tick sequences into candle series, retaining at
/// most `max_candles` finalized candles per key plus one in-progress candle.
pub struct CandleAggregator {
    series: RwLock<HashMap<SeriesKey, Series>>,
    max_candles: usize,
}

impl CandleAggregator {
    pub fn new(max_candles: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Fold one tick into the series for `(tick.symbol, interval_secs)`.
    ///
    /// Returns the finalized candle when the tick caused a rollover, `None`
    /// otherwise. Callers must guarantee at-most-once delivery per tick if
    /// volume accuracy matters: high/low are idempotent under replay but
    /// volume accumulates.
    pub fn on_tick(&self, tick: &PriceTick, interval_secs: u64) -> Option<Candle> {
        let interval = interval_secs as i64;
        let bucket_start = tick.timestamp.div_euclid(interval) * interval;

        let key = SeriesKey {
            symbol: tick.symbol.clone(),
            interval_secs,
        };

        let mut map = self.series.write();
        let series = map
            .entry(key)
            .or_insert_with(|| Series::new(self.max_candles));

        match &mut series.current {
            Some(current) if bucket_start == current.bucket_start => {
                current.apply_tick(tick);
                None
            }
            Some(current) if bucket_start < current.bucket_start => {
                // Late tick from an already-finalized bucket.
                debug!(
                    symbol = %tick.symbol,
                    interval_secs,
                    tick_bucket = bucket_start,
                    current_bucket = current.bucket_start,
                    "late tick dropped"
                );
                None
            }
            Some(current) => {
                // Rollover: freeze the current candle, open a new one at the
                // triggering tick's price.
                let finalized = std::mem::replace(current, Candle::from_tick(bucket_start, tick));
                series.finalized.push_back(finalized.clone());
                while series.finalized.len() > self.max_candles {
                    series.finalized.pop_front();
                }
                Some(finalized)
            }
            None => {
                series.current = Some(Candle::from_tick(bucket_start, tick));
                None
            }
        }
    }

    /// Return the in-progress candle for a key, if any.
    pub fn current(&self, key: &SeriesKey) -> Option<Candle> {
        self.series
            .read()
            .get(key)
            .and_then(|s| s.current.clone())
    }

    /// Return the most recent `count` finalized candles (oldest-first order).
    pub fn finalized(&self, key: &SeriesKey, count: usize) -> Vec<Candle> {
        let map = self.series.read();
        match map.get(key) {
            Some(series) => {
                let start = series.finalized.len().saturating_sub(count);
                series.finalized.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Full read-only view of one series: all retained finalized candles plus
    /// the current candle.
    pub fn snapshot(&self, key: &SeriesKey) -> SeriesSnapshot {
        let map = self.series.read();
        match map.get(key) {
            Some(series) => SeriesSnapshot {
                finalized: series.finalized.iter().cloned().collect(),
                current: series.current.clone(),
            },
            None => SeriesSnapshot {
                finalized: Vec::new(),
                current: None,
            },
        }
    }

    /// Drop every series for `symbol` (all intervals). Called on unsubscribe.
    pub fn remove_symbol(&self, symbol: &str) {
        self.series.write().retain(|key, _| key.symbol != symbol);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, price: f64, volume: f64, timestamp: i64) -> PriceTick {
        PriceTick {
            symbol: symbol.into(),
            price,
            volume,
            timestamp,
        }
    }

    fn key(symbol: &str, interval_secs: u64) -> SeriesKey {
        SeriesKey {
            symbol: symbol.into(),
            interval_secs,
        }
    }

    #[test]
    fn first_tick_opens_flat_candle() {
        let agg = CandleAggregator::new(10);
        assert!(agg.on_tick(&tick("RELIANCE", 100.0, 5.0, 30), 60).is_none());

        let current = agg.current(&key("RELIANCE", 60)).unwrap();
        assert_eq!(current.bucket_start, 0);
        assert_eq!(current.open, 100.0);
        assert_eq!(current.high, 100.0);
        assert_eq!(current.low, 100.0);
        assert_eq!(current.close, 100.0);
        assert_eq!(current.volume, 5.0);
    }

    #[test]
    fn in_bucket_ticks_update_ohlcv() {
        let agg = CandleAggregator::new(10);
        agg.on_tick(&tick("RELIANCE", 100.0, 1.0, 0), 60);
        agg.on_tick(&tick("RELIANCE", 104.0, 2.0, 10), 60);
        agg.on_tick(&tick("RELIANCE", 98.0, 3.0, 20), 60);
        agg.on_tick(&tick("RELIANCE", 101.0, 4.0, 59), 60);

        let current = agg.current(&key("RELIANCE", 60)).unwrap();
        assert_eq!(current.open, 100.0);
        assert_eq!(current.high, 104.0);
        assert_eq!(current.low, 98.0);
        assert_eq!(current.close, 101.0);
        assert_eq!(current.volume, 10.0);
        // Candle invariant: high/low bound open and close.
        assert!(current.high >= current.open.max(current.close));
        assert!(current.low <= current.open.min(current.close));
    }

    #[test]
    fn rollover_finalizes_and_opens_at_tick_price() {
        // Scenario: interval=60s; ticks at t=0 (100), t=30 (105), t=61 (102).
        let agg = CandleAggregator::new(10);
        assert!(agg.on_tick(&tick("RELIANCE", 100.0, 1.0, 0), 60).is_none());
        assert!(agg.on_tick(&tick("RELIANCE", 105.0, 1.0, 30), 60).is_none());

        let finalized = agg.on_tick(&tick("RELIANCE", 102.0, 1.0, 61), 60).unwrap();
        assert_eq!(finalized.bucket_start, 0);
        assert_eq!(finalized.open, 100.0);
        assert_eq!(finalized.high, 105.0);
        assert_eq!(finalized.low, 100.0);
        assert_eq!(finalized.close, 105.0);

        let current = agg.current(&key("RELIANCE", 60)).unwrap();
        assert_eq!(current.bucket_start, 60);
        assert_eq!(current.open, 102.0);
        assert_eq!(current.high, 102.0);
        assert_eq!(current.low, 102.0);
        assert_eq!(current.close, 102.0);
    }

    #[test]
    fn finalized_series_is_contiguous() {
        let agg = CandleAggregator::new(10);
        for i in 0..5 {
            agg.on_tick(&tick("INFY", 100.0 + i as f64, 1.0, i * 60), 60);
        }

        let finalized = agg.finalized(&key("INFY", 60), 10);
        assert_eq!(finalized.len(), 4);
        for pair in finalized.windows(2) {
            assert_eq!(pair[1].bucket_start, pair[0].bucket_start + 60);
        }
    }

    #[test]
    fn late_tick_is_dropped() {
        let agg = CandleAggregator::new(10);
        agg.on_tick(&tick("RELIANCE", 100.0, 1.0, 0), 60);
        agg.on_tick(&tick("RELIANCE", 102.0, 1.0, 65), 60);

        // A tick from the already-finalized [0, 60) bucket.
        assert!(agg.on_tick(&tick("RELIANCE", 999.0, 1.0, 10), 60).is_none());

        let finalized = agg.finalized(&key("RELIANCE", 60), 10);
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].high, 100.0);
        let current = agg.current(&key("RELIANCE", 60)).unwrap();
        assert_eq!(current.close, 102.0);
    }

    #[test]
    fn ring_trims_to_max_candles() {
        let agg = CandleAggregator::new(3);
        for i in 0..6 {
            agg.on_tick(&tick("RELIANCE", 100.0 + i as f64, 1.0, i * 60), 60);
        }

        let finalized = agg.finalized(&key("RELIANCE", 60), 10);
        assert_eq!(finalized.len(), 3);
        // Oldest evicted: buckets 120, 180, 240 remain.
        assert_eq!(finalized[0].bucket_start, 120);
        assert_eq!(finalized[2].bucket_start, 240);
    }

    #[test]
    fn quiet_buckets_are_absent_from_series() {
        // No ticks in [60,120): the next candle opens at its own bucket, the
        // empty bucket is simply absent from the series.
        let agg = CandleAggregator::new(10);
        agg.on_tick(&tick("RELIANCE", 100.0, 1.0, 0), 60);
        let finalized = agg.on_tick(&tick("RELIANCE", 103.0, 1.0, 130), 60).unwrap();
        assert_eq!(finalized.bucket_start, 0);
        assert_eq!(agg.current(&key("RELIANCE", 60)).unwrap().bucket_start, 120);
    }

    #[test]
    fn intervals_are_independent_series() {
        let agg = CandleAggregator::new(10);
        agg.on_tick(&tick("RELIANCE", 100.0, 1.0, 290), 60);
        agg.on_tick(&tick("RELIANCE", 100.0, 1.0, 290), 300);
        agg.on_tick(&tick("RELIANCE", 105.0, 1.0, 310), 60);
        agg.on_tick(&tick("RELIANCE", 105.0, 1.0, 310), 300);

        // 60s series rolled over; 300s series is still in its first bucket.
        assert_eq!(agg.finalized(&key("RELIANCE", 60), 10).len(), 1);
        assert_eq!(agg.finalized(&key("RELIANCE", 300), 10).len(), 0);
        assert_eq!(agg.current(&key("RELIANCE", 300)).unwrap().high, 105.0);
    }

    #[test]
    fn remove_symbol_clears_all_intervals() {
        let agg = CandleAggregator::new(10);
        agg.on_tick(&tick("RELIANCE", 100.0, 1.0, 0), 60);
        agg.on_tick(&tick("RELIANCE", 100.0, 1.0, 0), 300);
        agg.on_tick(&tick("INFY", 1500.0, 1.0, 0), 60);

        agg.remove_symbol("RELIANCE");
        assert!(agg.current(&key("RELIANCE", 60)).is_none());
        assert!(agg.current(&key("RELIANCE", 300)).is_none());
        assert!(agg.current(&key("INFY", 60)).is_some());
    }

    #[test]
    fn snapshot_exposes_finalized_and_current() {
        let agg = CandleAggregator::new(10);
        agg.on_tick(&tick("RELIANCE", 100.0, 1.0, 0), 60);
        agg.on_tick(&tick("RELIANCE", 101.0, 1.0, 61), 60);

        let snap = agg.snapshot(&key("RELIANCE", 60));
        assert_eq!(snap.finalized.len(), 1);
        assert_eq!(snap.current.as_ref().unwrap().bucket_start, 60);

        let empty = agg.snapshot(&key("UNKNOWN", 60));
        assert!(empty.finalized.is_empty());
        assert!(empty.current.is_none());
    }
}
