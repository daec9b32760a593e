// =============================================================================
// Stop-Loss Monitor — exit condition detection and auto-close
// =============================================================================
//
// Two independent inputs drive evaluation:
//   1. Every price update for a symbol (Price / Percent / CandleHigh /
//      CandleLow stops), invoked synchronously from the tick pipeline.
//   2. One scheduled task per Duration stop, armed at open and cancelled by
//      the close path, so a position expires even when no tick ever arrives.
//
// Every trigger routes through `PositionLedger::close`. A position that was
// already closed by a competing path (manual close racing a stop-loss) is a
// silent no-op, logged at debug level.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::account::TradeRecord;
use crate::errors::LedgerError;
use crate::market_data::{CandleAggregator, SeriesKey};
use crate::position_ledger::{Position, PositionLedger};
use crate::types::{CloseReason, TradeDirection};

/// Candle timeframe assumed when a candle stop does not name one.
const DEFAULT_CANDLE_TIMEFRAME_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Stop-loss configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopLossKind {
    /// Absolute trigger price.
    Price,
    /// Percent adverse move from entry; converted to a Price trigger at open.
    Percent,
    /// Close after a fixed lifetime regardless of price movement.
    Duration,
    /// Current candle high breaches the configured level.
    CandleHigh,
    /// Current candle low breaches the configured level.
    CandleLow,
}

/// Exit condition owned by exactly one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopLossConfig {
    pub kind: StopLossKind,
    /// Price level, percent, or lifetime seconds depending on `kind`.
    pub value: f64,
    /// Candle timeframe for CandleHigh/CandleLow.
    #[serde(default)]
    pub timeframe_secs: Option<u64>,
    /// Epoch seconds; set at arm time for Duration stops.
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Absolute trigger; set at arm time for Price/Percent stops.
    #[serde(default)]
    pub trigger_price: Option<f64>,
}

impl StopLossConfig {
    pub fn price(level: f64) -> Self {
        Self {
            kind: StopLossKind::Price,
            value: level,
            timeframe_secs: None,
            expires_at: None,
            trigger_price: None,
        }
    }

    pub fn percent(pct: f64) -> Self {
        Self {
            kind: StopLossKind::Percent,
            value: pct,
            timeframe_secs: None,
            expires_at: None,
            trigger_price: None,
        }
    }

    pub fn duration(lifetime_secs: u64) -> Self {
        Self {
            kind: StopLossKind::Duration,
            value: lifetime_secs as f64,
            timeframe_secs: None,
            expires_at: None,
            trigger_price: None,
        }
    }

    pub fn candle_high(level: f64, timeframe_secs: u64) -> Self {
        Self {
            kind: StopLossKind::CandleHigh,
            value: level,
            timeframe_secs: Some(timeframe_secs),
            expires_at: None,
            trigger_price: None,
        }
    }

    pub fn candle_low(level: f64, timeframe_secs: u64) -> Self {
        Self {
            kind: StopLossKind::CandleLow,
            value: level,
            timeframe_secs: Some(timeframe_secs),
            expires_at: None,
            trigger_price: None,
        }
    }

    /// Resolve entry-time-dependent fields, once, when the position opens:
    /// Percent becomes an absolute trigger price, Duration an absolute
    /// expiry timestamp.
    pub(crate) fn armed(mut self, entry_price: f64, direction: TradeDirection, now: i64) -> Self {
        match self.kind {
            StopLossKind::Price => {
                self.trigger_price = Some(self.value);
            }
            StopLossKind::Percent => {
                let offset = entry_price * self.value / 100.0;
                self.trigger_price = Some(match direction {
                    TradeDirection::Long => entry_price - offset,
                    TradeDirection::Short => entry_price + offset,
                });
            }
            StopLossKind::Duration => {
                if self.expires_at.is_none() {
                    self.expires_at = Some(now + self.value as i64);
                }
            }
            StopLossKind::CandleHigh | StopLossKind::CandleLow => {}
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Evaluates exit conditions and requests closes through the ledger.
pub struct StopLossMonitor {
    ledger: Arc<PositionLedger>,
    aggregator: Arc<CandleAggregator>,
    duration_timers: Arc<RwLock<HashMap<Uuid, JoinHandle<()>>>>,
}

impl StopLossMonitor {
    pub fn new(ledger: Arc<PositionLedger>, aggregator: Arc<CandleAggregator>) -> Self {
        Self {
            ledger,
            aggregator,
            duration_timers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // -------------------------------------------------------------------------
    // Price-driven evaluation
    // -------------------------------------------------------------------------

    /// Evaluate one freshly re-priced position and close it if its stop has
    /// triggered. Called synchronously from the tick pipeline.
    pub fn check_position(&self, position: &Position) {
        if !self.price_triggered(position) {
            return;
        }

        info!(
            id = %position.id,
            symbol = %position.symbol,
            price = position.current_price,
            kind = ?position.stop_loss.as_ref().map(|sl| sl.kind),
            "stop-loss triggered"
        );

        let _ = self.close_now(position.id, position.current_price, CloseReason::StopLoss);
    }

    fn price_triggered(&self, position: &Position) -> bool {
        let Some(sl) = &position.stop_loss else {
            return false;
        };

        match sl.kind {
            StopLossKind::Price | StopLossKind::Percent => {
                let Some(trigger) = sl.trigger_price else {
                    return false;
                };
                match position.direction {
                    TradeDirection::Long => position.current_price <= trigger,
                    TradeDirection::Short => position.current_price >= trigger,
                }
            }
            // Duration stops belong to their scheduled task, not the tick path.
            StopLossKind::Duration => false,
            StopLossKind::CandleHigh => self
                .watched_candle(position, sl)
                .map(|(high, _)| high >= sl.value)
                .unwrap_or(false),
            StopLossKind::CandleLow => self
                .watched_candle(position, sl)
                .map(|(_, low)| low <= sl.value)
                .unwrap_or(false),
        }
    }

    /// (high, low) of the current candle on the stop's timeframe.
    fn watched_candle(&self, position: &Position, sl: &StopLossConfig) -> Option<(f64, f64)> {
        let key = SeriesKey {
            symbol: position.symbol.clone(),
            interval_secs: sl.timeframe_secs.unwrap_or(DEFAULT_CANDLE_TIMEFRAME_SECS),
        };
        self.aggregator.current(&key).map(|c| (c.high, c.low))
    }

    // -------------------------------------------------------------------------
    // Close routing
    // -------------------------------------------------------------------------

    /// Close a position and cancel its duration timer. The single close entry
    /// point for both stop-loss triggers and manual closes, so cancellation
    /// can never be forgotten on one path.
    pub fn close_now(
        &self,
        id: Uuid,
        exit_price: f64,
        reason: CloseReason,
    ) -> Result<TradeRecord, LedgerError> {
        match self.ledger.close(id, exit_price, reason) {
            Ok(record) => {
                self.cancel_timer(id);
                Ok(record)
            }
            Err(LedgerError::AlreadyClosed(_)) => {
                // The other path won the race; nothing to do.
                debug!(id = %id, reason = %reason, "close skipped — position already closed");
                Err(LedgerError::AlreadyClosed(id))
            }
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Duration timers
    // -------------------------------------------------------------------------

    /// Arm the scheduled expiry task for a position carrying a Duration stop.
    /// No-op for any other stop kind.
    pub fn watch_duration(&self, position: &Position) {
        let Some(sl) = &position.stop_loss else {
            return;
        };
        if sl.kind != StopLossKind::Duration {
            return;
        }
        let Some(expires_at) = sl.expires_at else {
            return;
        };

        let ledger = Arc::clone(&self.ledger);
        let timers = Arc::clone(&self.duration_timers);
        let id = position.id;
        let remaining = (expires_at - Utc::now().timestamp()).max(0) as u64;

        debug!(id = %id, expires_at, remaining_secs = remaining, "duration stop armed");

        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(remaining)).await;

            // Close at the last known price; entry price if no tick arrived.
            if let Some(pos) = ledger.position(id) {
                if pos.is_open {
                    info!(id = %id, price = pos.current_price, "duration stop expired");
                    if let Err(e) = ledger.close(id, pos.current_price, CloseReason::StopLoss) {
                        debug!(id = %id, error = %e, "duration stop close skipped");
                    }
                }
            }
            timers.write().remove(&id);
        });

        self.duration_timers.write().insert(id, task);
    }

    /// Abort a position's duration timer, if one is armed. Safe to call for
    /// positions without one.
    pub fn cancel_timer(&self, id: Uuid) {
        if let Some(task) = self.duration_timers.write().remove(&id) {
            task.abort();
            debug!(id = %id, "duration timer cancelled");
        }
    }

    pub fn active_timer_count(&self) -> usize {
        self.duration_timers.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceTick;

    fn setup() -> (Arc<PositionLedger>, Arc<CandleAggregator>, Arc<StopLossMonitor>) {
        let ledger = Arc::new(PositionLedger::new(100_000.0));
        let aggregator = Arc::new(CandleAggregator::new(100));
        let monitor = Arc::new(StopLossMonitor::new(ledger.clone(), aggregator.clone()));
        (ledger, aggregator, monitor)
    }

    fn tick(symbol: &str, price: f64, timestamp: i64) -> PriceTick {
        PriceTick {
            symbol: symbol.into(),
            price,
            volume: 1.0,
            timestamp,
        }
    }

    #[test]
    fn long_price_stop_triggers_at_or_below_level() {
        let (ledger, _agg, monitor) = setup();
        let pos = ledger
            .open(
                "RELIANCE",
                TradeDirection::Long,
                10.0,
                100.0,
                Some(StopLossConfig::price(95.0)),
            )
            .unwrap();

        // Above the level: no trigger.
        let updated = ledger.on_tick(&tick("RELIANCE", 96.0, 0));
        monitor.check_position(&updated[0]);
        assert!(ledger.position(pos.id).unwrap().is_open);

        // At the level: triggers.
        let updated = ledger.on_tick(&tick("RELIANCE", 95.0, 1));
        monitor.check_position(&updated[0]);
        let closed = ledger.position(pos.id).unwrap();
        assert!(!closed.is_open);
        assert_eq!(closed.close_reason, Some(CloseReason::StopLoss));
        assert_eq!(closed.exit_price, Some(95.0));
    }

    #[test]
    fn short_price_stop_triggers_at_or_above_level() {
        let (ledger, _agg, monitor) = setup();
        let pos = ledger
            .open(
                "RELIANCE",
                TradeDirection::Short,
                5.0,
                200.0,
                Some(StopLossConfig::price(210.0)),
            )
            .unwrap();

        let updated = ledger.on_tick(&tick("RELIANCE", 209.0, 0));
        monitor.check_position(&updated[0]);
        assert!(ledger.position(pos.id).unwrap().is_open);

        let updated = ledger.on_tick(&tick("RELIANCE", 211.0, 1));
        monitor.check_position(&updated[0]);
        assert!(!ledger.position(pos.id).unwrap().is_open);
    }

    #[test]
    fn percent_stop_evaluates_as_armed_price() {
        let (ledger, _agg, monitor) = setup();
        let pos = ledger
            .open(
                "RELIANCE",
                TradeDirection::Long,
                10.0,
                100.0,
                Some(StopLossConfig::percent(5.0)),
            )
            .unwrap();
        assert_eq!(pos.stop_loss.as_ref().unwrap().trigger_price, Some(95.0));

        let updated = ledger.on_tick(&tick("RELIANCE", 94.5, 0));
        monitor.check_position(&updated[0]);
        assert!(!ledger.position(pos.id).unwrap().is_open);
    }

    #[test]
    fn candle_low_stop_watches_current_candle() {
        let (ledger, agg, monitor) = setup();
        let pos = ledger
            .open(
                "RELIANCE",
                TradeDirection::Long,
                10.0,
                100.0,
                Some(StopLossConfig::candle_low(97.0, 60)),
            )
            .unwrap();

        // Candle dips to 98: no breach.
        agg.on_tick(&tick("RELIANCE", 98.0, 10), 60);
        let updated = ledger.on_tick(&tick("RELIANCE", 98.0, 10));
        monitor.check_position(&updated[0]);
        assert!(ledger.position(pos.id).unwrap().is_open);

        // Candle low reaches 96.5: breach even though close recovers.
        agg.on_tick(&tick("RELIANCE", 96.5, 20), 60);
        agg.on_tick(&tick("RELIANCE", 99.0, 25), 60);
        let updated = ledger.on_tick(&tick("RELIANCE", 99.0, 25));
        monitor.check_position(&updated[0]);
        assert!(!ledger.position(pos.id).unwrap().is_open);
    }

    #[test]
    fn candle_high_stop_watches_current_candle() {
        let (ledger, agg, monitor) = setup();
        let pos = ledger
            .open(
                "RELIANCE",
                TradeDirection::Short,
                5.0,
                200.0,
                Some(StopLossConfig::candle_high(205.0, 60)),
            )
            .unwrap();

        agg.on_tick(&tick("RELIANCE", 203.0, 5), 60);
        let updated = ledger.on_tick(&tick("RELIANCE", 203.0, 5));
        monitor.check_position(&updated[0]);
        assert!(ledger.position(pos.id).unwrap().is_open);

        agg.on_tick(&tick("RELIANCE", 205.5, 15), 60);
        let updated = ledger.on_tick(&tick("RELIANCE", 205.5, 15));
        monitor.check_position(&updated[0]);
        assert!(!ledger.position(pos.id).unwrap().is_open);
    }

    #[test]
    fn stale_snapshot_trigger_is_silent_noop() {
        let (ledger, _agg, monitor) = setup();
        let pos = ledger
            .open(
                "RELIANCE",
                TradeDirection::Long,
                10.0,
                100.0,
                Some(StopLossConfig::price(95.0)),
            )
            .unwrap();

        let updated = ledger.on_tick(&tick("RELIANCE", 94.0, 0));

        // Manual close wins the race before the monitor acts on its snapshot.
        ledger.close(pos.id, 94.0, CloseReason::Manual).unwrap();
        monitor.check_position(&updated[0]);

        let closes = ledger
            .trade_history()
            .into_iter()
            .filter(|r| r.action == crate::types::TradeAction::Close)
            .count();
        assert_eq!(closes, 1);
        assert_eq!(
            ledger.position(pos.id).unwrap().close_reason,
            Some(CloseReason::Manual)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duration_stop_fires_without_price_movement() {
        let (ledger, _agg, monitor) = setup();
        let pos = ledger
            .open(
                "RELIANCE",
                TradeDirection::Long,
                10.0,
                100.0,
                Some(StopLossConfig::duration(5)),
            )
            .unwrap();

        monitor.watch_duration(&pos);
        assert_eq!(monitor.active_timer_count(), 1);

        // Paused-clock sleep auto-advances past the expiry.
        tokio::time::sleep(Duration::from_secs(7)).await;

        let closed = ledger.position(pos.id).unwrap();
        assert!(!closed.is_open);
        assert_eq!(closed.close_reason, Some(CloseReason::StopLoss));
        // No tick ever arrived: closed at entry price, flat P&L.
        assert_eq!(closed.exit_price, Some(100.0));
        assert_eq!(monitor.active_timer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_duration_timer() {
        let (ledger, _agg, monitor) = setup();
        let pos = ledger
            .open(
                "RELIANCE",
                TradeDirection::Long,
                10.0,
                100.0,
                Some(StopLossConfig::duration(5)),
            )
            .unwrap();

        monitor.watch_duration(&pos);
        monitor
            .close_now(pos.id, 101.0, CloseReason::Manual)
            .unwrap();
        assert_eq!(monitor.active_timer_count(), 0);

        tokio::time::sleep(Duration::from_secs(7)).await;

        // The aborted timer produced no second close.
        let closes = ledger
            .trade_history()
            .into_iter()
            .filter(|r| r.action == crate::types::TradeAction::Close)
            .count();
        assert_eq!(closes, 1);
        assert_eq!(
            ledger.position(pos.id).unwrap().close_reason,
            Some(CloseReason::Manual)
        );
    }
}
