// =============================================================================
// Central Application State — Paperdesk engine
// =============================================================================
//
// The single source of truth for the engine. Subsystems manage their own
// interior mutability; AppState ties them together, routes the position
// open/close entry points, and builds the read-only snapshots served to the
// dashboard API and WebSocket feed.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for the runtime config.
//   - Arc wrappers for subsystem engines.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Duration;
use uuid::Uuid;

use crate::account::TradeRecord;
use crate::errors::LedgerError;
use crate::market_data::{
    CandleAggregator, ReconnectPolicy, SeriesKey, SeriesSnapshot, SubscriptionManager, TickStream,
};
use crate::persistence::AccountState;
use crate::position_ledger::{Position, PositionLedger};
use crate::runtime_config::RuntimeConfig;
use crate::stop_loss::{StopLossConfig, StopLossMonitor};
use crate::types::{CloseReason, Instrument, TradeDirection};

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, incremented on every
    /// meaningful mutation. The WebSocket feed uses this to detect changes.
    pub state_version: AtomicU64,

    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    pub subscriptions: Arc<SubscriptionManager>,
    pub aggregator: Arc<CandleAggregator>,
    pub ledger: Arc<PositionLedger>,
    pub monitor: Arc<StopLossMonitor>,

    /// Engine start instant, for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the engine state from configuration, optionally restoring a
    /// previously persisted account.
    pub fn new(config: RuntimeConfig, restored: Option<AccountState>) -> Self {
        let ledger = Arc::new(match restored {
            Some(state) => PositionLedger::with_state(state),
            None => PositionLedger::new(config.starting_capital),
        });

        let aggregator = Arc::new(CandleAggregator::new(config.max_candles));

        let subscriptions = Arc::new(SubscriptionManager::new(
            config.feed_url.clone(),
            ReconnectPolicy {
                max_attempts: config.reconnect_max_attempts,
                base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
                max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
            },
        ));

        let monitor = Arc::new(StopLossMonitor::new(ledger.clone(), aggregator.clone()));

        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            runtime_config: Arc::new(RwLock::new(config)),
            subscriptions,
            aggregator,
            ledger,
            monitor,
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Position entry points ───────────────────────────────────────────

    /// Open a paper position. Arms the duration timer when the stop-loss
    /// calls for one.
    pub fn open_position(
        &self,
        symbol: &str,
        direction: TradeDirection,
        quantity: f64,
        entry_price: f64,
        stop_loss: Option<StopLossConfig>,
    ) -> Result<Position, LedgerError> {
        let position = self
            .ledger
            .open(symbol, direction, quantity, entry_price, stop_loss)?;
        self.monitor.watch_duration(&position);
        self.increment_version();
        Ok(position)
    }

    /// Manually close a position. Shares the ledger's exactly-once close
    /// transition with the stop-loss path.
    pub fn close_position(
        &self,
        id: Uuid,
        exit_price: f64,
    ) -> Result<TradeRecord, LedgerError> {
        let record = self.monitor.close_now(id, exit_price, CloseReason::Manual)?;
        self.increment_version();
        Ok(record)
    }

    /// Re-arm duration timers for open positions restored from persistence.
    pub fn rearm_duration_stops(&self) {
        for position in self.ledger.open_positions() {
            self.monitor.watch_duration(&position);
        }
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    pub fn subscribe_instrument(&self, instrument: &Instrument) -> TickStream {
        let stream = self.subscriptions.subscribe(instrument);
        self.increment_version();
        stream
    }

    /// Tear down an instrument's stream and its candle series. Idempotent;
    /// other instruments are unaffected. Resubscribing restarts the candle
    /// sequence from scratch.
    pub fn unsubscribe_instrument(&self, symbol: &str) {
        if self.subscriptions.unsubscribe(symbol) {
            self.aggregator.remove_symbol(symbol);
            self.increment_version();
        }
    }

    // ── Snapshot Builders ───────────────────────────────────────────────

    /// Full account snapshot for the dashboard API and WebSocket feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            capital: self.ledger.available_capital(),
            positions: self.ledger.all_positions(),
            trade_history: self.ledger.trade_history(),
            stale_instruments: self.subscriptions.stale_symbols(),
        }
    }

    /// Candle view for one (symbol, interval) series.
    pub fn candle_snapshot(&self, symbol: &str, interval_secs: u64) -> SeriesSnapshot {
        self.aggregator.snapshot(&SeriesKey {
            symbol: symbol.to_string(),
            interval_secs,
        })
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// Read-only account view sent downstream.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub capital: f64,
    pub positions: Vec<Position>,
    pub trade_history: Vec<TradeRecord>,
    /// Instruments whose feed exhausted its reconnect budget
    /// ("price unavailable").
    pub stale_instruments: Vec<String>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeAction;

    fn test_state() -> AppState {
        let config = RuntimeConfig {
            starting_capital: 10_000.0,
            ..RuntimeConfig::default()
        };
        AppState::new(config, None)
    }

    #[tokio::test]
    async fn snapshot_reflects_account_activity() {
        let state = test_state();
        let pos = state
            .open_position("RELIANCE", TradeDirection::Long, 10.0, 100.0, None)
            .unwrap();
        state.close_position(pos.id, 110.0).unwrap();

        let snapshot = state.build_snapshot();
        assert!((snapshot.capital - 10_100.0).abs() < 1e-9);
        assert_eq!(snapshot.positions.len(), 1);
        assert!(!snapshot.positions[0].is_open);
        assert_eq!(snapshot.trade_history.len(), 2);
        assert_eq!(snapshot.trade_history[1].action, TradeAction::Close);
        assert!(snapshot.stale_instruments.is_empty());
    }

    #[tokio::test]
    async fn mutations_bump_state_version() {
        let state = test_state();
        let v0 = state.current_state_version();

        let pos = state
            .open_position("RELIANCE", TradeDirection::Long, 1.0, 100.0, None)
            .unwrap();
        let v1 = state.current_state_version();
        assert!(v1 > v0);

        state.close_position(pos.id, 100.0).unwrap();
        assert!(state.current_state_version() > v1);
    }

    #[tokio::test]
    async fn open_failure_propagates_without_version_bump_side_effects() {
        let state = test_state();
        let err = state
            .open_position("RELIANCE", TradeDirection::Long, 1_000.0, 100.0, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCapital { .. }));
        assert!(state.build_snapshot().positions.is_empty());
    }

    #[tokio::test]
    async fn restored_account_keeps_capital_and_positions() {
        let donor = test_state();
        donor
            .open_position("RELIANCE", TradeDirection::Long, 10.0, 100.0, None)
            .unwrap();
        let persisted = donor.ledger.account_state();

        let state = AppState::new(RuntimeConfig::default(), Some(persisted));
        let snapshot = state.build_snapshot();
        assert!((snapshot.capital - 9_000.0).abs() < 1e-9);
        assert_eq!(snapshot.positions.len(), 1);
        assert!(snapshot.positions[0].is_open);
    }

    #[tokio::test]
    async fn candle_snapshot_for_unknown_series_is_empty() {
        let state = test_state();
        let snap = state.candle_snapshot("RELIANCE", 60);
        assert!(snap.finalized.is_empty());
        assert!(snap.current.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_clears_candles_and_is_idempotent() {
        let state = test_state();
        let instrument = crate::types::Instrument {
            symbol: "RELIANCE".into(),
            exchange: "NSE".into(),
            token: 738_561,
            lot_size: 1,
        };

        let _stream = state.subscribe_instrument(&instrument);
        state.aggregator.on_tick(
            &crate::types::PriceTick {
                symbol: "RELIANCE".into(),
                price: 100.0,
                volume: 1.0,
                timestamp: 0,
            },
            60,
        );
        assert!(state.candle_snapshot("RELIANCE", 60).current.is_some());

        state.unsubscribe_instrument("RELIANCE");
        assert!(!state.subscriptions.is_subscribed("RELIANCE"));
        // Resubscribing restarts the series from scratch.
        assert!(state.candle_snapshot("RELIANCE", 60).current.is_none());

        // Second unsubscribe is a no-op.
        state.unsubscribe_instrument("RELIANCE");
    }
}
