// =============================================================================
// Tick Pipeline — per-instrument processing chain
// =============================================================================
//
// One pipeline task per subscribed instrument. Each tick is handled
// synchronously end-to-end — candle aggregation for every configured
// interval, then P&L recompute, then stop-loss evaluation — before the next
// tick for that instrument is taken, so nothing interleaves inside one
// instrument's causal chain. Pipelines for different instruments run
// concurrently; cross-instrument state (capital, trade history) is guarded
// by the ledger's single mutation entry points.
// =============================================================================

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::market_data::TickStream;
use crate::types::PriceTick;

/// Process one tick through the full chain. Synchronous by design.
pub fn handle_tick(state: &AppState, tick: &PriceTick) {
    // 1. Candles, every configured interval.
    let intervals = state.runtime_config.read().candle_intervals_secs.clone();
    for interval_secs in intervals {
        state.aggregator.on_tick(tick, interval_secs);
    }

    // 2. Re-price every open position on this symbol.
    let updated = state.ledger.on_tick(tick);

    // 3. Evaluate stops on the fresh snapshots; triggers close through the
    //    ledger, which wins or loses the race against manual closes there.
    for position in &updated {
        state.monitor.check_position(position);
    }

    state.increment_version();
}

/// Drain one instrument's tick stream until it closes. Spawned once per
/// subscription; ends when the instrument is unsubscribed (sender dropped).
pub async fn run_pipeline(state: Arc<AppState>, symbol: String, mut stream: TickStream) {
    info!(symbol = %symbol, "tick pipeline started");

    loop {
        match stream.recv().await {
            Ok(tick) => handle_tick(&state, &tick),
            Err(RecvError::Lagged(skipped)) => {
                // Consumer fell behind the broadcast buffer; candles for the
                // gap are lost but ordering of what remains is preserved.
                warn!(symbol = %symbol, skipped, "tick pipeline lagged — ticks dropped");
            }
            Err(RecvError::Closed) => {
                info!(symbol = %symbol, "tick pipeline stopped");
                return;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
