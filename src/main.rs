// =============================================================================
// Paperdesk — Main Entry Point
// =============================================================================
//
// Boot order: config, persisted account restore, shared state, one tick
// stream + pipeline per instrument, read-only API server, then wait for
// shutdown and flush a final state save.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod account;
mod api;
mod app_state;
mod engine;
mod errors;
mod market_data;
mod persistence;
mod position_ledger;
mod runtime_config;
mod stop_loss;
mod types;

use std::sync::Arc;

use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::persistence::{spawn_save_worker, AccountStore, JsonFileStore, SavePolicy};
use crate::runtime_config::RuntimeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Paperdesk Engine — Starting Up                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = std::env::var("PAPERDESK_CONFIG")
        .unwrap_or_else(|_| "paperdesk_config.json".to_string());

    let config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    info!(
        instruments = ?config.instruments.iter().map(|i| i.symbol.as_str()).collect::<Vec<_>>(),
        intervals = ?config.candle_intervals_secs,
        starting_capital = config.starting_capital,
        "Configured paper account"
    );

    // ── 2. Restore persisted account state ───────────────────────────────
    let store: Arc<dyn AccountStore> = Arc::new(JsonFileStore::new(&config.state_path));
    let account_id = config.account_id.clone();

    let restored = match store.load(&account_id) {
        Ok(state) => state,
        Err(e) => {
            warn!(error = %e, "Failed to load persisted account state — starting fresh");
            None
        }
    };

    // ── 3. Build shared state ────────────────────────────────────────────
    let save_policy = SavePolicy {
        max_attempts: config.save_max_attempts,
        base_delay: Duration::from_millis(config.save_retry_delay_ms),
    };
    let state = Arc::new(AppState::new(config, restored));

    let (save_sender, _save_task) =
        spawn_save_worker(store.clone(), account_id.clone(), save_policy);
    state.ledger.attach_saver(save_sender);

    // Open positions restored with a duration stop get their timers back.
    state.rearm_duration_stops();

    // ── 4. Spawn tick streams & pipelines ────────────────────────────────
    let instruments = state.runtime_config.read().instruments.clone();

    for instrument in &instruments {
        let stream = state.subscribe_instrument(instrument);
        tokio::spawn(engine::run_pipeline(
            state.clone(),
            instrument.symbol.clone(),
            stream,
        ));
    }

    info!(count = instruments.len(), "Tick streams and pipelines launched");

    // ── 5. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr =
        std::env::var("PAPERDESK_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    // One last synchronous save so the background worker's backlog cannot
    // be lost.
    if let Err(e) = store.save(&account_id, &state.ledger.account_state()) {
        error!(error = %e, "Failed to save account state on shutdown");
    }

    info!("Paperdesk shut down complete.");
    Ok(())
}
