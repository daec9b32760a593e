// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Paperdesk engine.  Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash.  All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Instrument;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_instruments() -> Vec<Instrument> {
    vec![
        Instrument {
            symbol: "RELIANCE".to_string(),
            exchange: "NSE".to_string(),
            token: 738_561,
            lot_size: 1,
        },
        Instrument {
            symbol: "INFY".to_string(),
            exchange: "NSE".to_string(),
            token: 408_065,
            lot_size: 1,
        },
    ]
}

fn default_candle_intervals_secs() -> Vec<u64> {
    vec![60, 300]
}

fn default_max_candles() -> usize {
    500
}

fn default_starting_capital() -> f64 {
    100_000.0
}

fn default_account_id() -> String {
    "paper-default".to_string()
}

fn default_feed_url() -> String {
    "wss://ticks.example.com/stream".to_string()
}

fn default_reconnect_max_attempts() -> u32 {
    8
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_state_path() -> String {
    "paperdesk_state".to_string()
}

fn default_save_max_attempts() -> u32 {
    5
}

fn default_save_retry_delay_ms() -> u64 {
    250
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Paperdesk engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Instruments & candles ----------------------------------------------
    /// Instruments the engine subscribes to at startup.
    #[serde(default = "default_instruments")]
    pub instruments: Vec<Instrument>,

    /// Candle intervals maintained per instrument, in seconds.
    #[serde(default = "default_candle_intervals_secs")]
    pub candle_intervals_secs: Vec<u64>,

    /// Maximum number of finalized candles retained per (symbol, interval).
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,

    // --- Account ------------------------------------------------------------
    /// Virtual capital the paper account starts with when no persisted state
    /// exists.
    #[serde(default = "default_starting_capital")]
    pub starting_capital: f64,

    /// Key under which account state is persisted.
    #[serde(default = "default_account_id")]
    pub account_id: String,

    // --- Tick feed ----------------------------------------------------------
    /// WebSocket endpoint of the upstream tick provider. The per-instrument
    /// stream path is appended by the subscription manager.
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Reconnect attempts before an instrument is marked stale.
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// First reconnect delay; doubles per attempt.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Ceiling for the exponential backoff delay.
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    // --- Persistence --------------------------------------------------------
    /// Directory the JSON account store writes into.
    #[serde(default = "default_state_path")]
    pub state_path: String,

    /// Save attempts before a persistence failure is surfaced as a warning.
    #[serde(default = "default_save_max_attempts")]
    pub save_max_attempts: u32,

    /// First save retry delay; doubles per attempt.
    #[serde(default = "default_save_retry_delay_ms")]
    pub save_retry_delay_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            instruments: default_instruments(),
            candle_intervals_secs: default_candle_intervals_secs(),
            max_candles: default_max_candles(),
            starting_capital: default_starting_capital(),
            account_id: default_account_id(),
            feed_url: default_feed_url(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            state_path: default_state_path(),
            save_max_attempts: default_save_max_attempts(),
            save_retry_delay_ms: default_save_retry_delay_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            instruments = config.instruments.len(),
            intervals = ?config.candle_intervals_secs,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
