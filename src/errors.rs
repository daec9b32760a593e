// =============================================================================
// Error taxonomy — domain errors that callers branch on
// =============================================================================
//
// Transport and I/O failures stay in `anyhow` at the boundaries; these typed
// errors exist where the caller's behaviour depends on the variant:
//   - an open that fails on capital is surfaced to the caller, not logged away
//   - a close racing a stop-loss must be distinguishable from a real failure
//   - a feed that exhausted its retries marks the instrument stale
// =============================================================================

use thiserror::Error;

/// Errors from the position ledger's open/close paths.
#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    /// The open would cost more than the account has available.
    #[error("insufficient capital: required {required:.2}, available {available:.2}")]
    InsufficientCapital { required: f64, available: f64 },

    /// The position is already closed (or never existed). At the stop-loss
    /// monitor level this is a silent no-op; manual callers see the error.
    #[error("position {0} is already closed")]
    AlreadyClosed(uuid::Uuid),
}

/// Errors from the tick feed for a single instrument.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed connection failed for {symbol}: {source}")]
    Connect {
        symbol: String,
        #[source]
        source: anyhow::Error,
    },

    /// All reconnect attempts were used up; the instrument is stale.
    #[error("feed retries exhausted for {symbol} after {attempts} attempts")]
    Exhausted { symbol: String, attempts: u32 },
}

/// A tick message that could not be decoded into a valid `PriceTick`.
/// Always dropped and logged, never fatal.
#[derive(Debug, Error)]
pub enum TickParseError {
    #[error("malformed tick JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("non-positive price {0}")]
    NonPositivePrice(f64),

    #[error("negative volume {0}")]
    NegativeVolume(f64),
}
