// =============================================================================
// Tick Stream — one live push connection per subscribed instrument
// =============================================================================
//
// `subscribe` is idempotent: a second call for an already-subscribed
// instrument hands out another receiver on the existing broadcast channel
// instead of opening a duplicate connection. `unsubscribe` aborts the
// connection task exactly once and is a no-op afterwards.
//
// Connection failures retry with exponential backoff up to a bounded attempt
// count; after exhaustion the instrument is marked stale and surfaced through
// the state snapshot, leaving every other instrument's stream untouched.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::errors::{FeedError, TickParseError};
use crate::types::{Instrument, PriceTick};

/// Receiver half handed to consumers of one instrument's tick sequence.
pub type TickStream = broadcast::Receiver<PriceTick>;

/// Buffered ticks per instrument before slow consumers start lagging.
const TICK_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Subscription manager
// ---------------------------------------------------------------------------

struct Subscription {
    sender: broadcast::Sender<PriceTick>,
    task: JoinHandle<()>,
    stale: Arc<AtomicBool>,
}

/// Reconnect policy for one instrument's feed.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Exponential backoff delay for a given consecutive-failure count.
    fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        raw.min(self.max_delay)
    }
}

/// Owns the live tick connections, one per subscribed instrument.
pub struct SubscriptionManager {
    feed_url: String,
    policy: ReconnectPolicy,
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionManager {
    pub fn new(feed_url: String, policy: ReconnectPolicy) -> Self {
        Self {
            feed_url,
            policy,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to an instrument's tick stream.
    ///
    /// Opens a connection task on first call; subsequent calls for the same
    /// instrument return a fresh receiver on the existing channel.
    pub fn subscribe(&self, instrument: &Instrument) -> TickStream {
        let mut subs = self.subscriptions.write();

        if let Some(existing) = subs.get(&instrument.symbol) {
            info!(symbol = %instrument.symbol, "already subscribed — reusing stream");
            return existing.sender.subscribe();
        }

        let (sender, receiver) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        let stale = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_tick_feed(
            self.feed_url.clone(),
            instrument.clone(),
            sender.clone(),
            stale.clone(),
            self.policy.clone(),
        ));

        info!(symbol = %instrument.symbol, exchange = %instrument.exchange, "instrument subscribed");
        subs.insert(
            instrument.symbol.clone(),
            Subscription {
                sender,
                task,
                stale,
            },
        );

        receiver
    }

    /// Close an instrument's connection. Safe to call repeatedly: returns
    /// `true` if a live subscription was torn down, `false` on a no-op.
    pub fn unsubscribe(&self, symbol: &str) -> bool {
        match self.subscriptions.write().remove(symbol) {
            Some(sub) => {
                sub.task.abort();
                info!(symbol, "instrument unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Whether the instrument's feed has exhausted its reconnect budget.
    pub fn is_stale(&self, symbol: &str) -> bool {
        self.subscriptions
            .read()
            .get(symbol)
            .map(|s| s.stale.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Symbols whose feeds are currently stale ("price unavailable").
    pub fn stale_symbols(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .iter()
            .filter(|(_, s)| s.stale.load(Ordering::Relaxed))
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.subscriptions.read().contains_key(symbol)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

// ---------------------------------------------------------------------------
// Feed task
// ---------------------------------------------------------------------------

/// Run one instrument's feed with reconnect. Consecutive connection failures
/// back off exponentially; a successful connection resets the counter. Once
/// the attempt budget is spent the instrument is marked stale and the task
/// exits.
async fn run_tick_feed(
    feed_url: String,
    instrument: Instrument,
    sender: broadcast::Sender<PriceTick>,
    stale: Arc<AtomicBool>,
    policy: ReconnectPolicy,
) {
    let url = format!("{}/{}", feed_url, instrument.token);
    let mut consecutive_failures: u32 = 0;

    loop {
        match stream_ticks(&url, &instrument, &sender).await {
            Ok(()) => {
                // Orderly stream end — reconnect without burning the budget.
                warn!(symbol = %instrument.symbol, "tick stream ended — reconnecting");
                consecutive_failures = 0;
            }
            Err(e) => {
                consecutive_failures += 1;
                error!(
                    symbol = %instrument.symbol,
                    attempt = consecutive_failures,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "tick stream error"
                );

                if consecutive_failures >= policy.max_attempts {
                    stale.store(true, Ordering::Relaxed);
                    let exhausted = FeedError::Exhausted {
                        symbol: instrument.symbol.clone(),
                        attempts: consecutive_failures,
                    };
                    error!(error = %exhausted, "instrument marked stale");
                    return;
                }
            }
        }

        tokio::time::sleep(policy.delay(consecutive_failures.max(1))).await;
    }
}

/// Connect once and pump decoded ticks into the channel until the stream
/// disconnects or errors.
async fn stream_ticks(
    url: &str,
    instrument: &Instrument,
    sender: &broadcast::Sender<PriceTick>,
) -> std::result::Result<(), FeedError> {
    info!(url = %url, symbol = %instrument.symbol, "connecting to tick WebSocket");

    let connect = |source: anyhow::Error| FeedError::Connect {
        symbol: instrument.symbol.clone(),
        source,
    };

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to tick WebSocket")
        .map_err(&connect)?;

    info!(symbol = %instrument.symbol, "tick WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_tick(&text) {
                        Ok(tick) => {
                            // Send fails only when no receiver is attached;
                            // that is not an error for the feed.
                            let _ = sender.send(tick);
                        }
                        Err(e) => {
                            warn!(symbol = %instrument.symbol, error = %e, "malformed tick dropped");
                        }
                    }
                }
                // Ping/Pong/Binary/Close frames are handled by tungstenite.
            }
            Some(Err(e)) => return Err(connect(anyhow::Error::from(e))),
            None => return Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tick decoding
// ---------------------------------------------------------------------------

/// Parse one tick message.
///
/// Expected shape (numeric fields may arrive as JSON strings):
/// ```json
/// { "s": "RELIANCE", "p": "2843.55", "q": "12", "T": 1700000000 }
/// ```
pub fn parse_tick(text: &str) -> std::result::Result<PriceTick, TickParseError> {
    let root: serde_json::Value = serde_json::from_str(text)?;

    let symbol = root["s"]
        .as_str()
        .ok_or(TickParseError::MissingField("s"))?
        .to_uppercase();

    let price = parse_number(&root["p"]).ok_or(TickParseError::MissingField("p"))?;
    let volume = parse_number(&root["q"]).ok_or(TickParseError::MissingField("q"))?;
    let timestamp = root["T"]
        .as_i64()
        .ok_or(TickParseError::MissingField("T"))?;

    if price <= 0.0 {
        return Err(TickParseError::NonPositivePrice(price));
    }
    if volume < 0.0 {
        return Err(TickParseError::NegativeVolume(volume));
    }

    Ok(PriceTick {
        symbol,
        price,
        volume,
        timestamp,
    })
}

/// Providers send numeric values as either JSON strings or numbers.
fn parse_number(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
