pub mod candle_aggregator;
pub mod tick_stream;

// Re-export the common types (e.g. `use crate::market_data::Candle`).
pub use candle_aggregator::{Candle, CandleAggregator, SeriesKey, SeriesSnapshot};
pub use tick_stream::{ReconnectPolicy, SubscriptionManager, TickStream};
