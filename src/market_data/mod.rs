pub mod aggregator;
pub mod book;
pub mod price_feed;

// Re-export the main handles for convenient access.
pub use aggregator::{AggregatedPrice, PriceAggregator, PriceDeviation};
pub use book::{BookManager, BookSnapshot, OrderLevel, SpreadOpportunity};
pub use price_feed::{FeedHandle, Ohlcv};
