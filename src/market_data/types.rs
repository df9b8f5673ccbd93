use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Incremental depth delta from the exchange stream. `prev_update_id` must
/// match the last applied `update_id` or the book is out of sequence.
#[derive(Debug, Clone)]
pub struct DepthUpdate {
    pub symbol: String,
    pub prev_update_id: u64,
    pub update_id: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub event_time_ms: i64,
}

/// Full REST snapshot used to (re)initialize a book.
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub symbol: String,
    pub update_id: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already-seen sequence number; dropped silently.
    DroppedStale,
    /// Sequence gap; the book was invalidated and needs a snapshot resync.
    GapDetected,
}

/// Point-in-time read of one symbol's book. All derived numbers are computed
/// at read time from a consistent snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSummary {
    pub symbol: String,
    pub best_bid: Decimal,
    pub best_bid_qty: Decimal,
    pub best_ask: Decimal,
    pub best_ask_qty: Decimal,
    pub spread: Decimal,
    pub spread_pct: Decimal,
    /// Sum of top-k bid qty / sum of top-k ask qty. None when either side is
    /// empty over the window.
    pub obi: Option<f64>,
    pub bid_depth: Decimal,
    pub ask_depth: Decimal,
    pub age_ms: u64,
    pub update_id: u64,
    pub tick_size: Decimal,
}

impl BookSummary {
    pub fn mid_price(&self) -> Decimal {
        (self.best_bid + self.best_ask) / Decimal::from(2)
    }
}

/// Why a book read cannot be served as valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookInvalid {
    Uninitialized,
    Resyncing,
    Stale,
    CrossedOrZeroSpread,
}

/// Trade-price tick published to the client-side trigger engine.
#[derive(Debug, Clone)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp_ms: i64,
}
