use crate::market_data::types::{
    ApplyOutcome, BookInvalid, BookLevel, BookSnapshot, BookSummary, DepthUpdate,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-symbol mirror of the exchange book. One writer per symbol (the stream
/// consumer); readers take point-in-time summaries and never observe a
/// mid-apply state.
pub struct OrderBookCache {
    books: DashMap<String, Arc<RwLock<BookState>>>,
    obi_levels: usize,
    stale_after: Duration,
}

struct BookState {
    bids: BTreeMap<Decimal, Decimal>, // ascending; iterate rev() for best bid
    asks: BTreeMap<Decimal, Decimal>,
    last_update_id: u64,
    initialized: bool,
    resyncing: bool,
    last_applied: Option<Instant>,
    tick_size: Decimal,
}

impl BookState {
    fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            initialized: false,
            resyncing: false,
            last_applied: None,
            tick_size: Decimal::new(1, 1),
        }
    }

    fn apply_levels(&mut self, bids: &[BookLevel], asks: &[BookLevel]) {
        for level in bids {
            if level.quantity.is_zero() {
                self.bids.remove(&level.price);
            } else {
                self.bids.insert(level.price, level.quantity);
            }
        }
        for level in asks {
            if level.quantity.is_zero() {
                self.asks.remove(&level.price);
            } else {
                self.asks.insert(level.price, level.quantity);
            }
        }
    }

    /// Smallest representable price increment, from the finest scale seen at
    /// the top of book. Published so the chaser never hard-codes a tick.
    fn infer_tick_size(&mut self) {
        let scale = self
            .bids
            .keys()
            .rev()
            .take(5)
            .chain(self.asks.keys().take(5))
            .map(|p| p.normalize().scale())
            .max();
        if let Some(scale) = scale {
            self.tick_size = Decimal::new(1, scale);
        }
    }
}

impl OrderBookCache {
    pub fn new(obi_levels: usize, stale_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            books: DashMap::new(),
            obi_levels,
            stale_after,
        })
    }

    fn book(&self, symbol: &str) -> Arc<RwLock<BookState>> {
        self.books
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(BookState::new())))
            .clone()
    }

    /// Initialize or re-initialize a symbol from a REST snapshot.
    pub fn apply_snapshot(&self, snapshot: BookSnapshot) {
        let book = self.book(&snapshot.symbol);
        let mut state = book.write();

        state.bids.clear();
        state.asks.clear();
        state.apply_levels(&snapshot.bids, &snapshot.asks);
        state.last_update_id = snapshot.update_id;
        state.initialized = true;
        state.resyncing = false;
        state.last_applied = Some(Instant::now());
        state.infer_tick_size();

        debug!(
            symbol = %snapshot.symbol,
            update_id = snapshot.update_id,
            "Book snapshot applied"
        );
    }

    /// Apply an incremental update in exchange-sequence order. A mismatched
    /// `prev_update_id` invalidates the book until the next snapshot.
    pub fn apply_update(&self, update: &DepthUpdate) -> ApplyOutcome {
        let book = self.book(&update.symbol);
        let mut state = book.write();

        if !state.initialized || state.resyncing {
            return ApplyOutcome::GapDetected;
        }

        if update.update_id <= state.last_update_id {
            return ApplyOutcome::DroppedStale;
        }

        if update.prev_update_id != state.last_update_id {
            warn!(
                symbol = %update.symbol,
                expected = state.last_update_id,
                got = update.prev_update_id,
                "Book sequence gap, invalidating"
            );
            state.initialized = false;
            state.resyncing = true;
            return ApplyOutcome::GapDetected;
        }

        state.apply_levels(&update.bids, &update.asks);
        state.last_update_id = update.update_id;
        state.last_applied = Some(Instant::now());
        ApplyOutcome::Applied
    }

    /// Mark a book unusable until a snapshot arrives (disconnects, explicit
    /// resync requests).
    pub fn invalidate(&self, symbol: &str) {
        let book = self.book(symbol);
        let mut state = book.write();
        state.initialized = false;
        state.resyncing = true;
    }

    pub fn set_tick_size(&self, symbol: &str, tick_size: Decimal) {
        let book = self.book(symbol);
        book.write().tick_size = tick_size;
    }

    /// Point-in-time summary regardless of validity; `validate` is the gated
    /// read used by anything that places orders.
    pub fn summary(&self, symbol: &str) -> Option<BookSummary> {
        let book = self.books.get(symbol)?.clone();
        let state = book.read();

        let (&best_bid, &best_bid_qty) = state.bids.iter().next_back()?;
        let (&best_ask, &best_ask_qty) = state.asks.iter().next()?;

        let bid_depth: Decimal = state
            .bids
            .iter()
            .rev()
            .take(self.obi_levels)
            .map(|(_, q)| *q)
            .sum();
        let ask_depth: Decimal = state
            .asks
            .iter()
            .take(self.obi_levels)
            .map(|(_, q)| *q)
            .sum();

        let obi = if bid_depth.is_zero() || ask_depth.is_zero() {
            None
        } else {
            Some(bid_depth.to_f64().unwrap_or(0.0) / ask_depth.to_f64().unwrap_or(f64::MAX))
        };

        let spread = best_ask - best_bid;
        let mid = (best_ask + best_bid) / Decimal::from(2);
        let spread_pct = if mid.is_zero() {
            Decimal::ZERO
        } else {
            spread / mid * Decimal::from(100)
        };

        Some(BookSummary {
            symbol: symbol.to_string(),
            best_bid,
            best_bid_qty,
            best_ask,
            best_ask_qty,
            spread,
            spread_pct,
            obi,
            bid_depth,
            ask_depth,
            age_ms: state
                .last_applied
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(u64::MAX),
            update_id: state.last_update_id,
            tick_size: state.tick_size,
        })
    }

    /// Gated read: fails when the book is uninitialized, mid-resync, stale,
    /// or crossed. No reads during resync are served as valid.
    pub fn validate(&self, symbol: &str) -> Result<BookSummary, BookInvalid> {
        let book = self
            .books
            .get(symbol)
            .ok_or(BookInvalid::Uninitialized)?
            .clone();
        {
            let state = book.read();
            if state.resyncing {
                return Err(BookInvalid::Resyncing);
            }
            if !state.initialized {
                return Err(BookInvalid::Uninitialized);
            }
            match state.last_applied {
                Some(t) if t.elapsed() <= self.stale_after => {}
                _ => return Err(BookInvalid::Stale),
            }
        }

        let summary = self.summary(symbol).ok_or(BookInvalid::Uninitialized)?;
        if summary.spread <= Decimal::ZERO {
            return Err(BookInvalid::CrossedOrZeroSpread);
        }
        Ok(summary)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.iter().map(|e| e.key().clone()).collect()
    }

    pub fn initialized_count(&self) -> usize {
        self.books
            .iter()
            .filter(|entry| entry.value().read().initialized)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, qty: Decimal) -> BookLevel {
        BookLevel {
            price,
            quantity: qty,
        }
    }

    fn seeded_cache() -> Arc<OrderBookCache> {
        let cache = OrderBookCache::new(5, Duration::from_secs(3));
        cache.apply_snapshot(BookSnapshot {
            symbol: "BTCUSDT".into(),
            update_id: 100,
            bids: vec![
                level(dec!(50000.0), dec!(2.0)),
                level(dec!(49999.5), dec!(1.5)),
            ],
            asks: vec![
                level(dec!(50010.0), dec!(1.0)),
                level(dec!(50010.5), dec!(3.0)),
            ],
        });
        cache
    }

    #[test]
    fn test_snapshot_then_summary() {
        let cache = seeded_cache();
        let summary = cache.summary("BTCUSDT").unwrap();
        assert_eq!(summary.best_bid, dec!(50000.0));
        assert_eq!(summary.best_ask, dec!(50010.0));
        assert_eq!(summary.spread, dec!(10.0));
        assert_eq!(summary.bid_depth, dec!(3.5));
        assert_eq!(summary.ask_depth, dec!(4.0));
        let obi = summary.obi.unwrap();
        assert!((obi - 0.875).abs() < 1e-9);
    }

    #[test]
    fn test_in_sequence_update_applies() {
        let cache = seeded_cache();
        let outcome = cache.apply_update(&DepthUpdate {
            symbol: "BTCUSDT".into(),
            prev_update_id: 100,
            update_id: 101,
            bids: vec![level(dec!(50001.0), dec!(0.5))],
            asks: vec![level(dec!(50010.0), dec!(0.0))],
            event_time_ms: 0,
        });
        assert_eq!(outcome, ApplyOutcome::Applied);

        let summary = cache.summary("BTCUSDT").unwrap();
        assert_eq!(summary.best_bid, dec!(50001.0));
        // Level removed by zero-qty delta.
        assert_eq!(summary.best_ask, dec!(50010.5));
    }

    #[test]
    fn test_gap_invalidates_book() {
        let cache = seeded_cache();
        let outcome = cache.apply_update(&DepthUpdate {
            symbol: "BTCUSDT".into(),
            prev_update_id: 105, // gap: last applied was 100
            update_id: 106,
            bids: vec![],
            asks: vec![],
            event_time_ms: 0,
        });
        assert_eq!(outcome, ApplyOutcome::GapDetected);
        assert!(matches!(
            cache.validate("BTCUSDT"),
            Err(BookInvalid::Resyncing)
        ));

        // Snapshot resync restores validity.
        cache.apply_snapshot(BookSnapshot {
            symbol: "BTCUSDT".into(),
            update_id: 110,
            bids: vec![level(dec!(50000.0), dec!(1.0))],
            asks: vec![level(dec!(50010.0), dec!(1.0))],
        });
        assert!(cache.validate("BTCUSDT").is_ok());
    }

    #[test]
    fn test_stale_sequence_dropped() {
        let cache = seeded_cache();
        let outcome = cache.apply_update(&DepthUpdate {
            symbol: "BTCUSDT".into(),
            prev_update_id: 99,
            update_id: 100,
            bids: vec![],
            asks: vec![],
            event_time_ms: 0,
        });
        assert_eq!(outcome, ApplyOutcome::DroppedStale);
        // Book remains valid after dropping an old delta.
        assert!(cache.validate("BTCUSDT").is_ok());
    }

    #[test]
    fn test_crossed_book_is_invalid() {
        let cache = OrderBookCache::new(5, Duration::from_secs(3));
        cache.apply_snapshot(BookSnapshot {
            symbol: "ETHUSDT".into(),
            update_id: 1,
            bids: vec![level(dec!(2001.0), dec!(1.0))],
            asks: vec![level(dec!(2000.0), dec!(1.0))],
        });
        assert!(matches!(
            cache.validate("ETHUSDT"),
            Err(BookInvalid::CrossedOrZeroSpread)
        ));
    }

    #[test]
    fn test_unknown_symbol_uninitialized() {
        let cache = OrderBookCache::new(5, Duration::from_secs(3));
        assert!(matches!(
            cache.validate("XRPUSDT"),
            Err(BookInvalid::Uninitialized)
        ));
    }

    #[test]
    fn test_tick_size_inferred_from_levels() {
        let cache = seeded_cache();
        // Finest observed scale at the top of book is one decimal place.
        let summary = cache.summary("BTCUSDT").unwrap();
        assert_eq!(summary.tick_size, dec!(0.1));

        cache.set_tick_size("BTCUSDT", dec!(0.5));
        assert_eq!(cache.summary("BTCUSDT").unwrap().tick_size, dec!(0.5));
    }
}
