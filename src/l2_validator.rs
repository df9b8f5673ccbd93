use crate::config::ValidationConfig;
use crate::error::ErrorCode;
use crate::market_data::orderbook_cache::OrderBookCache;
use crate::market_data::types::BookSummary;
use crate::model::Side;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

/// Outcome of a microstructure check. Rejections carry the book state that
/// produced them for the structured response.
#[derive(Debug, Clone)]
pub struct L2Verdict {
    pub valid: bool,
    pub code: Option<ErrorCode>,
    pub detail: String,
    pub summary: Option<BookSummary>,
}

impl L2Verdict {
    fn ok(summary: BookSummary) -> Self {
        Self {
            valid: true,
            code: None,
            detail: "valid".to_string(),
            summary: Some(summary),
        }
    }

    fn reject(code: ErrorCode, detail: String, summary: Option<BookSummary>) -> Self {
        Self {
            valid: false,
            code: Some(code),
            detail,
            summary,
        }
    }
}

/// Vetoes unsafe entries against the live book. Check order is fixed: market
/// data validity, spread, depth, imbalance, then signal structure.
pub struct L2Validator {
    cache: Arc<OrderBookCache>,
    config: ValidationConfig,
}

impl L2Validator {
    pub fn new(cache: Arc<OrderBookCache>, config: ValidationConfig) -> Self {
        Self { cache, config }
    }

    pub fn validate(
        &self,
        symbol: &str,
        side: Side,
        size: Decimal,
        structure_score: Decimal,
        _momentum_score: Decimal,
    ) -> L2Verdict {
        let summary = match self.cache.validate(symbol) {
            Ok(s) => s,
            Err(reason) => {
                return L2Verdict::reject(
                    ErrorCode::NoMarketData,
                    format!("book unusable: {:?}", reason),
                    None,
                );
            }
        };

        if summary.spread_pct > self.config.max_spread_pct {
            return L2Verdict::reject(
                ErrorCode::WideSpread,
                format!(
                    "spread {}% > max {}%",
                    summary.spread_pct, self.config.max_spread_pct
                ),
                Some(summary),
            );
        }

        // Top-of-book depth on the side we would consume.
        let available = match side.entry_order_side() {
            Side::Buy => summary.best_ask_qty,
            _ => summary.best_bid_qty,
        };
        let required = self.config.min_depth_mult * size;
        if available < required {
            return L2Verdict::reject(
                ErrorCode::InsufficientDepth,
                format!("top-of-book {} < required {}", available, required),
                Some(summary),
            );
        }

        let obi = summary.obi.unwrap_or(0.0);
        let obi_ok = match side.entry_order_side() {
            Side::Buy => obi >= self.config.obi_buy_threshold,
            _ => obi <= 1.0 / self.config.obi_buy_threshold,
        };
        if !obi_ok {
            return L2Verdict::reject(
                ErrorCode::ObiAdverse,
                format!("obi {:.4} adverse for {:?}", obi, side),
                Some(summary),
            );
        }

        if structure_score < self.config.min_structure_threshold {
            return L2Verdict::reject(
                ErrorCode::WeakStructure,
                format!(
                    "structure {} < min {}",
                    structure_score, self.config.min_structure_threshold
                ),
                Some(summary),
            );
        }

        debug!(
            symbol = %symbol,
            side = ?side,
            obi = obi,
            spread_pct = %summary.spread_pct,
            "L2 validation passed"
        );
        L2Verdict::ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::types::{BookLevel, BookSnapshot};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn seeded(bid_qty: Decimal, ask_qty: Decimal) -> Arc<OrderBookCache> {
        let cache = OrderBookCache::new(5, Duration::from_secs(3));
        cache.apply_snapshot(BookSnapshot {
            symbol: "BTCUSDT".into(),
            update_id: 1,
            bids: vec![BookLevel {
                price: dec!(50000),
                quantity: bid_qty,
            }],
            asks: vec![BookLevel {
                price: dec!(50010),
                quantity: ask_qty,
            }],
        });
        cache
    }

    fn validator(cache: Arc<OrderBookCache>) -> L2Validator {
        L2Validator::new(cache, ValidationConfig::default())
    }

    #[test]
    fn test_no_market_data() {
        let cache = OrderBookCache::new(5, Duration::from_secs(3));
        let v = validator(cache);
        let verdict = v.validate("BTCUSDT", Side::Long, dec!(0.1), dec!(70), dec!(50));
        assert!(!verdict.valid);
        assert_eq!(verdict.code, Some(ErrorCode::NoMarketData));
    }

    #[test]
    fn test_buy_passes_with_balanced_book() {
        let v = validator(seeded(dec!(5), dec!(5)));
        let verdict = v.validate("BTCUSDT", Side::Long, dec!(0.1), dec!(70), dec!(50));
        assert!(verdict.valid, "rejected: {}", verdict.detail);
    }

    #[test]
    fn test_insufficient_depth() {
        let v = validator(seeded(dec!(5), dec!(0.2)));
        // BUY consumes asks; required = min_depth_mult * size.
        let verdict = v.validate("BTCUSDT", Side::Long, dec!(0.05), dec!(70), dec!(50));
        assert!(verdict.valid, "rejected: {}", verdict.detail);

        let verdict = v.validate("BTCUSDT", Side::Long, dec!(0.5), dec!(70), dec!(50));
        assert!(!verdict.valid);
        assert_eq!(verdict.code, Some(ErrorCode::InsufficientDepth));
    }

    #[test]
    fn test_obi_adverse_for_buy() {
        // Bid depth 1 vs ask depth 5 -> OBI 0.2 < 1.0
        let v = validator(seeded(dec!(1), dec!(5)));
        let verdict = v.validate("BTCUSDT", Side::Long, dec!(0.1), dec!(70), dec!(50));
        assert!(!verdict.valid);
        assert_eq!(verdict.code, Some(ErrorCode::ObiAdverse));

        // The same book favors a SELL: OBI 0.2 <= 1.0
        let verdict = v.validate("BTCUSDT", Side::Short, dec!(0.1), dec!(70), dec!(50));
        assert!(verdict.valid, "rejected: {}", verdict.detail);
    }

    #[test]
    fn test_weak_structure() {
        let v = validator(seeded(dec!(5), dec!(5)));
        let verdict = v.validate("BTCUSDT", Side::Long, dec!(0.1), dec!(59.9), dec!(50));
        assert!(!verdict.valid);
        assert_eq!(verdict.code, Some(ErrorCode::WeakStructure));

        // Boundary: exactly the threshold passes.
        let verdict = v.validate("BTCUSDT", Side::Long, dec!(0.1), dec!(60), dec!(50));
        assert!(verdict.valid);
    }

    #[test]
    fn test_wide_spread() {
        let cache = OrderBookCache::new(5, Duration::from_secs(3));
        cache.apply_snapshot(BookSnapshot {
            symbol: "BTCUSDT".into(),
            update_id: 1,
            bids: vec![BookLevel {
                price: dec!(49000),
                quantity: dec!(5),
            }],
            asks: vec![BookLevel {
                price: dec!(51000),
                quantity: dec!(5),
            }],
        });
        let v = validator(cache);
        let verdict = v.validate("BTCUSDT", Side::Long, dec!(0.1), dec!(70), dec!(50));
        assert!(!verdict.valid);
        assert_eq!(verdict.code, Some(ErrorCode::WideSpread));
    }
}
