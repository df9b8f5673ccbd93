use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl Side {
    /// Signed direction: +1 for Buy/Long, -1 for Sell/Short.
    pub fn sign(&self) -> i32 {
        match self {
            Side::Buy | Side::Long => 1,
            Side::Sell | Side::Short => -1,
        }
    }

    /// Holding side for a signal direction (+1 / -1).
    pub fn from_direction(direction: i32) -> Side {
        if direction >= 0 {
            Side::Long
        } else {
            Side::Short
        }
    }

    /// The order side that opens this holding side.
    pub fn entry_order_side(&self) -> Side {
        match self {
            Side::Buy | Side::Long => Side::Buy,
            Side::Sell | Side::Short => Side::Sell,
        }
    }

    /// The order side that closes this holding side.
    pub fn exit_order_side(&self) -> Side {
        match self {
            Side::Buy | Side::Long => Side::Sell,
            Side::Sell | Side::Short => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalKind {
    #[serde(rename = "PREPARE")]
    Prepare,
    #[serde(rename = "CONFIRM")]
    Confirm,
    #[serde(rename = "ABORT")]
    Abort,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SignalType {
    #[serde(rename = "SCALP")]
    Scalp,
    #[serde(rename = "DAY")]
    Day,
    #[serde(rename = "SWING")]
    Swing,
}

impl SignalType {
    /// Default alpha half-life for the class, used when the signal does not
    /// carry an explicit `alpha_half_life_ms`.
    pub fn default_half_life_ms(&self) -> i64 {
        match self {
            SignalType::Scalp => 10_000,
            SignalType::Day => 30_000,
            SignalType::Swing => 120_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TriggerCondition {
    #[serde(rename = ">")]
    Above,
    #[serde(rename = "<")]
    Below,
    #[serde(rename = ">=")]
    AboveOrEqual,
    #[serde(rename = "<=")]
    BelowOrEqual,
}

impl TriggerCondition {
    pub fn evaluate(&self, price: Decimal, target: Decimal) -> bool {
        match self {
            TriggerCondition::Above => price > target,
            TriggerCondition::Below => price < target,
            TriggerCondition::AboveOrEqual => price >= target,
            TriggerCondition::BelowOrEqual => price <= target,
        }
    }
}

/// Market-regime context attached by the strategy source.
/// Ternary fields use -1 / 0 / +1 (+1 = Risk-On).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegimeVector {
    #[serde(default)]
    pub trend: i32,
    #[serde(default)]
    pub vol: i32,
    #[serde(default)]
    pub regime_state: i32,
    #[serde(default)]
    pub structure_score: Decimal,
    #[serde(default)]
    pub momentum_score: Decimal,
    #[serde(default)]
    pub model_recommendation: Option<String>,
}

pub const REGIME_RISK_ON: i32 = 1;

/// Trade-intent signal as authenticated at ingress. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub source: Option<String>,
    pub symbol: String,
    /// +1 long, -1 short.
    pub direction: i32,
    #[serde(default)]
    pub entry_zone: Vec<Decimal>,
    #[serde(default)]
    pub stop_loss: Decimal,
    #[serde(default)]
    pub take_profits: Vec<Decimal>,
    #[serde(default)]
    pub size: Decimal,
    pub signal_type: SignalType,
    /// 0-100.
    #[serde(default)]
    pub urgency_score: u32,
    #[serde(default)]
    pub alpha_half_life_ms: Option<i64>,
    /// Emission time, unix millis.
    pub timestamp: i64,
    #[serde(default)]
    pub bar_index: i64,
    #[serde(default)]
    pub bar_close_time: Option<i64>,
    #[serde(default)]
    pub trigger_price: Option<Decimal>,
    #[serde(default)]
    pub trigger_condition: Option<TriggerCondition>,
    #[serde(default)]
    pub regime: RegimeVector,
}

impl Signal {
    pub fn side(&self) -> Side {
        Side::from_direction(self.direction)
    }

    /// Reference entry price: first entry-zone level. Used for sizing only,
    /// never for order placement.
    pub fn reference_entry(&self) -> Option<Decimal> {
        self.entry_zone.first().copied()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IntentStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "VALIDATED")]
    Validated,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "EXECUTING")]
    Executing,
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "CANCELED")]
    Canceled,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Rejected | IntentStatus::Filled | IntentStatus::Canceled
        )
    }

    /// Lifecycle is monotone: PENDING -> VALIDATED -> EXECUTING -> {FILLED | CANCELED},
    /// with REJECTED reachable from the two pre-execution states. No regressions.
    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        use IntentStatus::*;
        matches!(
            (self, next),
            (Pending, Validated)
                | (Pending, Rejected)
                | (Pending, Canceled)
                | (Validated, Executing)
                | (Validated, Rejected)
                | (Validated, Canceled)
                | (Executing, Filled)
                | (Executing, Canceled)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub signal_id: String,
    pub symbol: String,
    pub side: Side,
    pub status: IntentStatus,
    pub signal: Signal,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    /// Ingress receipt time, unix millis.
    pub t_ingress: i64,
}

impl Intent {
    pub fn from_signal(signal: Signal, t_ingress: i64) -> Self {
        Self {
            signal_id: signal.signal_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side(),
            status: IntentStatus::Pending,
            signal,
            rejection_reason: None,
            t_ingress,
        }
    }
}

/// Broker fill report handed to the shadow ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub broker_order_id: String,
    pub fill_price: Decimal,
    pub fill_size: Decimal,
    pub filled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub current_stop: Decimal,
    pub take_profits: Vec<Decimal>,
    pub broker_order_ids: Vec<String>,
    pub signal_id: String,
    pub opened_at: DateTime<Utc>,
    pub phase_at_entry: u8,
    pub regime_at_entry: i32,
    #[serde(default)]
    pub unrealized_pnl: Decimal,
    #[serde(default)]
    pub last_mark_price: Option<Decimal>,
    #[serde(default)]
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Signed PnL for a holding side: (exit - entry) * size * sign.
    pub fn realized_pnl(&self, exit_price: Decimal, size: Decimal) -> Decimal {
        (exit_price - self.avg_entry_price) * size * Decimal::from(self.side.sign())
    }
}

/// Layering state for a pyramided position. Owned by the Pyramid Manager,
/// keyed by symbol; destroyed with the Position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyramidState {
    pub symbol: String,
    pub side: Side,
    pub layer_count: u32,
    pub entry_prices: Vec<Decimal>,
    pub layer_sizes: Vec<Decimal>,
    pub avg_entry_price: Decimal,
    pub last_entry_price: Decimal,
    pub current_stop: Decimal,
    pub auto_trail_enabled: bool,
    /// Highest layer for which the broker stop update was already issued.
    #[serde(default)]
    pub trailed_at_layer: u32,
}

impl PyramidState {
    pub fn total_size(&self) -> Decimal {
        self.layer_sizes.iter().copied().sum()
    }

    /// sum(p_i * s_i) / sum(s_i).
    pub fn weighted_average(&self) -> Decimal {
        let total = self.total_size();
        if total.is_zero() {
            return Decimal::ZERO;
        }
        let value: Decimal = self
            .entry_prices
            .iter()
            .zip(self.layer_sizes.iter())
            .map(|(p, s)| *p * *s)
            .sum();
        value / total
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub signal_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub size: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub close_reason: String,
    pub phase: u8,
    pub regime_state: i32,
}

/// Account snapshot as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: Decimal,
    pub cash: Decimal,
    pub margin_used: Decimal,
}

/// A position as reported by the broker, consumed by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_intent_lifecycle_is_monotone() {
        use IntentStatus::*;
        assert!(Pending.can_transition_to(Validated));
        assert!(Validated.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Filled));
        assert!(Executing.can_transition_to(Canceled));

        // No backward edges.
        assert!(!Validated.can_transition_to(Pending));
        assert!(!Executing.can_transition_to(Validated));
        assert!(!Filled.can_transition_to(Executing));
        assert!(!Rejected.can_transition_to(Pending));
        // Terminal states have no outgoing edges.
        for next in [Pending, Validated, Rejected, Executing, Filled, Canceled] {
            assert!(!Filled.can_transition_to(next));
            assert!(!Canceled.can_transition_to(next));
            assert!(!Rejected.can_transition_to(next));
        }
    }

    #[test]
    fn test_pyramid_weighted_average() {
        let state = PyramidState {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            layer_count: 2,
            entry_prices: vec![dec!(50000), dec!(51010)],
            layer_sizes: vec![dec!(1.0), dec!(0.5)],
            avg_entry_price: Decimal::ZERO,
            last_entry_price: dec!(51010),
            current_stop: Decimal::ZERO,
            auto_trail_enabled: false,
            trailed_at_layer: 0,
        };

        // (50000*1 + 51010*0.5) / 1.5
        let avg = state.weighted_average();
        assert!((avg - dec!(50336.67)).abs() < dec!(0.01));
        assert_eq!(state.total_size(), dec!(1.5));
    }

    #[test]
    fn test_trigger_condition_evaluation() {
        assert!(TriggerCondition::Above.evaluate(dec!(101), dec!(100)));
        assert!(!TriggerCondition::Above.evaluate(dec!(100), dec!(100)));
        assert!(TriggerCondition::AboveOrEqual.evaluate(dec!(100), dec!(100)));
        assert!(TriggerCondition::Below.evaluate(dec!(99), dec!(100)));
        assert!(TriggerCondition::BelowOrEqual.evaluate(dec!(100), dec!(100)));
    }

    #[test]
    fn test_position_realized_pnl_sign() {
        let long = Position {
            symbol: "ETHUSDT".to_string(),
            side: Side::Long,
            size: dec!(2),
            avg_entry_price: dec!(2000),
            current_stop: dec!(1900),
            take_profits: vec![],
            broker_order_ids: vec![],
            signal_id: "sig-1".to_string(),
            opened_at: Utc::now(),
            phase_at_entry: 1,
            regime_at_entry: 0,
            unrealized_pnl: Decimal::ZERO,
            last_mark_price: None,
            reconciled_at: None,
        };
        assert_eq!(long.realized_pnl(dec!(2100), dec!(2)), dec!(200));

        let mut short = long.clone();
        short.side = Side::Short;
        assert_eq!(short.realized_pnl(dec!(2100), dec!(2)), dec!(-200));
    }

    #[test]
    fn test_signal_wire_format() {
        let raw = r#"{
            "signal_id": "sig-42",
            "type": "PREPARE",
            "symbol": "BTCUSDT",
            "direction": 1,
            "entry_zone": [50100.0, 50050.0],
            "stop_loss": 49500.0,
            "take_profits": [50900.0, 51400.0],
            "size": 0.1,
            "signal_type": "SCALP",
            "urgency_score": 80,
            "timestamp": 1700000000000,
            "bar_index": 12,
            "regime": {"trend": 1, "vol": 0, "regime_state": 1, "structure_score": 72.5, "momentum_score": 60.0}
        }"#;

        let signal: Signal = serde_json::from_str(raw).expect("signal should parse");
        assert_eq!(signal.kind, SignalKind::Prepare);
        assert_eq!(signal.signal_type, SignalType::Scalp);
        assert_eq!(signal.side(), Side::Long);
        assert_eq!(signal.regime.regime_state, 1);
    }
}
