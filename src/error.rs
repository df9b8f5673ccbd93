use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable failure codes surfaced on the wire and in events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidSignature,
    StaleTimestamp,
    ReplayedSignal,
    RateLimited,
    NoMarketData,
    WideSpread,
    InsufficientDepth,
    ObiAdverse,
    WeakStructure,
    SignalTypeNotAllowed,
    MissedEntry,
    FillTimeout,
    AlphaExpired,
    ObiWorsening,
    NoPriceData,
    BrokerRejected,
    BrokerTransient,
    ReconciliationDivergence,
    PersistenceUnavailable,
    PhantomLocalPosition,
    UnknownBrokerPosition,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            ErrorCode::StaleTimestamp => "STALE_TIMESTAMP",
            ErrorCode::ReplayedSignal => "REPLAYED_SIGNAL",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::NoMarketData => "NO_MARKET_DATA",
            ErrorCode::WideSpread => "WIDE_SPREAD",
            ErrorCode::InsufficientDepth => "INSUFFICIENT_DEPTH",
            ErrorCode::ObiAdverse => "OBI_ADVERSE",
            ErrorCode::WeakStructure => "WEAK_STRUCTURE",
            ErrorCode::SignalTypeNotAllowed => "SIGNAL_TYPE_NOT_ALLOWED",
            ErrorCode::MissedEntry => "MISSED_ENTRY",
            ErrorCode::FillTimeout => "FILL_TIMEOUT",
            ErrorCode::AlphaExpired => "ALPHA_EXPIRED",
            ErrorCode::ObiWorsening => "OBI_WORSENING",
            ErrorCode::NoPriceData => "NO_PRICE_DATA",
            ErrorCode::BrokerRejected => "BROKER_REJECTED",
            ErrorCode::BrokerTransient => "BROKER_TRANSIENT",
            ErrorCode::ReconciliationDivergence => "RECONCILIATION_DIVERGENCE",
            ErrorCode::PersistenceUnavailable => "PERSISTENCE_UNAVAILABLE",
            ErrorCode::PhantomLocalPosition => "PHANTOM_LOCAL_POSITION",
            ErrorCode::UnknownBrokerPosition => "UNKNOWN_BROKER_POSITION",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ingress-layer failures. Unauthenticated, malformed, and replayed messages
/// fail with distinct kinds and are never forwarded further.
#[derive(Error, Debug)]
pub enum IngressError {
    #[error("signature verification failed: {0}")]
    InvalidSignature(String),
    #[error("timestamp drift {drift_ms}ms exceeds tolerance {max_ms}ms")]
    StaleTimestamp { drift_ms: i64, max_ms: i64 },
    #[error("signal {0} already processed")]
    ReplayedSignal(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("signal type not allowed in current phase")]
    SignalTypeNotAllowed,
    #[error("microstructure validation rejected: {0}")]
    Validation(ErrorCode),
    #[error("no intent found for signal {0}")]
    UnknownIntent(String),
}

impl IngressError {
    pub fn code(&self) -> ErrorCode {
        match self {
            IngressError::InvalidSignature(_) => ErrorCode::InvalidSignature,
            IngressError::StaleTimestamp { .. } => ErrorCode::StaleTimestamp,
            IngressError::ReplayedSignal(_) => ErrorCode::ReplayedSignal,
            IngressError::Malformed(_) => ErrorCode::InvalidSignature,
            IngressError::SignalTypeNotAllowed => ErrorCode::SignalTypeNotAllowed,
            IngressError::Validation(code) => *code,
            IngressError::UnknownIntent(_) => ErrorCode::MissedEntry,
        }
    }
}

/// Broker-facing failures as classified by the gateway.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("rate limiter exhausted within bounded wait")]
    RateLimited,
    #[error("broker rejected request: {0}")]
    Rejected(String),
    #[error("transient broker fault: {0}")]
    Transient(String),
    #[error("authentication failure: {0}")]
    Auth(String),
    #[error("capability not supported by this adapter: {0}")]
    Unsupported(&'static str),
    #[error("order {0} not found")]
    OrderNotFound(String),
}

impl BrokerError {
    /// Only transient faults are eligible for gateway retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            BrokerError::RateLimited => ErrorCode::RateLimited,
            BrokerError::Transient(_) => ErrorCode::BrokerTransient,
            _ => ErrorCode::BrokerRejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::ObiAdverse).unwrap(),
            "\"OBI_ADVERSE\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::SignalTypeNotAllowed).unwrap(),
            "\"SIGNAL_TYPE_NOT_ALLOWED\""
        );
        assert_eq!(ErrorCode::PhantomLocalPosition.as_str(), "PHANTOM_LOCAL_POSITION");
    }

    #[test]
    fn test_broker_error_retry_classification() {
        assert!(BrokerError::Transient("timeout".into()).is_transient());
        assert!(!BrokerError::Rejected("bad size".into()).is_transient());
        assert!(!BrokerError::RateLimited.is_transient());
        assert_eq!(BrokerError::RateLimited.code(), ErrorCode::RateLimited);
    }
}
