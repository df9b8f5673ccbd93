use crate::error::IngressError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashSet;
use std::env;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Verifies the keyed MAC over the exact serialized payload bytes.
/// The MAC is hex-encoded and checked in constant time via `verify_slice`;
/// the hex string itself is never compared directly.
#[derive(Clone)]
pub struct SignatureValidator {
    secret: String,
    known_sources: HashSet<String>,
    max_drift_ms: i64,
}

impl SignatureValidator {
    pub fn new(secret: String, known_sources: Vec<String>, max_drift_ms: i64) -> Self {
        Self {
            secret,
            known_sources: known_sources.into_iter().collect(),
            max_drift_ms,
        }
    }

    /// Load from env. Empty secret is FATAL unless explicitly allowed for
    /// testing, preventing production startup with missing credentials.
    pub fn from_env(max_drift_ms: i64) -> Self {
        let secret = env::var("VEGA_SIGNING_SECRET").unwrap_or_default();

        if secret.is_empty() {
            let allow_empty = env::var("VEGA_ALLOW_EMPTY_SECRET")
                .map(|v| v == "true")
                .unwrap_or(false);

            if allow_empty {
                warn!("VEGA_SIGNING_SECRET not set but VEGA_ALLOW_EMPTY_SECRET=true. TEST MODE ONLY.");
            } else {
                panic!(
                    "FATAL: VEGA_SIGNING_SECRET environment variable is required. \
                     Set VEGA_ALLOW_EMPTY_SECRET=true only for testing."
                );
            }
        } else {
            info!("🔐 Signature validator initialized (drift tolerance {}ms)", max_drift_ms);
        }

        let sources = env::var("VEGA_KNOWN_SOURCES")
            .unwrap_or_else(|_| "strategy-engine".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            secret,
            known_sources: sources,
            max_drift_ms,
        }
    }

    /// Verify the MAC over `payload` exactly as received, plus source identity
    /// and timestamp drift. Distinct error kinds for each failure class.
    pub fn verify(
        &self,
        payload: &[u8],
        signature_hex: &str,
        source: Option<&str>,
        timestamp_ms: i64,
        now_ms: i64,
    ) -> Result<(), IngressError> {
        if self.secret.is_empty() {
            return Err(IngressError::InvalidSignature(
                "signing secret not configured".to_string(),
            ));
        }

        if let Some(source) = source {
            if !self.known_sources.contains(source) {
                return Err(IngressError::InvalidSignature(format!(
                    "unknown source '{}'",
                    source
                )));
            }
        }

        let drift_ms = (now_ms - timestamp_ms).abs();
        if drift_ms > self.max_drift_ms {
            return Err(IngressError::StaleTimestamp {
                drift_ms,
                max_ms: self.max_drift_ms,
            });
        }

        let sig_bytes = hex::decode(signature_hex)
            .map_err(|_| IngressError::InvalidSignature("signature is not valid hex".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| IngressError::InvalidSignature("invalid secret key length".to_string()))?;
        mac.update(payload);

        // Constant-time comparison.
        mac.verify_slice(&sig_bytes)
            .map_err(|_| IngressError::InvalidSignature("signature mismatch".to_string()))
    }

    /// Sign a payload; used by the mock strategy source in tests and the
    /// fast-ingress reply path.
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Canonical serialization for the fast-ingress MAC: serde_json sorts
    /// object keys alphabetically, matching the strategy source's
    /// canonicalize().
    pub fn canonical_fast_payload(signal: &serde_json::Value, timestamp_ms: i64) -> String {
        let envelope = serde_json::json!({
            "signal": signal,
            "timestamp": timestamp_ms,
        });
        envelope.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SignatureValidator {
        SignatureValidator::new(
            "test-secret".to_string(),
            vec!["strategy-engine".to_string()],
            5_000,
        )
    }

    #[test]
    fn test_valid_signature_accepted() {
        let v = validator();
        let body = br#"{"signal_id":"sig-1"}"#;
        let sig = v.sign(body);
        assert!(v.verify(body, &sig, Some("strategy-engine"), 1_000, 1_500).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let v = validator();
        let sig = v.sign(br#"{"signal_id":"sig-1"}"#);
        let result = v.verify(br#"{"signal_id":"sig-2"}"#, &sig, None, 1_000, 1_000);
        assert!(matches!(result, Err(IngressError::InvalidSignature(_))));
    }

    #[test]
    fn test_unknown_source_rejected() {
        let v = validator();
        let body = b"payload";
        let sig = v.sign(body);
        let result = v.verify(body, &sig, Some("attacker"), 1_000, 1_000);
        assert!(matches!(result, Err(IngressError::InvalidSignature(_))));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let v = validator();
        let body = b"payload";
        let sig = v.sign(body);
        let result = v.verify(body, &sig, None, 1_000, 7_001);
        assert!(matches!(result, Err(IngressError::StaleTimestamp { drift_ms: 6_001, .. })));
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let v = validator();
        let result = v.verify(b"payload", "not-hex!@#", None, 1_000, 1_000);
        assert!(matches!(result, Err(IngressError::InvalidSignature(_))));
    }

    #[test]
    fn test_canonical_payload_sorts_keys() {
        let signal = serde_json::json!({"b": 2, "a": 1});
        let canonical = SignatureValidator::canonical_fast_payload(&signal, 99);
        assert_eq!(canonical, r#"{"signal":{"a":1,"b":2},"timestamp":99}"#);
    }
}
