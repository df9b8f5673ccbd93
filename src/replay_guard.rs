use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// At-most-once guard over `signal_id`. Process-wide: initialized during
/// startup, explicitly shut down with the process.
///
/// The hot path is the in-memory map. When a Redis URL is configured, every
/// first-sight is mirrored with `SET NX PX`; any Redis failure degrades to
/// in-memory only and must never cause a legitimate signal to be rejected.
pub struct ReplayGuard {
    seen: DashMap<String, i64>,
    ttl_ms: i64,
    mirror: Option<redis::Client>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ReplayGuard {
    pub fn new(ttl_ms: i64, redis_url: Option<&str>) -> Arc<Self> {
        let mirror = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => {
                    info!("Replay guard mirroring to Redis at {}", url);
                    Some(client)
                }
                Err(e) => {
                    warn!("Replay mirror unavailable, in-memory only: {}", e);
                    None
                }
            },
            None => None,
        };

        Arc::new(Self {
            seen: DashMap::new(),
            ttl_ms,
            mirror,
            sweeper: parking_lot::Mutex::new(None),
        })
    }

    /// Atomic test-and-set. Returns true when the id was already seen within
    /// the TTL window.
    pub fn seen_before(&self, signal_id: &str, now_ms: i64) -> bool {
        let mut replayed = false;

        // Entry API keeps test-and-set atomic per key.
        self.seen
            .entry(signal_id.to_string())
            .and_modify(|seen_at| {
                if now_ms - *seen_at <= self.ttl_ms {
                    replayed = true;
                } else {
                    // Expired record: reclaim the id.
                    *seen_at = now_ms;
                }
            })
            .or_insert(now_ms);

        if !replayed {
            self.mirror_first_sight(signal_id, now_ms);
        }
        replayed
    }

    /// Timestamp drift validation shared with ingress.
    pub fn within_drift(&self, signal_ts_ms: i64, now_ms: i64, max_drift_ms: i64) -> bool {
        (now_ms - signal_ts_ms).abs() <= max_drift_ms
    }

    fn mirror_first_sight(&self, signal_id: &str, now_ms: i64) {
        let Some(client) = &self.mirror else {
            return;
        };
        let client = client.clone();
        let key = format!("vega:replay:{}", signal_id);
        let ttl_ms = self.ttl_ms as u64;

        // Fire-and-forget: the mirror is advisory.
        tokio::spawn(async move {
            match client.get_async_connection().await {
                Ok(mut conn) => {
                    let set: Result<Option<String>, _> = redis::cmd("SET")
                        .arg(&key)
                        .arg(now_ms)
                        .arg("NX")
                        .arg("PX")
                        .arg(ttl_ms)
                        .query_async(&mut conn)
                        .await;
                    if let Err(e) = set {
                        debug!("Replay mirror write failed: {}", e);
                    }
                }
                Err(e) => debug!("Replay mirror connection failed: {}", e),
            }
        });
    }

    /// Background sweep of expired records.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let guard = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now_ms = chrono::Utc::now().timestamp_millis();
                let before = guard.seen.len();
                guard.seen.retain(|_, seen_at| now_ms - *seen_at <= guard.ttl_ms);
                let swept = before - guard.seen.len();
                if swept > 0 {
                    debug!(swept, remaining = guard.seen.len(), "Replay records expired");
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Explicit teardown; the guard holds a process-wide task.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_sight_then_replay() {
        let guard = ReplayGuard::new(60_000, None);
        assert!(!guard.seen_before("sig-1", 1_000));
        assert!(guard.seen_before("sig-1", 2_000));
        assert!(guard.seen_before("sig-1", 59_000));
    }

    #[tokio::test]
    async fn test_distinct_ids_pass() {
        let guard = ReplayGuard::new(60_000, None);
        assert!(!guard.seen_before("sig-1", 1_000));
        assert!(!guard.seen_before("sig-2", 1_000));
        assert_eq!(guard.len(), 2);
    }

    #[tokio::test]
    async fn test_expired_record_is_reclaimed() {
        let guard = ReplayGuard::new(1_000, None);
        assert!(!guard.seen_before("sig-1", 0));
        // Past TTL the id is processable again.
        assert!(!guard.seen_before("sig-1", 2_000));
        // And immediately guarded again.
        assert!(guard.seen_before("sig-1", 2_500));
    }

    #[tokio::test]
    async fn test_drift_window() {
        let guard = ReplayGuard::new(60_000, None);
        assert!(guard.within_drift(1_000, 5_500, 5_000));
        assert!(guard.within_drift(5_500, 1_000, 5_000));
        assert!(!guard.within_drift(1_000, 6_001, 5_000));
    }

    #[tokio::test]
    async fn test_bad_redis_url_degrades_to_memory() {
        let guard = ReplayGuard::new(60_000, Some("redis://127.0.0.1:1/"));
        // Mirror may fail to connect; the in-memory guard still works.
        assert!(!guard.seen_before("sig-1", 1_000));
        assert!(guard.seen_before("sig-1", 1_500));
    }
}
