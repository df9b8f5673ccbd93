use crate::config::IngressConfig;
use crate::metrics;
use actix_web::{
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    Error, HttpResponse,
};
use futures::future::{ok, LocalBoxFuture, Ready};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::warn;

const WINDOW: Duration = Duration::from_secs(60);

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

struct LimiterState {
    /// Keyed by a keyed hash of the client IP, so lookups never compare raw
    /// IP strings byte-by-byte.
    entries: Mutex<HashMap<u64, WindowEntry>>,
    hash_key: u64,
    limit: u32,
    sensitive_limit: u32,
}

impl LimiterState {
    fn ip_key(&self, ip: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash_key.hash(&mut hasher);
        ip.hash(&mut hasher);
        hasher.finish()
    }

    /// Sliding-window check; returns seconds to wait when over the limit.
    fn check(&self, ip: &str, sensitive: bool) -> Result<(), u64> {
        let limit = if sensitive {
            self.sensitive_limit
        } else {
            self.limit
        };
        let key = self.ip_key(ip);
        let now = Instant::now();

        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= WINDOW {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        if entry.count > limit {
            let reset = entry.window_start + WINDOW;
            Err(reset.duration_since(now).as_secs().max(1))
        } else {
            Ok(())
        }
    }

    fn cleanup(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .retain(|_, entry| now.duration_since(entry.window_start) < WINDOW * 2);
    }
}

fn is_sensitive(path: &str) -> bool {
    path == "/flatten" || (path.starts_with("/positions/") && path.ends_with("/close"))
}

/// Per-IP ingress limiter: 100 req/min globally, 10 req/min on the paths
/// that move money. Exceeding either answers 429 with `retry-after`.
#[derive(Clone)]
pub struct RateLimitMiddleware {
    state: Arc<LimiterState>,
}

impl RateLimitMiddleware {
    pub fn new(config: &IngressConfig) -> Self {
        let state = Arc::new(LimiterState {
            entries: Mutex::new(HashMap::new()),
            hash_key: std::process::id() as u64 ^ 0x5f3b_9d2e_c4a1_7086,
            limit: config.requests_per_minute,
            sensitive_limit: config.sensitive_requests_per_minute,
        });

        // Background cleanup of idle windows.
        let cleanup_state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WINDOW);
            loop {
                ticker.tick().await;
                cleanup_state.cleanup();
            }
        });

        Self { state }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = RateLimitService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimitService {
            service: Rc::new(service),
            state: self.state.clone(),
        })
    }
}

pub struct RateLimitService<S> {
    service: Rc<S>,
    state: Arc<LimiterState>,
}

impl<S, B> Service<ServiceRequest> for RateLimitService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let srv = self.service.clone();
        let state = self.state.clone();

        Box::pin(async move {
            let path = req.path().to_string();
            // Metrics exposition is never throttled.
            if path == "/metrics" {
                return srv.call(req).await.map(|res| res.map_into_left_body());
            }

            let ip = req
                .connection_info()
                .realip_remote_addr()
                .unwrap_or("unknown")
                .to_string();

            match state.check(&ip, is_sensitive(&path)) {
                Ok(()) => srv.call(req).await.map(|res| res.map_into_left_body()),
                Err(retry_after_secs) => {
                    metrics::inc_ingress_throttled();
                    warn!(path = %path, "Ingress rate limit exceeded");
                    let response = HttpResponse::TooManyRequests()
                        .insert_header((header::RETRY_AFTER, retry_after_secs.to_string()))
                        .json(serde_json::json!({
                            "success": false,
                            "code": "RATE_LIMITED",
                            "retry_after_secs": retry_after_secs,
                        }));
                    Ok(req.into_response(response).map_into_right_body())
                }
            }
        })
    }
}
