use crate::error::{ErrorCode, IngressError};
use crate::ingress::{IngressDispatcher, IngressResponse};
use crate::model::Signal;
use crate::security::SignatureValidator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const MAX_FRAME_BYTES: u32 = 1 << 20;
const FAST_STALE_MS: i64 = 5_000;

/// One request frame: length-prefixed MessagePack of `{signal, timestamp,
/// signature}`. The MAC covers `{signal, timestamp}` serialized canonically
/// (sorted keys), matching the strategy source.
#[derive(Debug, Deserialize)]
struct FastRequest {
    signal: serde_json::Value,
    timestamp: i64,
    signature: String,
}

#[derive(Debug, Serialize)]
struct FastReply {
    #[serde(flatten)]
    response: IngressResponse,
}

/// Low-latency REQ/REP ingress over TCP. Mirrors the HTTP webhook semantics
/// plus a `latency_ms` field in every reply.
pub struct FastIngress {
    dispatcher: Arc<IngressDispatcher>,
    port: u16,
}

impl FastIngress {
    pub fn new(dispatcher: Arc<IngressDispatcher>, port: u16) -> Arc<Self> {
        Arc::new(Self { dispatcher, port })
    }

    async fn process_frame(&self, frame: &[u8]) -> IngressResponse {
        let started = self.dispatcher.ctx.time.now_millis();
        let mut response = self.process_inner(frame).await;
        response.latency_ms = Some(self.dispatcher.ctx.time.now_millis() - started);
        response
    }

    async fn process_inner(&self, frame: &[u8]) -> IngressResponse {
        let request: FastRequest = match rmp_serde::from_slice(frame) {
            Ok(r) => r,
            Err(e) => {
                return failure(None, ErrorCode::InvalidSignature, &format!("bad frame: {}", e))
            }
        };

        let now_ms = self.dispatcher.ctx.time.now_millis();
        // Stale-message policy: one-sided, reject old frames outright.
        if now_ms - request.timestamp > FAST_STALE_MS {
            return failure(
                None,
                ErrorCode::StaleTimestamp,
                &format!("frame is {}ms old", now_ms - request.timestamp),
            );
        }

        let canonical = SignatureValidator::canonical_fast_payload(&request.signal, request.timestamp);
        if let Err(e) = self.dispatcher.security.verify(
            canonical.as_bytes(),
            &request.signature,
            None,
            request.timestamp,
            now_ms,
        ) {
            return failure(None, e.code(), &e.to_string());
        }

        let signal: Signal = match serde_json::from_value(request.signal) {
            Ok(s) => s,
            Err(e) => {
                let err = IngressError::Malformed(e.to_string());
                return failure(None, err.code(), &err.to_string());
            }
        };

        self.dispatcher.dispatch(signal).await
    }

    async fn serve_connection(self: Arc<Self>, mut stream: TcpStream, peer: String) {
        loop {
            let len = match stream.read_u32().await {
                Ok(len) => len,
                Err(_) => break, // peer went away
            };
            if len == 0 || len > MAX_FRAME_BYTES {
                warn!(peer = %peer, len, "Fast ingress frame length out of range");
                break;
            }

            let mut frame = vec![0u8; len as usize];
            if stream.read_exact(&mut frame).await.is_err() {
                break;
            }

            let response = self.process_frame(&frame).await;
            let reply = match rmp_serde::to_vec_named(&FastReply { response }) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Fast ingress reply encode failed: {}", e);
                    break;
                }
            };

            if stream.write_u32(reply.len() as u32).await.is_err() {
                break;
            }
            if stream.write_all(&reply).await.is_err() {
                break;
            }
        }
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let addr = format!("0.0.0.0:{}", server.port);
            let listener = match TcpListener::bind(&addr).await {
                Ok(l) => {
                    info!("⚡ Fast ingress listening on {}", addr);
                    l
                }
                Err(e) => {
                    error!("Fast ingress bind failed on {}: {}", addr, e);
                    return;
                }
            };

            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            server.serve_connection(stream, peer.to_string()).await;
                        });
                    }
                    Err(e) => warn!("Fast ingress accept failed: {}", e),
                }
            }
        })
    }
}

fn failure(signal_id: Option<&str>, code: ErrorCode, detail: &str) -> IngressResponse {
    warn!(code = %code, detail = %detail, "Fast ingress frame rejected");
    IngressResponse {
        success: false,
        signal_id: signal_id.map(|s| s.to_string()),
        status: "REJECTED".to_string(),
        code: Some(code),
        broker_order_id: None,
        fill_price: None,
        fill_size: None,
        duplicate: None,
        latency_ms: None,
    }
}
