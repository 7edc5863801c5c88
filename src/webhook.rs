// This file is part of StreamVault, a live-stream recording supervisor.

//! Ingress event contract (spec.md §6): a minimal HTTP server that accepts
//! HMAC-signed event deliveries and hands them to the Event Dispatcher (C6).
//!
//! The web/REST presentation layer itself is out of scope (spec.md §1); this
//! is only the one endpoint the core needs to receive already-validated
//! events from that external layer. Every request must carry a
//! `X-StreamVault-Signature: <hex hmac-sha256 of the body>` header computed
//! with the shared `WEBHOOK_HMAC_SECRET`; a missing or mismatched signature
//! is rejected before the body is ever parsed as JSON.

use crate::events::{Event, EventDispatcher, EventKind};
use base::clock::Clocks;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use ring::hmac;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type Error = base::Error;

const SIGNATURE_HEADER: &str = "x-streamvault-signature";

#[derive(Deserialize)]
struct IngressEvent {
    channel_id: Uuid,
    kind: String,
    platform_stream_id: String,
    title: Option<String>,
    category: Option<String>,
    language: Option<String>,
    arrived_at: chrono::DateTime<chrono::Utc>,
}

impl IngressEvent {
    fn into_event(self) -> Result<Event, Error> {
        let kind = match self.kind.as_str() {
            "online" => EventKind::Online,
            "offline" => EventKind::Offline,
            "channel_update" => EventKind::ChannelUpdate,
            other => {
                return Err(base::format_err_t!(
                    InvalidArgument,
                    "unrecognized event kind {:?}",
                    other
                ))
            }
        };
        Ok(Event {
            channel_id: self.channel_id,
            kind,
            platform_stream_id: self.platform_stream_id,
            title: self.title,
            category: self.category,
            language: self.language,
            arrived_at: self.arrived_at,
        })
    }
}

struct Server<C: Clocks> {
    dispatcher: Arc<EventDispatcher<C>>,
    hmac_key: hmac::Key,
}

impl<C: Clocks + 'static> Server<C> {
    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        if req.method() != http::Method::POST || req.uri().path() != "/events" {
            return Ok(response(StatusCode::NOT_FOUND, "not found"));
        }

        let signature_hex = req
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let Some(signature_hex) = signature_hex else {
            return Ok(response(StatusCode::UNAUTHORIZED, "missing signature"));
        };
        let Ok(signature) = hex::decode(&signature_hex) else {
            return Ok(response(StatusCode::UNAUTHORIZED, "malformed signature"));
        };

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(err = %e, "failed to read request body");
                return Ok(response(StatusCode::BAD_REQUEST, "bad body"));
            }
        };

        if hmac::verify(&self.hmac_key, &body, &signature).is_err() {
            warn!("rejected webhook delivery with invalid signature");
            return Ok(response(StatusCode::UNAUTHORIZED, "invalid signature"));
        }

        let parsed: IngressEvent = match serde_json::from_slice(&body) {
            Ok(e) => e,
            Err(e) => {
                debug!(err = %e, "malformed event payload");
                return Ok(response(StatusCode::BAD_REQUEST, "malformed event"));
            }
        };
        let event = match parsed.into_event() {
            Ok(e) => e,
            Err(e) => return Ok(response(StatusCode::BAD_REQUEST, &e.to_string())),
        };

        match self.dispatcher.dispatch(event).await {
            Ok(()) => Ok(response(StatusCode::ACCEPTED, "")),
            Err(e) => {
                error!(err = %e, "event dispatch failed");
                Ok(response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
            }
        }
    }
}

fn response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_owned())))
        .expect("building a response from a valid status/body cannot fail")
}

/// Binds `bind_addr` and serves the ingress endpoint until `shutdown_rx`
/// fires, then drains in-flight connections gracefully (spec.md §5 "Service
/// shutdown").
pub async fn serve<C: Clocks + 'static>(
    bind_addr: SocketAddr,
    hmac_secret: &[u8],
    dispatcher: Arc<EventDispatcher<C>>,
    mut shutdown_rx: base::shutdown::Receiver,
) -> Result<(), Error> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| base::format_err_t!(ConfigError, "unable to bind {}: {}", bind_addr, e))?;
    info!(%bind_addr, "webhook ingress listening");

    let server = Arc::new(Server {
        dispatcher,
        hmac_key: hmac::Key::new(hmac::HMAC_SHA256, hmac_secret),
    });
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let server = server.clone();
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service_fn(move |req| server.clone().handle(req)));
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(%peer, err = %e, "connection error");
                    }
                });
            }
            _ = shutdown_rx.as_future() => {
                info!("webhook ingress shutting down; draining connections");
                break;
            }
        }
    }
    graceful.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_round_trips() {
        let secret = b"test-secret";
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
        let body = br#"{"channel_id":"00000000-0000-0000-0000-000000000000"}"#;
        let tag = hmac::sign(&key, body);
        assert!(hmac::verify(&key, body, tag.as_ref()).is_ok());
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let body = b"payload";
        let tag = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, b"secret-a"), body);
        let key_b = hmac::Key::new(hmac::HMAC_SHA256, b"secret-b");
        assert!(hmac::verify(&key_b, body, tag.as_ref()).is_err());
    }

    #[test]
    fn ingress_event_rejects_unknown_kind() {
        let parsed = IngressEvent {
            channel_id: Uuid::now_v7(),
            kind: "bogus".to_string(),
            platform_stream_id: "x".to_string(),
            title: None,
            category: None,
            language: None,
            arrived_at: chrono::Utc::now(),
        };
        assert!(parsed.into_event().is_err());
    }

    #[test]
    fn ingress_event_maps_known_kinds() {
        for (raw, expected) in [
            ("online", EventKind::Online),
            ("offline", EventKind::Offline),
            ("channel_update", EventKind::ChannelUpdate),
        ] {
            let parsed = IngressEvent {
                channel_id: Uuid::now_v7(),
                kind: raw.to_string(),
                platform_stream_id: "x".to_string(),
                title: None,
                category: None,
                language: None,
                arrived_at: chrono::Utc::now(),
            };
            assert_eq!(parsed.into_event().unwrap().kind, expected);
        }
    }
}
