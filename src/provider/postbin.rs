//! PostBin provider adapter
//!
//! PostBin hands out short-lived bins and its read API is destructive: a
//! shift pops the oldest captured request off the bin. One poll keeps
//! shifting until the server says 404 (drained) or a cap of 100 shifts,
//! which bounds the cost of a single poll. Because a shifted request is
//! gone from the server, a mid-drain failure returns what was collected
//! so far instead of dropping it, and already-seen request ids are
//! tracked per adapter so re-polls stay idempotent.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::error::ProviderError;
use crate::http::{HttpRequest, HttpTransport};

use super::{OastEvent, OastService, ProviderKind, RegisteredPayload};

const BASE_URL: &str = "https://www.postb.in";
const MAX_SHIFTS_PER_POLL: usize = 100;

#[derive(Debug, Deserialize)]
struct ShiftedRequest {
    #[serde(rename = "reqId")]
    req_id: Option<String>,
    method: Option<String>,
    ip: Option<String>,
    inserted: Option<i64>,
    path: Option<String>,
    #[serde(default)]
    headers: serde_json::Value,
    #[serde(default)]
    query: serde_json::Value,
    #[serde(default)]
    body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BinResponse {
    #[serde(rename = "binId")]
    bin_id: Option<String>,
}

#[derive(Clone)]
struct Identity {
    bin_id: String,
    payload_url: String,
}

pub struct PostbinService {
    transport: Arc<dyn HttpTransport>,
    identity: RwLock<Option<Identity>>,
    seen_request_ids: Mutex<HashSet<String>>,
}

impl PostbinService {
    pub fn new(existing_url: Option<&str>, transport: Arc<dyn HttpTransport>) -> Self {
        let identity = existing_url.and_then(Self::identity_from_url);
        if let Some(identity) = &identity {
            debug!(bin = %identity.bin_id, "reusing existing postbin bin");
        }

        Self {
            transport,
            identity: RwLock::new(identity),
            seen_request_ids: Mutex::new(HashSet::new()),
        }
    }

    fn identity_from_url(url: &str) -> Option<Identity> {
        let pattern = Regex::new(r"(?i)postb\.in/([a-zA-Z0-9-]+)").ok()?;
        let bin_id = pattern.captures(url)?.get(1)?.as_str().to_string();
        let payload_url = format!("{}/{}", BASE_URL, bin_id);
        Some(Identity {
            bin_id,
            payload_url,
        })
    }

    fn normalize(&self, raw: serde_json::Value, shifted: ShiftedRequest, destination: &str) -> Option<OastEvent> {
        let req_id = shifted.req_id?;

        let timestamp = shifted
            .inserted
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        let raw_request = serde_json::to_string_pretty(&json!({
            "method": shifted.method,
            "path": shifted.path,
            "headers": shifted.headers,
            "query": shifted.query,
            "body": shifted.body,
        }))
        .ok();

        Some(OastEvent {
            id: req_id.clone(),
            kind: ProviderKind::Postbin,
            protocol: Some("HTTP".to_string()),
            method: Some(shifted.method.unwrap_or_else(|| "GET".to_string())),
            source: Some(shifted.ip.unwrap_or_else(|| "unknown".to_string())),
            destination: Some(destination.to_string()),
            timestamp,
            correlation_id: req_id,
            raw_request,
            raw_response: None,
            data: raw,
        })
    }
}

#[async_trait]
impl OastService for PostbinService {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Postbin
    }

    fn id(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.bin_id.clone())
    }

    fn domain(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.payload_url.clone())
    }

    async fn register_and_get_payload(
        &self,
    ) -> Result<Option<RegisteredPayload>, ProviderError> {
        if let Some(identity) = self.identity.read().as_ref() {
            return Ok(Some(RegisteredPayload {
                id: identity.bin_id.clone(),
                payload_url: identity.payload_url.clone(),
            }));
        }

        let request = HttpRequest::post(format!("{}/api/bin", BASE_URL))
            .header("Content-Type", "application/json");

        let bin: BinResponse = match self.transport.send(request).await {
            Ok(response) if response.ok() => match response.json() {
                Ok(bin) => bin,
                Err(e) => {
                    error!(error = %e, "postbin registration response is not JSON");
                    return Ok(None);
                }
            },
            Ok(response) => {
                error!(status = response.status, "postbin registration failed");
                return Ok(None);
            }
            Err(e) => {
                error!(error = %e, "postbin registration request failed");
                return Ok(None);
            }
        };

        let Some(bin_id) = bin.bin_id.filter(|b| !b.is_empty()) else {
            error!("postbin registration response is missing binId");
            return Ok(None);
        };

        let payload_url = format!("{}/{}", BASE_URL, bin_id);
        *self.identity.write() = Some(Identity {
            bin_id: bin_id.clone(),
            payload_url: payload_url.clone(),
        });

        Ok(Some(RegisteredPayload {
            id: bin_id,
            payload_url,
        }))
    }

    async fn events(&self) -> Vec<OastEvent> {
        let Some(identity) = self.identity.read().clone() else {
            debug!("postbin has no bin to poll yet");
            return Vec::new();
        };

        let shift_url = format!("{}/api/bin/{}/req/shift", BASE_URL, identity.bin_id);
        let mut events = Vec::new();

        for _ in 0..MAX_SHIFTS_PER_POLL {
            let response = match self.transport.send(HttpRequest::get(&shift_url)).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, collected = events.len(), "postbin shift failed mid-drain");
                    return events;
                }
            };

            if response.status == 404 {
                break;
            }
            if !response.ok() {
                warn!(status = response.status, collected = events.len(), "postbin shift failed mid-drain");
                return events;
            }

            let raw: serde_json::Value = match response.json() {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "postbin shift body is not JSON, stopping drain");
                    break;
                }
            };
            let shifted: ShiftedRequest = match serde_json::from_value(raw.clone()) {
                Ok(shifted) => shifted,
                Err(e) => {
                    warn!(error = %e, "malformed postbin request, skipping");
                    continue;
                }
            };

            let Some(req_id) = shifted.req_id.clone() else {
                continue;
            };
            if !self.seen_request_ids.lock().insert(req_id) {
                continue;
            }

            if let Some(event) = self.normalize(raw, shifted, &identity.payload_url) {
                events.push(event);
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpError;
    use crate::http::testing::StaticTransport;

    fn shift_body(req_id: &str) -> serde_json::Value {
        serde_json::json!({
            "reqId": req_id,
            "method": "POST",
            "ip": "192.0.2.4",
            "inserted": 1_760_000_000_000_i64,
            "path": "/cb",
            "headers": {"host": "www.postb.in"},
            "query": {"x": "1"},
            "body": {"k": "v"}
        })
    }

    #[tokio::test]
    async fn test_identity_extracted_from_existing_url() {
        let transport = Arc::new(StaticTransport::new());
        let service = PostbinService::new(Some("https://www.postb.in/AbC-123"), transport.clone());

        assert_eq!(service.id().as_deref(), Some("AbC-123"));
        assert_eq!(
            service.domain().as_deref(),
            Some("https://www.postb.in/AbC-123")
        );

        let payload = service.register_and_get_payload().await.unwrap().unwrap();
        assert_eq!(payload.id, "AbC-123");
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_events_shift_until_404() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(200, shift_body("req-1"));
        transport.push_json(200, shift_body("req-2"));
        transport.push_json(404, serde_json::json!({}));
        let service = PostbinService::new(Some("https://postb.in/mybin"), transport.clone());

        let events = service.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(transport.request_count(), 3);

        let event = &events[0];
        assert_eq!(event.id, "req-1");
        assert_eq!(event.kind, ProviderKind::Postbin);
        assert_eq!(event.method.as_deref(), Some("POST"));
        assert_eq!(event.source.as_deref(), Some("192.0.2.4"));
        assert_eq!(event.timestamp.timestamp_millis(), 1_760_000_000_000);
        assert!(event.raw_request.as_deref().unwrap().contains("\"path\""));

        let sent = transport.requests();
        assert!(sent[0]
            .url
            .ends_with("api/bin/mybin/req/shift"));
    }

    #[tokio::test]
    async fn test_seen_request_ids_are_skipped_on_repoll() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(200, shift_body("req-1"));
        transport.push_json(404, serde_json::json!({}));
        // Second poll replays req-1, then yields a fresh one
        transport.push_json(200, shift_body("req-1"));
        transport.push_json(200, shift_body("req-2"));
        transport.push_json(404, serde_json::json!({}));
        let service = PostbinService::new(Some("https://postb.in/mybin"), transport);

        let first = service.events().await;
        let second = service.events().await;

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, "req-2");
    }

    #[tokio::test]
    async fn test_shift_cap_bounds_a_single_poll() {
        let counter = std::sync::atomic::AtomicUsize::new(0);
        let transport = Arc::new(StaticTransport::with_fn(move |_| {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(crate::http::HttpResponse {
                status: 200,
                body: shift_body(&format!("req-{}", n)).to_string().into_bytes(),
            })
        }));
        let service = PostbinService::new(Some("https://postb.in/mybin"), transport.clone());

        let events = service.events().await;
        assert_eq!(events.len(), 100);
        assert_eq!(transport.request_count(), 100);
    }

    #[tokio::test]
    async fn test_mid_drain_failure_keeps_collected_events() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(200, shift_body("req-1"));
        transport.push_err(HttpError::Timeout(10_000));
        let service = PostbinService::new(Some("https://postb.in/mybin"), transport);

        let events = service.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "req-1");
    }

    #[tokio::test]
    async fn test_registration_creates_a_bin() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(201, serde_json::json!({"binId": "fresh-bin", "expires": 1_760_001_000_000_i64}));
        let service = PostbinService::new(None, transport.clone());

        let payload = service.register_and_get_payload().await.unwrap().unwrap();
        assert_eq!(payload.id, "fresh-bin");
        assert_eq!(payload.payload_url, "https://www.postb.in/fresh-bin");

        let sent = transport.requests();
        assert_eq!(sent[0].method, "POST");
        assert!(sent[0].url.ends_with("/api/bin"));
    }

    #[tokio::test]
    async fn test_registration_without_bin_id_returns_none() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(200, serde_json::json!({"msg": "try later"}));
        let service = PostbinService::new(None, transport);

        assert_eq!(service.register_and_get_payload().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_events_without_identity_skip_the_network() {
        let transport = Arc::new(StaticTransport::new());
        let service = PostbinService::new(Some("https://example.com/other"), transport.clone());

        assert!(service.events().await.is_empty());
        assert_eq!(transport.request_count(), 0);
    }
}
