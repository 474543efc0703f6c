//! BOAST provider adapter
//!
//! BOAST exposes one endpoint that both registers the client and returns
//! queued events. Auth is `Authorization: Secret <token>`; the first
//! successful response carries `id` and `canary`, and the payload domain
//! is `<canary>.<host>`. An empty token is a configuration error raised
//! before any network call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{HttpError, ProviderError};
use crate::http::{HttpRequest, HttpTransport};

use super::{OastEvent, OastService, ProviderKind, RegisteredPayload};

#[derive(Debug, Deserialize)]
struct BoastResponse {
    id: Option<String>,
    canary: Option<String>,
    #[serde(default)]
    events: Vec<BoastEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BoastEvent {
    id: String,
    time: Option<String>,
    receiver: Option<String>,
    #[serde(rename = "remoteAddress")]
    remote_address: Option<String>,
    dump: Option<String>,
    #[serde(rename = "QueryType")]
    query_type: Option<String>,
}

struct Registration {
    id: String,
    domain: String,
}

pub struct BoastService {
    url: String,
    token: String,
    host: String,
    transport: Arc<dyn HttpTransport>,
    registration: RwLock<Option<Registration>>,
}

impl BoastService {
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, ProviderError> {
        let url = url.into();
        let parsed = url::Url::parse(&url).map_err(|_| ProviderError::Invalid {
            field: "url".to_string(),
            reason: format!("'{}' is not a valid URL", url),
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ProviderError::Invalid {
                field: "url".to_string(),
                reason: "must include a host".to_string(),
            })?
            .to_string();

        Ok(Self {
            url,
            token: token.into(),
            host,
            transport,
            registration: RwLock::new(None),
        })
    }

    /// One round trip to the combined register/poll endpoint
    async fn fetch(&self) -> Result<BoastResponse, ProviderError> {
        let request = HttpRequest::get(&self.url)
            .header("Authorization", format!("Secret {}", self.token));
        let response = self.transport.send(request).await?;

        if !response.ok() {
            return Err(ProviderError::Http(HttpError::RequestFailed(format!(
                "BOAST server returned status {}",
                response.status
            ))));
        }

        Ok(response.json()?)
    }

    /// Record the identity carried by a response, if it has one. The
    /// payload domain is always derived from `canary`.
    fn remember_identity(&self, data: &BoastResponse) -> bool {
        if self.registration.read().is_some() {
            return true;
        }

        let Some(canary) = data.canary.as_deref().filter(|c| !c.is_empty()) else {
            return false;
        };
        let id = data
            .id
            .as_deref()
            .filter(|i| !i.is_empty())
            .unwrap_or(canary);

        *self.registration.write() = Some(Registration {
            id: id.to_string(),
            domain: format!("{}.{}", canary, self.host),
        });
        true
    }

    fn normalize(&self, event: BoastEvent) -> OastEvent {
        let timestamp = event
            .time
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let data = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);

        OastEvent {
            id: event.id.clone(),
            kind: ProviderKind::Boast,
            protocol: event.receiver,
            method: event.query_type,
            source: event.remote_address,
            destination: None,
            timestamp,
            correlation_id: event.id,
            raw_request: event.dump,
            raw_response: None,
            data,
        }
    }
}

#[async_trait]
impl OastService for BoastService {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Boast
    }

    fn id(&self) -> Option<String> {
        self.registration.read().as_ref().map(|r| r.id.clone())
    }

    fn domain(&self) -> Option<String> {
        self.registration.read().as_ref().map(|r| r.domain.clone())
    }

    async fn register_and_get_payload(
        &self,
    ) -> Result<Option<RegisteredPayload>, ProviderError> {
        if self.token.trim().is_empty() {
            return Err(ProviderError::MissingToken {
                provider: "BOAST".to_string(),
            });
        }

        if let Some(registration) = self.registration.read().as_ref() {
            return Ok(Some(RegisteredPayload {
                id: registration.id.clone(),
                payload_url: registration.domain.clone(),
            }));
        }

        let data = match self.fetch().await {
            Ok(data) => data,
            Err(e) => {
                error!(url = %self.url, error = %e, "BOAST registration request failed");
                return Ok(None);
            }
        };

        if !self.remember_identity(&data) {
            error!(url = %self.url, "BOAST registration response is missing id/canary");
            return Ok(None);
        }

        let registration = self.registration.read();
        Ok(registration.as_ref().map(|r| RegisteredPayload {
            id: r.id.clone(),
            payload_url: r.domain.clone(),
        }))
    }

    async fn events(&self) -> Vec<OastEvent> {
        let data = match self.fetch().await {
            Ok(data) => data,
            Err(e) => {
                warn!(url = %self.url, error = %e, "BOAST poll failed");
                return Vec::new();
            }
        };

        self.remember_identity(&data);
        data.events
            .into_iter()
            .map(|event| self.normalize(event))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::StaticTransport;

    fn service(token: &str, transport: Arc<StaticTransport>) -> BoastService {
        BoastService::new("https://boast.example.com/events", token, transport).unwrap()
    }

    #[tokio::test]
    async fn test_empty_token_is_rejected_before_any_request() {
        let transport = Arc::new(StaticTransport::new());
        let boast = service("", transport.clone());

        let result = boast.register_and_get_payload().await;
        assert!(matches!(
            result,
            Err(ProviderError::MissingToken { .. })
        ));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_registration_builds_domain_from_canary() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(
            200,
            serde_json::json!({"id": "reg-id", "canary": "c4n4ry", "events": []}),
        );
        let boast = service("s3cret", transport.clone());

        let payload = boast.register_and_get_payload().await.unwrap().unwrap();
        assert_eq!(payload.id, "reg-id");
        assert_eq!(payload.payload_url, "c4n4ry.boast.example.com");
        assert_eq!(boast.domain().as_deref(), Some("c4n4ry.boast.example.com"));

        let sent = transport.requests();
        assert_eq!(sent[0].header_value("authorization"), Some("Secret s3cret"));
    }

    #[tokio::test]
    async fn test_registration_is_cached_after_first_success() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(
            200,
            serde_json::json!({"id": "reg-id", "canary": "c4n4ry", "events": []}),
        );
        let boast = service("s3cret", transport.clone());

        let first = boast.register_and_get_payload().await.unwrap();
        let second = boast.register_and_get_payload().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_registration_without_canary_returns_none() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(200, serde_json::json!({"events": []}));
        let boast = service("s3cret", transport);

        assert_eq!(boast.register_and_get_payload().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_registration_server_error_returns_none() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(500, serde_json::json!({}));
        let boast = service("s3cret", transport);

        assert_eq!(boast.register_and_get_payload().await.unwrap(), None);
        assert_eq!(boast.id(), None);
    }

    #[tokio::test]
    async fn test_events_map_wire_fields() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(
            200,
            serde_json::json!({
                "id": "reg-id",
                "canary": "c4n4ry",
                "events": [{
                    "id": "evt-1",
                    "time": "2026-02-10T12:00:00Z",
                    "receiver": "dns",
                    "remoteAddress": "203.0.113.9",
                    "dump": ";; QUESTION SECTION",
                    "QueryType": "A"
                }]
            }),
        );
        let boast = service("s3cret", transport);

        let events = boast.events().await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.id, "evt-1");
        assert_eq!(event.kind, ProviderKind::Boast);
        assert_eq!(event.protocol.as_deref(), Some("dns"));
        assert_eq!(event.method.as_deref(), Some("A"));
        assert_eq!(event.source.as_deref(), Some("203.0.113.9"));
        assert_eq!(event.raw_request.as_deref(), Some(";; QUESTION SECTION"));
        assert_eq!(event.correlation_id, "evt-1");
        assert_eq!(event.timestamp.to_rfc3339(), "2026-02-10T12:00:00+00:00");

        // Polling also establishes the identity
        assert_eq!(boast.domain().as_deref(), Some("c4n4ry.boast.example.com"));
    }

    #[tokio::test]
    async fn test_poll_failure_degrades_to_empty() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_err(HttpError::Timeout(10_000));
        let boast = service("s3cret", transport);

        assert!(boast.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_json_body_degrades_to_empty() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_raw(200, b"<html>503 Service Unavailable</html>");
        let boast = service("s3cret", transport);

        assert!(boast.events().await.is_empty());
    }
}
