//! Webhook.site provider adapter
//!
//! Identity is a 36-char UUID token. It comes either out of an existing
//! payload URL (so resumed tasks keep their bin) or from a POST to the
//! token-creation endpoint. Polling reads `token/<id>/requests` newest
//! first. An `Api-Key` header is attached when the provider has a key.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::error::{HttpError, ProviderError};
use crate::http::{HttpRequest, HttpTransport};

use super::{OastEvent, OastService, ProviderKind, RegisteredPayload};

const BASE_URL: &str = "https://webhook.site";

#[derive(Debug, Deserialize)]
struct RequestsPage {
    #[serde(default)]
    data: Vec<CapturedRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CapturedRequest {
    uuid: String,
    created_at: Option<String>,
    updated_at: Option<String>,
    method: Option<String>,
    ip: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    uuid: Option<String>,
}

#[derive(Clone)]
struct Identity {
    token_id: String,
    payload_url: String,
}

pub struct WebhooksiteService {
    api_key: Option<String>,
    transport: Arc<dyn HttpTransport>,
    identity: RwLock<Option<Identity>>,
}

impl WebhooksiteService {
    /// `existing_url` lets a resumed task reuse the UUID already embedded
    /// in its payload instead of minting a fresh token.
    pub fn new(
        api_key: Option<String>,
        existing_url: Option<&str>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let identity = existing_url.and_then(Self::identity_from_url);
        if let Some(identity) = &identity {
            debug!(token = %identity.token_id, "reusing existing webhook.site token");
        }

        Self {
            api_key,
            transport,
            identity: RwLock::new(identity),
        }
    }

    fn identity_from_url(url: &str) -> Option<Identity> {
        let pattern = Regex::new(r"(?i)webhook\.site/([a-f0-9-]{36})").ok()?;
        let token_id = pattern.captures(url)?.get(1)?.as_str().to_string();
        let payload_url = format!("{}/{}", BASE_URL, token_id);
        Some(Identity {
            token_id,
            payload_url,
        })
    }

    fn with_api_key(&self, request: HttpRequest) -> HttpRequest {
        match &self.api_key {
            Some(key) => request.header("Api-Key", key),
            None => request,
        }
    }

    fn normalize(&self, captured: CapturedRequest, destination: &str) -> OastEvent {
        let timestamp = captured
            .created_at
            .as_deref()
            .or(captured.updated_at.as_deref())
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);
        let data = serde_json::to_value(&captured).unwrap_or(serde_json::Value::Null);
        let raw_request = captured
            .content
            .clone()
            .or_else(|| serde_json::to_string(&data).ok());

        OastEvent {
            id: captured.uuid.clone(),
            kind: ProviderKind::Webhooksite,
            protocol: Some("HTTP".to_string()),
            method: captured.method,
            source: captured.ip,
            destination: Some(destination.to_string()),
            timestamp,
            correlation_id: captured.uuid,
            raw_request,
            raw_response: None,
            data,
        }
    }
}

/// Webhook.site reports `Y-m-d H:i:s` timestamps; accept RFC 3339 too
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(rfc3339) = DateTime::parse_from_rfc3339(value) {
        return Some(rfc3339.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[async_trait]
impl OastService for WebhooksiteService {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Webhooksite
    }

    fn id(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.token_id.clone())
    }

    fn domain(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.payload_url.clone())
    }

    async fn register_and_get_payload(
        &self,
    ) -> Result<Option<RegisteredPayload>, ProviderError> {
        if let Some(identity) = self.identity.read().as_ref() {
            return Ok(Some(RegisteredPayload {
                id: identity.token_id.clone(),
                payload_url: identity.payload_url.clone(),
            }));
        }

        let body = json!({
            "default_status": 200,
            "default_content": "Hello world!",
            "default_content_type": "text/html",
        });
        let request = self.with_api_key(HttpRequest::post(format!("{}/token", BASE_URL)))
            .json(&body)
            .map_err(ProviderError::Http)?;

        let token: TokenResponse = match self.transport.send(request).await {
            Ok(response) if response.ok() => match response.json() {
                Ok(token) => token,
                Err(e) => {
                    error!(error = %e, "webhook.site registration response is not JSON");
                    return Ok(None);
                }
            },
            Ok(response) => {
                error!(status = response.status, "webhook.site registration failed");
                return Ok(None);
            }
            Err(e) => {
                error!(error = %e, "webhook.site registration request failed");
                return Ok(None);
            }
        };

        let Some(token_id) = token.uuid.filter(|u| !u.is_empty()) else {
            error!("webhook.site registration response is missing uuid");
            return Ok(None);
        };

        let payload_url = format!("{}/{}", BASE_URL, token_id);
        *self.identity.write() = Some(Identity {
            token_id: token_id.clone(),
            payload_url: payload_url.clone(),
        });

        Ok(Some(RegisteredPayload {
            id: token_id,
            payload_url,
        }))
    }

    async fn events(&self) -> Vec<OastEvent> {
        let Some(identity) = self.identity.read().clone() else {
            debug!("webhook.site has no token to poll yet");
            return Vec::new();
        };

        let url = format!(
            "{}/token/{}/requests?sorting=newest",
            BASE_URL, identity.token_id
        );
        let request = self.with_api_key(HttpRequest::get(url));

        let page: RequestsPage = match self.transport.send(request).await {
            Ok(response) if response.ok() => match response.json() {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "webhook.site poll response is not JSON");
                    return Vec::new();
                }
            },
            Ok(response) => {
                warn!(status = response.status, "webhook.site poll failed");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "webhook.site poll request failed");
                return Vec::new();
            }
        };

        page.data
            .into_iter()
            .map(|captured| self.normalize(captured, &identity.payload_url))
            .collect()
    }
}
