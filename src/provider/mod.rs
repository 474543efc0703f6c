//! OAST provider adapters
//!
//! Normalizes four interaction-capture backends (BOAST, Webhook.site,
//! PostBin, Interactsh) behind one `OastService` interface: register a
//! payload, poll for callbacks, map every provider's wire format into the
//! common `OastEvent` shape.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

mod boast;
mod crypto;
mod interactsh;
mod postbin;
mod registry;
mod webhooksite;

pub use boast::BoastService;
pub use crypto::CryptoSession;
pub use interactsh::{
    Interaction, InteractshClient, InteractshOptions, SessionInfo, DEFAULT_NONCE_LENGTH,
};
pub use postbin::PostbinService;
pub use registry::{NewProvider, ProviderRegistry, ProviderUpdate};
pub use webhooksite::WebhooksiteService;

/// The closed set of supported provider kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Interactsh,
    Boast,
    Webhooksite,
    Postbin,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interactsh => write!(f, "interactsh"),
            Self::Boast => write!(f, "boast"),
            Self::Webhooksite => write!(f, "webhooksite"),
            Self::Postbin => write!(f, "postbin"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interactsh" => Ok(Self::Interactsh),
            "boast" => Ok(Self::Boast),
            "webhooksite" | "webhook.site" => Ok(Self::Webhooksite),
            "postbin" | "postb.in" => Ok(Self::Postbin),
            other => Err(ProviderError::UnknownKind(other.to_string())),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// A configured OAST provider record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub url: String,
    pub token: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Provider {
    /// Schema validation: name 1-100 chars, url a well-formed absolute URL
    pub fn validate(&self) -> Result<(), ProviderError> {
        let name = self.name.trim();
        if name.is_empty() || name.len() > 100 {
            return Err(ProviderError::Invalid {
                field: "name".to_string(),
                reason: "must be between 1 and 100 characters".to_string(),
            });
        }

        let parsed = url::Url::parse(&self.url).map_err(|e| ProviderError::Invalid {
            field: "url".to_string(),
            reason: e.to_string(),
        })?;
        if parsed.host_str().is_none() {
            return Err(ProviderError::Invalid {
                field: "url".to_string(),
                reason: "must include a host".to_string(),
            });
        }

        Ok(())
    }
}

/// A normalized OAST interaction
///
/// `id` is stable per underlying provider-side record (that is what
/// deduplication keys on); `correlation_id` ties the event back to the
/// payload or session that produced it. Events are immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OastEvent {
    pub id: String,
    pub kind: ProviderKind,
    pub protocol: Option<String>,
    pub method: Option<String>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub raw_request: Option<String>,
    pub raw_response: Option<String>,
    /// Raw provider payload, kept opaque
    pub data: serde_json::Value,
}

/// Result of a successful provider registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredPayload {
    pub id: String,
    pub payload_url: String,
}

/// Uniform adapter interface over the four provider protocols
///
/// `events` and `register_and_get_payload` are total with respect to
/// crashes: network and parse failures are logged inside the adapter and
/// degrade to an empty list / `Ok(None)`. The only errors that cross this
/// boundary are configuration errors (missing BOAST token) and the
/// Interactsh state-machine guards.
#[async_trait]
pub trait OastService: Send + Sync {
    /// Kind of the backing provider
    fn kind(&self) -> ProviderKind;

    /// Provider-assigned identifier once known
    fn id(&self) -> Option<String>;

    /// Fully resolved payload domain or URL once known
    fn domain(&self) -> Option<String>;

    /// Idempotent registration: a second call returns the cached payload
    /// without touching the network.
    async fn register_and_get_payload(&self)
        -> Result<Option<RegisteredPayload>, ProviderError>;

    /// Fetch and normalize everything the provider currently holds
    async fn events(&self) -> Vec<OastEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, url: &str) -> Provider {
        Provider {
            id: "p-1".to_string(),
            name: name.to_string(),
            kind: ProviderKind::Boast,
            url: url.to_string(),
            token: None,
            enabled: true,
        }
    }

    #[test]
    fn test_kind_round_trips_through_strings() {
        for kind in [
            ProviderKind::Interactsh,
            ProviderKind::Boast,
            ProviderKind::Webhooksite,
            ProviderKind::Postbin,
        ] {
            assert_eq!(kind.to_string().parse::<ProviderKind>().unwrap(), kind);
        }
        assert_eq!("BOAST".parse::<ProviderKind>().unwrap(), ProviderKind::Boast);
        assert!("collaborator".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_kind_serde_uses_lowercase() {
        let json = serde_json::to_string(&ProviderKind::Webhooksite).unwrap();
        assert_eq!(json, r#""webhooksite""#);
    }

    #[test]
    fn test_validate_accepts_reasonable_provider() {
        assert!(provider("BOAST main", "https://boast.example.com/events")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_name_and_url() {
        assert!(provider("", "https://boast.example.com").validate().is_err());
        assert!(provider(&"x".repeat(101), "https://boast.example.com")
            .validate()
            .is_err());
        assert!(provider("ok", "not a url").validate().is_err());
    }

    #[test]
    fn test_enabled_defaults_to_true_when_absent() {
        let parsed: Provider = serde_json::from_str(
            r#"{"id":"1","name":"n","kind":"postbin","url":"https://www.postb.in/x","token":null}"#,
        )
        .unwrap();
        assert!(parsed.enabled);
    }
}
