//! Provider registry
//!
//! CRUD over persisted provider records, plus the factory that turns a
//! record into a live [`OastService`] adapter. Dispatch is a closed
//! match on [`ProviderKind`]; adding a provider means adding a variant
//! and an arm here.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{OasthubError, ProviderError, StoreError};
use crate::http::HttpTransport;
use crate::store::Store;

use super::{
    BoastService, InteractshClient, InteractshOptions, OastService, PostbinService, Provider,
    ProviderKind, SessionInfo, WebhooksiteService,
};

/// Input for registering a provider
#[derive(Debug, Clone)]
pub struct NewProvider {
    pub name: String,
    pub kind: ProviderKind,
    pub url: String,
    pub token: Option<String>,
}

/// Partial update. `token: Some(None)` clears a stored token;
/// `token: None` leaves it untouched.
#[derive(Debug, Clone, Default)]
pub struct ProviderUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub token: Option<Option<String>>,
    pub enabled: Option<bool>,
}

pub struct ProviderRegistry {
    store: Arc<Store>,
    transport: Arc<dyn HttpTransport>,
}

impl ProviderRegistry {
    pub fn new(store: Arc<Store>, transport: Arc<dyn HttpTransport>) -> Self {
        Self { store, transport }
    }

    pub fn create(&self, new: NewProvider) -> Result<Provider, OasthubError> {
        let provider = Provider {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            kind: new.kind,
            url: new.url,
            token: new.token.filter(|t| !t.is_empty()),
            enabled: true,
        };
        provider.validate()?;
        self.store.insert_provider(provider.clone())?;
        info!(id = %provider.id, name = %provider.name, kind = %provider.kind, "provider added");
        Ok(provider)
    }

    pub fn get(&self, id: &str) -> Option<Provider> {
        self.store.provider(id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<Provider> {
        self.store.provider_by_name(name)
    }

    /// Look a provider up by id first, then by name.
    pub fn resolve(&self, reference: &str) -> Option<Provider> {
        self.get(reference).or_else(|| self.get_by_name(reference))
    }

    pub fn list(&self) -> Vec<Provider> {
        self.store.providers()
    }

    /// Merge the update into the stored record, then re-validate the
    /// whole record before persisting.
    pub fn update(&self, id: &str, update: ProviderUpdate) -> Result<Provider, OasthubError> {
        let mut provider = self.get(id).ok_or_else(|| StoreError::NotFound {
            what: "provider",
            id: id.to_string(),
        })?;
        if let Some(name) = update.name {
            provider.name = name;
        }
        if let Some(url) = update.url {
            provider.url = url;
        }
        if let Some(token) = update.token {
            provider.token = token.filter(|t| !t.is_empty());
        }
        if let Some(enabled) = update.enabled {
            provider.enabled = enabled;
        }
        provider.validate()?;
        self.store.update_provider(provider.clone())?;
        Ok(provider)
    }

    pub fn remove(&self, id: &str) -> Result<bool, OasthubError> {
        let removed = self.store.remove_provider(id)?;
        if removed {
            info!(id, "provider removed");
        }
        Ok(removed)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<Provider, OasthubError> {
        self.update(
            id,
            ProviderUpdate {
                enabled: Some(enabled),
                ..ProviderUpdate::default()
            },
        )
    }

    /// Build a fresh adapter for a record. The adapter registers itself
    /// on first use and mints a new payload.
    pub fn service_for(&self, provider: &Provider) -> Option<Box<dyn OastService>> {
        self.service_for_payload(provider, None)
    }

    /// Build an adapter bound to an existing payload, so a resumed task
    /// keeps polling the bin or token the payload points at instead of
    /// minting a new one. Kinds whose identity lives server-side
    /// (BOAST, Interactsh) ignore the hint.
    pub fn service_for_payload(
        &self,
        provider: &Provider,
        payload: Option<&str>,
    ) -> Option<Box<dyn OastService>> {
        let transport = self.transport.clone();
        match provider.kind {
            ProviderKind::Boast => {
                let token = provider.token.clone().unwrap_or_default();
                match BoastService::new(&provider.url, token, transport) {
                    Ok(service) => Some(Box::new(service)),
                    Err(e) => {
                        warn!(provider = %provider.name, error = %e, "could not build boast adapter");
                        None
                    }
                }
            }
            ProviderKind::Webhooksite => Some(Box::new(WebhooksiteService::new(
                provider.token.clone(),
                payload,
                transport,
            ))),
            ProviderKind::Postbin => Some(Box::new(PostbinService::new(payload, transport))),
            ProviderKind::Interactsh => {
                match self.interactsh_client(provider, None, None) {
                    Ok(client) => Some(Box::new(client)),
                    Err(e) => {
                        warn!(provider = %provider.name, error = %e, "could not build interactsh adapter");
                        None
                    }
                }
            }
        }
    }

    /// Concrete Interactsh client, for callers that need session
    /// persistence and explicit loop control rather than the generic
    /// [`OastService`] surface.
    pub fn interactsh_client(
        &self,
        provider: &Provider,
        session: Option<SessionInfo>,
        keep_alive: Option<Duration>,
    ) -> Result<InteractshClient, ProviderError> {
        let mut options = InteractshOptions::new(&provider.url).with_token(provider.token.clone());
        if let Some(session) = session {
            options = options.with_session(session);
        }
        if let Some(interval) = keep_alive {
            options = options.with_keep_alive(interval);
        }
        InteractshClient::new(options, self.transport.clone())
    }

    /// Build a client from a saved session alone. The session carries the
    /// server url and token, so this works even after the provider record
    /// was deleted.
    pub fn interactsh_client_from_session(
        &self,
        session: SessionInfo,
        keep_alive: Option<Duration>,
    ) -> Result<InteractshClient, ProviderError> {
        let mut options = InteractshOptions::new(&session.server_url)
            .with_token(session.token.clone())
            .with_session(session);
        if let Some(interval) = keep_alive {
            options = options.with_keep_alive(interval);
        }
        InteractshClient::new(options, self.transport.clone())
    }
}
