//! Interactsh client
//!
//! Implements the interactsh session protocol: register a public key plus
//! correlation id, poll for AES-encrypted interactions, deregister on
//! close. The client moves through `Idle -> Polling -> Closed`; `Closed`
//! is terminal. Payload subdomains are minted locally from the
//! correlation id, so one registration serves any number of payloads.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::http::{HttpRequest, HttpTransport};

use super::crypto::CryptoSession;
use super::{OastEvent, OastService, ProviderKind, RegisteredPayload};

pub const DEFAULT_CORRELATION_ID_LENGTH: usize = 20;
pub const DEFAULT_NONCE_LENGTH: usize = 13;
const SECRET_KEY_LENGTH: usize = 32;

/// Hex digits of the increment suffix inside a generated nonce
const NONCE_COUNTER_DIGITS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Polling,
    Closed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Polling => "polling",
            State::Closed => "closed",
        }
    }
}

/// Everything needed to resume a session without minting a new identity:
/// same correlation id, secret and RSA keypair mean previously issued
/// payload URLs keep routing to us after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub server_url: String,
    pub token: Option<String>,
    pub correlation_id: String,
    pub secret_key: String,
    pub private_key: String,
    pub public_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InteractshOptions {
    pub server_url: String,
    pub token: Option<String>,
    pub correlation_id_length: usize,
    pub nonce_length: usize,
    pub keep_alive: Option<Duration>,
    pub session: Option<SessionInfo>,
}

impl InteractshOptions {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: None,
            correlation_id_length: DEFAULT_CORRELATION_ID_LENGTH,
            nonce_length: DEFAULT_NONCE_LENGTH,
            keep_alive: None,
            session: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = Some(interval);
        self
    }

    pub fn with_session(mut self, session: SessionInfo) -> Self {
        self.session = Some(session);
        self
    }
}

/// One decrypted interaction, as the server serializes it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Interaction {
    pub protocol: Option<String>,
    pub unique_id: Option<String>,
    pub full_id: Option<String>,
    pub q_type: Option<String>,
    pub raw_request: Option<String>,
    pub raw_response: Option<String>,
    pub remote_address: Option<String>,
    pub timestamp: Option<String>,
}

impl Interaction {
    /// Normalize into the common event shape. DNS interactions carry the
    /// query type; for HTTP the method is the first token of the raw
    /// request line.
    pub fn into_event(self) -> OastEvent {
        let method = self
            .q_type
            .clone()
            .filter(|q| !q.is_empty())
            .or_else(|| {
                self.raw_request
                    .as_deref()
                    .and_then(|raw| raw.split_whitespace().next())
                    .map(str::to_string)
            });
        let timestamp = self
            .timestamp
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let full_id = self.full_id.clone().unwrap_or_default();
        let data = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);

        OastEvent {
            id: Uuid::new_v4().to_string(),
            kind: ProviderKind::Interactsh,
            protocol: self.protocol,
            method,
            source: self.remote_address,
            destination: Some(full_id.clone()).filter(|d| !d.is_empty()),
            timestamp,
            correlation_id: full_id,
            raw_request: self.raw_request,
            raw_response: self.raw_response,
            data,
        }
    }
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    #[serde(rename = "public-key")]
    public_key: &'a str,
    #[serde(rename = "secret-key")]
    secret_key: &'a str,
    #[serde(rename = "correlation-id")]
    correlation_id: &'a str,
}

#[derive(Serialize)]
struct DeregisterRequest<'a> {
    #[serde(rename = "correlation-id")]
    correlation_id: &'a str,
    #[serde(rename = "secret-key")]
    secret_key: &'a str,
}

#[derive(Deserialize)]
struct PollResponse {
    #[serde(default)]
    data: Option<Vec<String>>,
    #[serde(default)]
    aes_key: Option<String>,
}

/// Shared by the client handle and its polling task
struct Core {
    server_url: String,
    server_host: String,
    token: Option<String>,
    correlation_id: String,
    secret_key: String,
    crypto: CryptoSession,
    transport: Arc<dyn HttpTransport>,
    state: RwLock<State>,
    registered: AtomicBool,
}

impl Core {
    fn authorized(&self, request: HttpRequest) -> HttpRequest {
        match &self.token {
            Some(token) if !token.is_empty() => request.header("Authorization", token),
            _ => request,
        }
    }

    /// POST the public key and identity to `/register`. Idempotent per
    /// client instance; re-registering the same correlation id against
    /// the server refreshes it.
    async fn register(&self) -> Result<(), ProviderError> {
        if *self.state.read() == State::Closed {
            return Err(ProviderError::InvalidState {
                operation: "register".to_string(),
                state: State::Closed.name().to_string(),
            });
        }
        if self.registered.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.crypto.ensure_keys()?;
        let public_key = self.crypto.encode_public_key()?;
        let body = RegisterRequest {
            public_key: &public_key,
            secret_key: &self.secret_key,
            correlation_id: &self.correlation_id,
        };
        let request = self
            .authorized(HttpRequest::post(format!("{}/register", self.server_url)))
            .json(&body)?;

        let response = self.transport.send(request).await.map_err(|e| {
            ProviderError::Registration {
                provider: "interactsh".to_string(),
                reason: e.to_string(),
            }
        })?;

        if response.status == 401 {
            return Err(ProviderError::AuthRejected { status: 401 });
        }
        if !response.ok() {
            return Err(ProviderError::Registration {
                provider: "interactsh".to_string(),
                reason: format!("server returned status {}", response.status),
            });
        }

        self.registered.store(true, Ordering::SeqCst);
        info!(
            correlation_id = %self.correlation_id,
            server = %self.server_url,
            "registered with interactsh server"
        );
        Ok(())
    }

    /// One `/poll` round trip. Decrypt/parse failures skip that item;
    /// a 401 means the session credentials are no longer accepted.
    async fn poll_once(
        &self,
        on_interaction: &(dyn Fn(Interaction) + Send + Sync),
    ) -> Result<usize, ProviderError> {
        let url = format!(
            "{}/poll?id={}&secret={}",
            self.server_url, self.correlation_id, self.secret_key
        );
        let response = self.transport.send(self.authorized(HttpRequest::get(url))).await?;

        if response.status == 401 {
            return Err(ProviderError::AuthRejected { status: 401 });
        }
        if !response.ok() {
            return Err(ProviderError::Registration {
                provider: "interactsh".to_string(),
                reason: format!("poll returned status {}", response.status),
            });
        }

        let poll: PollResponse = response.json()?;
        let (Some(items), Some(aes_key)) = (poll.data, poll.aes_key) else {
            return Ok(0);
        };

        let mut delivered = 0;
        for item in &items {
            let plaintext = match self.crypto.decrypt_message(&aes_key, item) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(error = %e, "failed to decrypt interaction, skipping");
                    continue;
                }
            };
            match serde_json::from_str::<Interaction>(&plaintext) {
                Ok(interaction) => {
                    on_interaction(interaction);
                    delivered += 1;
                }
                Err(e) => warn!(error = %e, "failed to parse interaction, skipping"),
            }
        }

        Ok(delivered)
    }

    /// POST `/deregister`, releasing the correlation id server-side
    async fn deregister(&self) -> Result<(), ProviderError> {
        let body = DeregisterRequest {
            correlation_id: &self.correlation_id,
            secret_key: &self.secret_key,
        };
        let request = self
            .authorized(HttpRequest::post(format!("{}/deregister", self.server_url)))
            .json(&body)?;

        let response = self.transport.send(request).await.map_err(|e| {
            ProviderError::Deregistration {
                reason: e.to_string(),
            }
        })?;
        if !response.ok() {
            return Err(ProviderError::Deregistration {
                reason: format!("server returned status {}", response.status),
            });
        }

        self.registered.store(false, Ordering::SeqCst);
        info!(correlation_id = %self.correlation_id, "deregistered from interactsh server");
        Ok(())
    }
}

struct PollWorker {
    quit: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct InteractshClient {
    core: Arc<Core>,
    nonce_length: usize,
    keep_alive: Option<Duration>,
    url_counter: AtomicU32,
    worker: Mutex<Option<PollWorker>>,
}

impl InteractshClient {
    /// Build a client from options. With a session, identity and keypair
    /// come from the saved material; otherwise a fresh correlation id and
    /// secret are generated and keys are created lazily at registration.
    pub fn new(
        options: InteractshOptions,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, ProviderError> {
        let (server_url, token, correlation_id, secret_key, crypto) = match options.session {
            Some(session) => {
                let crypto = CryptoSession::from_private_key_pem(&session.private_key)?;
                (
                    session.server_url,
                    session.token,
                    session.correlation_id,
                    session.secret_key,
                    crypto,
                )
            }
            None => (
                options.server_url,
                options.token,
                random_id(options.correlation_id_length),
                random_id(SECRET_KEY_LENGTH),
                CryptoSession::new(),
            ),
        };

        let server_url = server_url.trim_end_matches('/').to_string();
        let parsed = url::Url::parse(&server_url).map_err(|_| ProviderError::Invalid {
            field: "url".to_string(),
            reason: format!("'{}' is not a valid URL", server_url),
        })?;
        let host = parsed.host_str().ok_or_else(|| ProviderError::Invalid {
            field: "url".to_string(),
            reason: "must include a host".to_string(),
        })?;
        let server_host = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            core: Arc::new(Core {
                server_url,
                server_host,
                token,
                correlation_id,
                secret_key,
                crypto,
                transport,
                state: RwLock::new(State::Idle),
                registered: AtomicBool::new(false),
            }),
            nonce_length: options.nonce_length,
            keep_alive: options.keep_alive,
            url_counter: AtomicU32::new(0),
            worker: Mutex::new(None),
        })
    }

    pub fn correlation_id(&self) -> &str {
        &self.core.correlation_id
    }

    pub fn is_polling(&self) -> bool {
        *self.core.state.read() == State::Polling
    }

    pub fn is_registered(&self) -> bool {
        self.core.registered.load(Ordering::SeqCst)
    }

    /// Register, then begin the polling loop if a keep-alive interval was
    /// configured. Each decrypted interaction is handed to the callback.
    pub async fn start<F>(&self, on_interaction: F) -> Result<(), ProviderError>
    where
        F: Fn(Interaction) + Send + Sync + 'static,
    {
        self.core.register().await?;
        if let Some(interval) = self.keep_alive {
            self.start_polling(interval, Arc::new(on_interaction))?;
        }
        Ok(())
    }

    /// Spawn the cooperative polling loop. The quit channel is checked
    /// both while a poll is in flight and while sleeping, so a stop
    /// request never waits for the interval to elapse.
    pub fn start_polling(
        &self,
        interval: Duration,
        on_interaction: Arc<dyn Fn(Interaction) + Send + Sync>,
    ) -> Result<(), ProviderError> {
        {
            let mut state = self.core.state.write();
            match *state {
                State::Idle => *state = State::Polling,
                current => {
                    return Err(ProviderError::InvalidState {
                        operation: "start_polling".to_string(),
                        state: current.name().to_string(),
                    })
                }
            }
        }

        let (quit_tx, mut quit_rx) = watch::channel(false);
        let core = self.core.clone();
        let handle = tokio::spawn(async move {
            debug!(
                correlation_id = %core.correlation_id,
                interval_ms = interval.as_millis() as u64,
                "interactsh polling loop started"
            );
            loop {
                tokio::select! {
                    _ = quit_rx.changed() => break,
                    result = core.poll_once(on_interaction.as_ref()) => match result {
                        Ok(delivered) if delivered > 0 => {
                            debug!(count = delivered, "interactsh interactions delivered");
                        }
                        Ok(_) => {}
                        Err(ProviderError::AuthRejected { status }) => {
                            error!(status, "interactsh rejected session credentials, stopping loop");
                            break;
                        }
                        Err(e) => warn!(error = %e, "interactsh poll failed"),
                    }
                }
                tokio::select! {
                    _ = quit_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            let mut state = core.state.write();
            if *state == State::Polling {
                *state = State::Idle;
            }
            debug!(correlation_id = %core.correlation_id, "interactsh polling loop ended");
        });

        *self.worker.lock() = Some(PollWorker {
            quit: quit_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the polling loop (waiting for it to wind down), then close
    pub async fn stop(&self) -> Result<(), ProviderError> {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.quit.send(true);
            if worker.handle.await.is_err() {
                debug!("interactsh polling task aborted abnormally");
            }
        }
        {
            let mut state = self.core.state.write();
            if *state == State::Polling {
                *state = State::Idle;
            }
        }

        self.close().await
    }

    /// Deregister and transition to `Closed`. Guarded: not valid while
    /// polling, not valid twice. A failed deregistration leaves the
    /// client `Idle` so the call can be retried.
    pub async fn close(&self) -> Result<(), ProviderError> {
        {
            let state = self.core.state.read();
            match *state {
                State::Idle => {}
                current => {
                    return Err(ProviderError::InvalidState {
                        operation: "close".to_string(),
                        state: current.name().to_string(),
                    })
                }
            }
        }

        if self.core.registered.load(Ordering::SeqCst) {
            self.core.deregister().await?;
        }
        *self.core.state.write() = State::Closed;
        Ok(())
    }

    /// Mint a payload subdomain without touching the network: correlation
    /// id, then a random nonce whose last four digits encode `increment`
    /// in hex. Requires a live registration.
    pub fn generate_url(&self, increment: u32) -> Option<RegisteredPayload> {
        if *self.core.state.read() == State::Closed
            || !self.core.registered.load(Ordering::SeqCst)
        {
            return None;
        }

        let random_len = self.nonce_length.saturating_sub(NONCE_COUNTER_DIGITS);
        let unique_id = format!(
            "{}{}{:04x}",
            self.core.correlation_id,
            random_id(random_len),
            increment & 0xffff
        );

        Some(RegisteredPayload {
            payload_url: format!("https://{}.{}", unique_id, self.core.server_host),
            id: unique_id,
        })
    }

    /// `generate_url` with an internally advancing increment
    pub fn next_url(&self) -> Option<RegisteredPayload> {
        self.generate_url(self.url_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Export the session for persistence. None until keys exist.
    pub fn session_info(&self) -> Option<SessionInfo> {
        let private_key = self.core.crypto.private_key_pem().ok()?;
        Some(SessionInfo {
            server_url: self.core.server_url.clone(),
            token: self.core.token.clone(),
            correlation_id: self.core.correlation_id.clone(),
            secret_key: self.core.secret_key.clone(),
            private_key,
            public_key: self.core.crypto.public_key_pem().ok(),
        })
    }
}

#[async_trait]
impl OastService for InteractshClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Interactsh
    }

    fn id(&self) -> Option<String> {
        self.is_registered()
            .then(|| self.core.correlation_id.clone())
    }

    fn domain(&self) -> Option<String> {
        self.is_registered()
            .then(|| format!("{}.{}", self.core.correlation_id, self.core.server_host))
    }

    async fn register_and_get_payload(
        &self,
    ) -> Result<Option<RegisteredPayload>, ProviderError> {
        match self.core.register().await {
            Ok(()) => {}
            Err(e @ ProviderError::InvalidState { .. }) => return Err(e),
            Err(e) => {
                error!(error = %e, "interactsh registration failed");
                return Ok(None);
            }
        }

        Ok(Some(RegisteredPayload {
            id: self.core.correlation_id.clone(),
            payload_url: format!(
                "https://{}.{}",
                self.core.correlation_id, self.core.server_host
            ),
        }))
    }

    async fn events(&self) -> Vec<OastEvent> {
        {
            let state = self.core.state.read();
            match *state {
                State::Idle => {}
                State::Polling => {
                    warn!("interactsh polling loop is active, skipping one-shot poll");
                    return Vec::new();
                }
                State::Closed => return Vec::new(),
            }
        }

        if let Err(e) = self.core.register().await {
            warn!(error = %e, "interactsh one-shot poll could not register");
            return Vec::new();
        }

        let collected = Mutex::new(Vec::new());
        if let Err(e) = self
            .core
            .poll_once(&|interaction| collected.lock().push(interaction))
            .await
        {
            warn!(error = %e, "interactsh one-shot poll failed");
        }

        collected
            .into_inner()
            .into_iter()
            .map(Interaction::into_event)
            .collect()
    }
}

fn random_id(length: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpError;
    use crate::http::testing::StaticTransport;
    use crate::provider::crypto::testing::encrypt_interactions;
    use crate::http::HttpResponse;

    fn options() -> InteractshOptions {
        InteractshOptions::new("https://oast.example.com")
    }

    fn ok_json(body: serde_json::Value) -> Result<HttpResponse, HttpError> {
        Ok(HttpResponse {
            status: 200,
            body: body.to_string().into_bytes(),
        })
    }

    /// Responds 200 to register/deregister and replays a fixed poll body
    fn scripted_server(poll_body: serde_json::Value) -> Arc<StaticTransport> {
        Arc::new(StaticTransport::with_fn(move |request| {
            if request.url.ends_with("/register") || request.url.ends_with("/deregister") {
                return ok_json(serde_json::json!({"message": "ok"}));
            }
            ok_json(poll_body.clone())
        }))
    }

    #[tokio::test]
    async fn test_register_sends_kebab_case_identity() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(200, serde_json::json!({"message": "registration successful"}));
        let client = InteractshClient::new(
            options().with_token(Some("tok-1".to_string())),
            transport.clone(),
        )
        .unwrap();

        client.core.register().await.unwrap();
        assert!(client.is_registered());
        assert_eq!(client.correlation_id().len(), DEFAULT_CORRELATION_ID_LENGTH);

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].url.ends_with("/register"));
        assert_eq!(sent[0].header_value("authorization"), Some("tok-1"));

        let body: serde_json::Value =
            serde_json::from_str(sent[0].body.as_deref().unwrap()).unwrap();
        assert!(body.get("public-key").is_some());
        assert_eq!(
            body.get("correlation-id").unwrap().as_str().unwrap(),
            client.correlation_id()
        );
        assert_eq!(
            body.get("secret-key").unwrap().as_str().unwrap().len(),
            32
        );

        // Second registration is served from the cached state
        client.core.register().await.unwrap();
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_register_maps_401_to_auth_rejected() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(401, serde_json::json!({"error": "no token"}));
        let client = InteractshClient::new(options(), transport).unwrap();

        assert!(matches!(
            client.core.register().await,
            Err(ProviderError::AuthRejected { status: 401 })
        ));
        assert!(!client.is_registered());
    }

    #[tokio::test]
    async fn test_one_shot_poll_decrypts_and_skips_bad_items() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(200, serde_json::json!({"message": "ok"}));
        let client = InteractshClient::new(options(), transport.clone()).unwrap();
        client.core.register().await.unwrap();

        let public_pem = client.session_info().unwrap().public_key.unwrap();
        let dns = r#"{"protocol":"dns","full-id":"abc123xyz","q-type":"A","remote-address":"198.51.100.3","timestamp":"2026-02-10T12:00:00Z"}"#;
        let http = r#"{"protocol":"http","full-id":"abc123www","raw-request":"GET /probe HTTP/1.1","remote-address":"198.51.100.4"}"#;
        let (aes_key, mut items) = encrypt_interactions(&public_pem, &[dns, http]);
        items.insert(1, "bm90LWEtcmVhbC1pbnRlcmFjdGlvbg==".to_string());

        transport.push_json(200, serde_json::json!({"data": items, "aes_key": aes_key}));
        let events = client.events().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].protocol.as_deref(), Some("dns"));
        assert_eq!(events[0].method.as_deref(), Some("A"));
        assert_eq!(events[0].correlation_id, "abc123xyz");
        assert_eq!(events[0].source.as_deref(), Some("198.51.100.3"));
        // HTTP method inferred from the request line
        assert_eq!(events[1].method.as_deref(), Some("GET"));
        assert_ne!(events[0].id, events[1].id);
    }

    #[tokio::test]
    async fn test_empty_poll_yields_no_events() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(200, serde_json::json!({"message": "ok"}));
        transport.push_json(200, serde_json::json!({"data": null, "aes_key": null}));
        let client = InteractshClient::new(options(), transport).unwrap();

        assert!(client.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_generate_url_requires_registration() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(200, serde_json::json!({"message": "ok"}));
        let client = InteractshClient::new(options(), transport).unwrap();

        assert!(client.next_url().is_none());

        client.core.register().await.unwrap();
        let first = client.next_url().unwrap();
        let second = client.next_url().unwrap();

        let correlation = client.correlation_id();
        assert!(first.id.starts_with(correlation));
        assert_eq!(first.id.len(), correlation.len() + DEFAULT_NONCE_LENGTH);
        assert!(first.id.ends_with("0000"));
        assert!(second.id.ends_with("0001"));
        assert_ne!(first.id, second.id);
        assert_eq!(
            first.payload_url,
            format!("https://{}.oast.example.com", first.id)
        );
    }

    #[tokio::test]
    async fn test_close_guards_invalid_states() {
        let transport = scripted_server(serde_json::json!({"data": [], "aes_key": null}));
        let client = InteractshClient::new(
            options().with_keep_alive(Duration::from_secs(30)),
            transport,
        )
        .unwrap();

        client.start(|_| {}).await.unwrap();
        assert!(client.is_polling());
        assert!(matches!(
            client.close().await,
            Err(ProviderError::InvalidState { .. })
        ));

        client.stop().await.unwrap();
        assert!(!client.is_polling());
        assert!(matches!(
            client.close().await,
            Err(ProviderError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_without_registration_skips_the_network() {
        let transport = Arc::new(StaticTransport::new());
        let client = InteractshClient::new(options(), transport.clone()).unwrap();

        client.close().await.unwrap();
        assert_eq!(transport.request_count(), 0);
        assert!(matches!(
            client.core.register().await,
            Err(ProviderError::InvalidState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_loop_and_deregisters() {
        let transport = scripted_server(serde_json::json!({"data": [], "aes_key": null}));
        let client = InteractshClient::new(
            options().with_keep_alive(Duration::from_secs(5)),
            transport.clone(),
        )
        .unwrap();

        client.start(|_| {}).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let polls = |reqs: &[crate::http::HttpRequest]| {
            reqs.iter().filter(|r| r.url.contains("/poll")).count()
        };
        assert!(polls(&transport.requests()) >= 1);

        client.stop().await.unwrap();
        let after_stop = polls(&transport.requests());
        assert!(transport
            .requests()
            .iter()
            .any(|r| r.url.ends_with("/deregister")));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(polls(&transport.requests()), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_ends_the_loop() {
        let transport = Arc::new(StaticTransport::with_fn(|request| {
            if request.url.ends_with("/register") {
                return Ok(HttpResponse {
                    status: 200,
                    body: b"{}".to_vec(),
                });
            }
            Ok(HttpResponse {
                status: 401,
                body: b"{}".to_vec(),
            })
        }));
        let client = InteractshClient::new(
            options().with_keep_alive(Duration::from_secs(5)),
            transport.clone(),
        )
        .unwrap();

        client.start(|_| {}).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!client.is_polling());
        let polls = transport
            .requests()
            .iter()
            .filter(|r| r.url.contains("/poll"))
            .count();
        assert_eq!(polls, 1);
    }

    #[tokio::test]
    async fn test_session_restore_keeps_identity_and_keys() {
        let transport = Arc::new(StaticTransport::new());
        transport.push_json(200, serde_json::json!({"message": "ok"}));
        let original = InteractshClient::new(
            options().with_token(Some("tok-1".to_string())),
            transport.clone(),
        )
        .unwrap();
        original.core.register().await.unwrap();
        let session = original.session_info().unwrap();

        transport.push_json(200, serde_json::json!({"message": "ok"}));
        let restored = InteractshClient::new(
            InteractshOptions::new("ignored-in-favor-of-session").with_session(session.clone()),
            transport.clone(),
        )
        .unwrap();
        restored.core.register().await.unwrap();

        assert_eq!(restored.correlation_id(), original.correlation_id());
        let sent = transport.requests();
        let body: serde_json::Value =
            serde_json::from_str(sent[1].body.as_deref().unwrap()).unwrap();
        assert_eq!(
            body.get("correlation-id").unwrap().as_str().unwrap(),
            session.correlation_id
        );
        assert_eq!(sent[1].header_value("authorization"), Some("tok-1"));

        // Restored keypair still decrypts traffic encrypted for the original
        let (aes_key, items) =
            encrypt_interactions(session.public_key.as_deref().unwrap(), &[r#"{"protocol":"dns"}"#]);
        transport.push_json(200, serde_json::json!({"data": items, "aes_key": aes_key}));
        let events = restored.events().await;
        assert_eq!(events.len(), 1);
    }
}
