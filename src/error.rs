//! Custom error types for Oasthub
//!
//! Provides structured error handling with user-friendly error messages.

use thiserror::Error;

/// Main error type for Oasthub operations
#[derive(Error, Debug)]
pub enum OasthubError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    /// Provider adapter errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Crypto session errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Persistence errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {path}")]
    ReadError { path: String, source: std::io::Error },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("Could not determine the {0} directory")]
    UnknownDirectory(&'static str),
}

/// HTTP transport errors
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Failed to serialize request body: {0}")]
    Encode(String),

    #[error("Failed to decode response body: {0}")]
    Decode(String),
}

/// Provider adapter errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{provider} provider requires a non-empty token (Secret)")]
    MissingToken { provider: String },

    #[error("Registration with {provider} failed: {reason}")]
    Registration { provider: String, reason: String },

    #[error("Could not deregister from server: {reason}")]
    Deregistration { reason: String },

    #[error("Authentication rejected by server (status {status})")]
    AuthRejected { status: u16 },

    #[error("Invalid client state for {operation}: {state}")]
    InvalidState { operation: String, state: String },

    #[error("Client is not registered")]
    NotRegistered,

    #[error("Unknown provider kind: {0}")]
    UnknownKind(String),

    #[error("Invalid provider record: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("HTTP failure: {0}")]
    Http(#[from] HttpError),

    #[error("Crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

/// Crypto session errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("No keypair has been generated for this session")]
    Uninitialized,

    #[error("Invalid key material: {0}")]
    Key(String),

    #[error("Base64 decode failed: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Malformed ciphertext: {0}")]
    Malformed(String),

    #[error("Decrypted data is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read store file: {path}")]
    Read { path: String, source: std::io::Error },

    #[error("Failed to write store file: {path}")]
    Write { path: String, source: std::io::Error },

    #[error("Failed to serialize store data: {0}")]
    Serialize(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("An active polling task already watches {payload} in tab {tab_id}")]
    DuplicateTask { tab_id: String, payload: String },

    #[error("Invalid value for {field}: {reason}")]
    Validation { field: String, reason: String },
}

impl OasthubError {
    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            OasthubError::Config(e) => format!("Configuration problem: {}", e.user_hint()),
            OasthubError::Http(e) => format!("Network issue: {}", e.user_hint()),
            OasthubError::Provider(e) => format!("Provider issue: {}", e.user_hint()),
            OasthubError::Crypto(e) => format!("Crypto issue: {}", e.user_hint()),
            OasthubError::Store(e) => format!("Storage issue: {}", e.user_hint()),
            OasthubError::Io(e) => format!("File system issue: {}", e),
        }
    }
}

/// Trait for providing user-friendly hints
pub trait UserHint {
    fn user_hint(&self) -> String;
}

impl UserHint for ConfigError {
    fn user_hint(&self) -> String {
        match self {
            ConfigError::ReadError { path, .. } => {
                format!("Could not read '{}'. Check if the file exists and you have read permissions.", path)
            }
            ConfigError::ParseError(_) => {
                "The configuration file has invalid syntax. Check for TOML formatting errors.".into()
            }
            ConfigError::ValidationError { field, reason } => {
                format!("Invalid value for '{}': {}", field, reason)
            }
            ConfigError::UnknownDirectory(which) => {
                format!("No home directory available to place the {} directory. Set one explicitly with --data-dir.", which)
            }
        }
    }
}

impl UserHint for HttpError {
    fn user_hint(&self) -> String {
        match self {
            HttpError::RequestFailed(_) => {
                "Could not reach the provider server. Check if it's running and accessible.".into()
            }
            HttpError::Timeout(ms) => {
                format!("Request timed out after {}ms. The provider may be slow or unresponsive.", ms)
            }
            HttpError::InvalidUrl(url) => {
                format!("'{}' is not a valid URL. Check the format.", url)
            }
            _ => self.to_string(),
        }
    }
}

impl UserHint for ProviderError {
    fn user_hint(&self) -> String {
        match self {
            ProviderError::MissingToken { provider } => {
                format!("The {} provider needs a token. Set one on the provider record.", provider)
            }
            ProviderError::AuthRejected { .. } => {
                "The server rejected this session's credentials. Re-register the provider.".into()
            }
            ProviderError::UnknownKind(kind) => {
                format!("'{}' is not a supported provider kind. Use interactsh, boast, webhooksite or postbin.", kind)
            }
            ProviderError::Invalid { field, reason } => {
                format!("Invalid value for '{}': {}", field, reason)
            }
            _ => self.to_string(),
        }
    }
}

impl UserHint for CryptoError {
    fn user_hint(&self) -> String {
        match self {
            CryptoError::Uninitialized => {
                "The session keypair is missing. Start or restore the session first.".into()
            }
            _ => self.to_string(),
        }
    }
}

impl UserHint for StoreError {
    fn user_hint(&self) -> String {
        match self {
            StoreError::Read { path, .. } => {
                format!("Could not read '{}'. Check if the file exists and you have read permissions.", path)
            }
            StoreError::Write { path, .. } => {
                format!("Could not write '{}'. Check directory permissions.", path)
            }
            StoreError::DuplicateTask { tab_id, payload } => {
                format!("Tab '{}' already watches '{}'. Stop the existing task first.", tab_id, payload)
            }
            _ => self.to_string(),
        }
    }
}
