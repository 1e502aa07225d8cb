//! Error types for the certificate client.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS: {0}")]
    Tls(#[from] rustls::Error),

    #[error("TLS DNS name: {0}")]
    TlsDns(#[from] rustls::pki_types::InvalidDnsNameError),

    #[error("TLS verifier: {0}")]
    Verifier(String),

    #[error("Task join: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("GraphQL: {0}")]
    GraphQl(String),

    #[error("Protocol: {0}")]
    Protocol(String),

    #[error("MQTT: {0}")]
    Mqtt(String),

    #[error("{entity} not found ({key})")]
    NotFound { entity: &'static str, key: String },

    #[error("certificate {handle} not yet signed")]
    NotYetSigned { handle: String },

    #[error("timed out after {after:?} waiting for {what}")]
    TimedOut { what: String, after: Duration },

    #[error("failed to create certificate:{0}")]
    Rejected(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("file {} already exists", .0.display())]
    AlreadyExists(PathBuf),

    #[error("key file {} not found", .0.display())]
    KeyNotFound(PathBuf),

    #[error("cannot decode key file {}: {reason}", .path.display())]
    KeyDecode { path: PathBuf, reason: String },

    #[error("key generation: {0}")]
    Generation(String),

    #[error("CSR: {0}")]
    Csr(#[from] rcgen::Error),

    #[error("OAuth state mismatch; possible CSRF or stale login link")]
    StateMismatch,

    #[error("{0} not set")]
    MissingCredentials(&'static str),

    #[error("token exchange: {0}")]
    TokenExchange(String),

    #[error("cannot open browser: {0}")]
    Browser(String),

    #[error("Config: {0}")]
    Config(String),
}

impl CertError {
    /// Errors a poll loop may retry: the authority is reachable in principle
    /// but the answer is not there yet (or the network hiccupped).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Http(_)
                | Self::Json(_)
                | Self::GraphQl(_)
                | Self::Protocol(_)
                | Self::NotYetSigned { .. }
        )
    }
}

impl From<rustls::client::VerifierBuilderError> for CertError {
    fn from(e: rustls::client::VerifierBuilderError) -> Self {
        Self::Verifier(e.to_string())
    }
}

impl From<rsa::Error> for CertError {
    fn from(e: rsa::Error) -> Self {
        Self::Generation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CertError>;
