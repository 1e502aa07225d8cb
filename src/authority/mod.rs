//! Certificate authority boundary.
//!
//! [`Authority`] is the typed request/response surface the issuance flow
//! depends on; [`graphql::AuthorityClient`] implements it against the remote
//! GraphQL API. Every lookup distinguishes found, not found
//! ([`CertError::NotFound`]) and transport/protocol failure.

pub mod graphql;
mod queries;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{CertError, Result};
use crate::keys::SigningRequest;

pub use graphql::AuthorityClient;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

opaque_id!(
    /// The certificate authority identity that signs requests.
    IssuerId
);
opaque_id!(DomainId);
opaque_id!(
    /// The system or component a certificate authenticates as.
    EntityId
);
opaque_id!(
    /// Returned when a signing request is accepted; the polling key.
    IssuanceHandle
);

impl std::str::FromStr for IssuanceHandle {
    type Err = CertError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(IssuanceHandle)
            .map_err(|e| CertError::Config(format!("invalid certificate UUID {s:?}: {e}")))
    }
}

/// What a certificate is issued for, looked up by its human-readable code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    System(String),
    Component(String),
}

impl EntityRef {
    pub fn code(&self) -> &str {
        match self {
            EntityRef::System(c) | EntityRef::Component(c) => c,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EntityRef::System(_)    => "system",
            EntityRef::Component(_) => "component",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Usage {
    ClientAuth,
    ServerAuth,
}

/// Everything the authority needs to accept a signing request.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub issuer:   IssuerId,
    pub entity:   EntityId,
    pub name:     String,
    pub csr:      SigningRequest,
    /// ISO-8601 duration, e.g. `P365D`.
    pub duration: String,
    pub usages:   Vec<Usage>,
}

/// A signed certificate as reported by the authority.
///
/// Only constructed from non-empty bytes that parse as X.509.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der:       Vec<u8>,
    name:      String,
    not_after: Option<DateTime<Utc>>,
}

impl Certificate {
    pub fn from_der(der: Vec<u8>, name: impl Into<String>) -> Result<Self> {
        if der.is_empty() {
            return Err(CertError::Decode("empty certificate".into()));
        }
        let not_after = {
            let (_, parsed) = x509_parser::parse_x509_certificate(&der)
                .map_err(|e| CertError::Decode(format!("not an X.509 certificate: {e}")))?;
            DateTime::from_timestamp(parsed.validity().not_after.timestamp(), 0)
        };
        Ok(Self { der, name: name.into(), not_after })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.not_after
    }
}

/// Result of a single certificate lookup. An empty certificate field is a
/// well-defined pending state, never a zero-length signed certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Signed(Certificate),
    Pending { name: String },
}

#[async_trait]
pub trait Authority: Send + Sync {
    async fn resolve_issuer(&self, name: &str) -> Result<IssuerId>;

    /// The domain the credential belongs to.
    async fn resolve_domain(&self) -> Result<DomainId>;

    async fn resolve_entity(&self, entity: &EntityRef) -> Result<EntityId>;

    /// Submit a CSR. Rejections carry the authority's per-constraint reasons
    /// in [`CertError::Rejected`].
    async fn submit_certificate(&self, request: &SubmitRequest) -> Result<IssuanceHandle>;

    async fn fetch_certificate(&self, handle: &IssuanceHandle) -> Result<FetchOutcome>;

    /// DER bytes of the issuer's CA certificate.
    async fn fetch_ca(&self, issuer: &str) -> Result<Vec<u8>>;
}

/// Decode a certificate payload from the wire: PEM text, or base64 of the
/// DER bytes (padding optional).
pub(crate) fn decode_payload(text: &str) -> Result<Vec<u8>> {
    let text = text.trim();
    if text.starts_with("-----BEGIN") {
        let block = pem::parse(text).map_err(|e| CertError::Decode(format!("PEM: {e}")))?;
        return Ok(block.into_contents());
    }
    const LENIENT: GeneralPurpose = GeneralPurpose::new(
        &alphabet::STANDARD,
        GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
    );
    let compact: String = text.split_whitespace().collect();
    LENIENT
        .decode(compact)
        .map_err(|e| CertError::Decode(format!("base64: {e}")))
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};

    use super::fake::test_certificate_der;
    use super::*;

    #[test]
    fn payload_accepts_pem_and_base64() {
        let der = test_certificate_der("device-01");
        let pem_text = crate::pemfile::encode(crate::pemfile::PemLabel::Certificate, &der);
        assert_eq!(decode_payload(&pem_text).unwrap(), der);
        assert_eq!(decode_payload(&STANDARD.encode(&der)).unwrap(), der);
        assert_eq!(decode_payload(&STANDARD_NO_PAD.encode(&der)).unwrap(), der);
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        assert!(matches!(decode_payload("***"), Err(CertError::Decode(_))));
    }

    #[test]
    fn certificate_requires_x509_bytes() {
        assert!(matches!(Certificate::from_der(vec![], "x"), Err(CertError::Decode(_))));
        assert!(matches!(
            Certificate::from_der(b"not der".to_vec(), "x"),
            Err(CertError::Decode(_))
        ));

        let cert = Certificate::from_der(test_certificate_der("device-01"), "device-01").unwrap();
        assert_eq!(cert.name(), "device-01");
        assert!(cert.not_after().is_some());
    }

    #[test]
    fn usages_serialize_as_graphql_enums() {
        let v = serde_json::to_value([Usage::ClientAuth, Usage::ServerAuth]).unwrap();
        assert_eq!(v, serde_json::json!(["CLIENT_AUTH", "SERVER_AUTH"]));
    }

    #[test]
    fn handle_parses_from_uuid_text() {
        let h: IssuanceHandle = "0b0e7c8a-52f4-4c1b-9f0e-2b8f5b3c9d11".parse().unwrap();
        assert_eq!(h.to_string(), "0b0e7c8a-52f4-4c1b-9f0e-2b8f5b3c9d11");
        assert!("not-a-uuid".parse::<IssuanceHandle>().is_err());
    }
}
