//! TLS client used to prove an issued certificate works end to end.
//!
//! The client configuration:
//!   - trusts exactly the supplied CA certificates, never the system roots
//!   - presents the issued certificate and its private key (mutual TLS)
//!   - optionally tolerates a hostname mismatch; chain, expiry and EKU are
//!     still enforced
//!
//! Uses the process-wide rustls provider when one is installed, otherwise
//! the post-quantum provider.

use std::fs;
use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore,
    SignatureScheme,
};
use rustls_pemfile::{certs, private_key};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{CertError, Result};

pub fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls_post_quantum::provider()))
}

/// A root store holding exactly `cas` (DER).
pub fn trust_store(cas: &[Vec<u8>]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for der in cas {
        roots.add(CertificateDer::from(der.clone()))?;
    }
    if roots.is_empty() {
        return Err(CertError::Config("no CA certificate to trust".into()));
    }
    Ok(roots)
}

/// Certificate chain and private key presented to the peer.
pub struct ClientIdentity {
    chain: Vec<CertificateDer<'static>>,
    key:   PrivateKeyDer<'static>,
}

impl ClientIdentity {
    pub fn load(cert_file: &Path, key_file: &Path) -> Result<Self> {
        let cert_pem = fs::read(cert_file)?;
        let chain: Vec<CertificateDer<'static>> = certs(&mut Cursor::new(cert_pem))
            .collect::<io::Result<Vec<_>>>()?;
        if chain.is_empty() {
            return Err(CertError::Decode(format!(
                "no certificate found in {}",
                cert_file.display()
            )));
        }

        let key_pem = fs::read(key_file)?;
        let key = private_key(&mut Cursor::new(key_pem))?.ok_or_else(|| CertError::KeyDecode {
            path:   key_file.to_path_buf(),
            reason: "no private key found".into(),
        })?;
        Ok(Self { chain, key })
    }
}

// ── Server certificate verifier ──────────────────────────────────────────────

/// WebPki chain verification with optional hostname tolerance.
#[derive(Debug)]
struct BrokerVerifier {
    inner:           Arc<dyn ServerCertVerifier>,
    provider:        Arc<CryptoProvider>,
    verify_hostname: bool,
}

impl BrokerVerifier {
    fn new(roots: RootCertStore, provider: Arc<CryptoProvider>, verify_hostname: bool) -> Result<Arc<Self>> {
        let inner = rustls::client::WebPkiServerVerifier::builder_with_provider(
            Arc::new(roots),
            Arc::clone(&provider),
        )
        .build()?;
        Ok(Arc::new(Self { inner, provider, verify_hostname }))
    }
}

impl ServerCertVerifier for BrokerVerifier {
    fn verify_server_cert(
        &self,
        end_entity:    &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name:   &ServerName<'_>,
        ocsp_response: &[u8],
        now:           UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        match self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
            Err(TlsError::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) if !self.verify_hostname => {
                warn!("broker certificate does not match {server_name:?}; accepted (hostname check off)");
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert:    &CertificateDer<'_>,
        dss:     &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert:    &CertificateDer<'_>,
        dss:     &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

pub fn build_client_config(
    roots:           RootCertStore,
    identity:        ClientIdentity,
    verify_hostname: bool,
) -> Result<Arc<ClientConfig>> {
    let provider = crypto_provider();
    let verifier = BrokerVerifier::new(roots, Arc::clone(&provider), verify_hostname)?;
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(identity.chain, identity.key)?;
    Ok(Arc::new(config))
}

// ── Validator ────────────────────────────────────────────────────────────────

/// What a successful handshake negotiated.
#[derive(Debug, Clone)]
pub struct HandshakeSummary {
    pub peer:         SocketAddr,
    pub protocol:     Option<rustls::ProtocolVersion>,
    pub cipher_suite: Option<rustls::CipherSuite>,
}

/// Opens a mutual-TLS connection to `host:port` with the issued credential.
pub struct TrustValidator {
    connector:   TlsConnector,
    server_name: ServerName<'static>,
    host:        String,
    port:        u16,
}

impl TrustValidator {
    pub fn new(
        ca:              &[Vec<u8>],
        cert_file:       &Path,
        key_file:        &Path,
        host:            &str,
        port:            u16,
        verify_hostname: bool,
    ) -> Result<Self> {
        let roots = trust_store(ca)?;
        debug!("trusting {} CA certificate(s)", roots.len());
        let identity = ClientIdentity::load(cert_file, key_file)?;
        let config = build_client_config(roots, identity, verify_hostname)?;
        Ok(Self {
            connector:   TlsConnector::from(config),
            server_name: ServerName::try_from(host.to_string())?,
            host:        host.to_string(),
            port,
        })
    }

    /// Connect and complete the handshake. A rejected handshake is
    /// [`CertError::Tls`].
    pub async fn handshake(&self) -> Result<HandshakeSummary> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let peer = stream.peer_addr()?;
        let tls = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(handshake_error)?;

        let (_, conn) = tls.get_ref();
        let summary = HandshakeSummary {
            peer,
            protocol:     conn.protocol_version(),
            cipher_suite: conn.negotiated_cipher_suite().map(|s| s.suite()),
        };
        info!(
            "TLS handshake with {}:{} ({peer}) succeeded: {:?} {:?}",
            self.host, self.port, summary.protocol, summary.cipher_suite
        );
        Ok(summary)
    }
}

/// tokio-rustls reports handshake failures as `io::Error`; surface the
/// rustls error underneath.
fn handshake_error(e: io::Error) -> CertError {
    if e.get_ref().is_some_and(|inner| inner.is::<TlsError>()) {
        if let Some(inner) = e.into_inner() {
            if let Ok(tls) = inner.downcast::<TlsError>() {
                return CertError::Tls(*tls);
            }
        }
        return CertError::Verifier("handshake failed".into());
    }
    CertError::Io(e)
}
