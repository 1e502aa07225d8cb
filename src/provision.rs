//! End-to-end flows behind the commands: key pairs, certificate issuance,
//! single fetches and CA bundles.
//!
//! Every flow checks its local preconditions (output files free, key file
//! readable) before the first network call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::authority::{Authority, Certificate, EntityRef, FetchOutcome, IssuanceHandle, SubmitRequest, Usage};
use crate::error::{CertError, Result};
use crate::keys::KeyPair;
use crate::pemfile::{self, PemLabel};
use crate::waiter::{IssuanceWaiter, Issued, WaitPolicy};

pub const PRIVATE_KEY_FILE: &str = "private.key";
pub const DEFAULT_DURATION: &str = "P365D";
pub const DEFAULT_ISSUER:   &str = "default";

/// `{dir}/{name}.crt`
pub fn default_cert_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.crt"))
}

// ── Key pairs ────────────────────────────────────────────────────────────────

/// Generate a key pair and write the private (and optionally public) half.
pub async fn create_keypair(bits: usize, private_out: &Path, public_out: Option<&Path>) -> Result<()> {
    if public_out == Some(private_out) {
        return Err(CertError::Config(
            "private key and public key output file cannot be the same".into(),
        ));
    }
    pemfile::ensure_absent(private_out)?;
    if let Some(p) = public_out {
        pemfile::ensure_absent(p)?;
    }

    let key = tokio::task::spawn_blocking(move || KeyPair::generate(bits)).await??;
    key.persist(private_out)?;
    if let Some(p) = public_out {
        key.persist_public(p)?;
    }
    Ok(())
}

/// Write the public half of an existing private key.
pub fn dump_public_key(private_in: &Path, public_out: &Path) -> Result<()> {
    pemfile::ensure_absent(public_out)?;
    KeyPair::load(private_in)?.persist_public(public_out)
}

/// Load the key at `path`; if there is none yet, generate and persist one.
/// A corrupt key file is an error, never replaced.
pub async fn load_or_generate_key(path: &Path, bits: usize) -> Result<KeyPair> {
    match KeyPair::load(path) {
        Ok(key) => Ok(key),
        Err(CertError::KeyNotFound(_)) => {
            info!("private key file {} does not exist; generating a new key pair", path.display());
            let key = tokio::task::spawn_blocking(move || KeyPair::generate(bits)).await??;
            key.persist(path)?;
            Ok(key)
        }
        Err(e) => Err(e),
    }
}

// ── Certificates ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CertificateOrder {
    pub name:         String,
    pub entity:       EntityRef,
    pub issuer:       String,
    /// ISO-8601 duration.
    pub duration:     String,
    pub key_file:     PathBuf,
    pub key_bits:     usize,
    pub cert_outfile: Option<PathBuf>,
    /// Where `{name}.crt` goes when no outfile is given.
    pub out_dir:      PathBuf,
    /// DNS name for server certificates; adds `SERVER_AUTH`.
    pub server_name:  Option<String>,
}

impl CertificateOrder {
    pub fn outfile(&self) -> PathBuf {
        self.cert_outfile.clone().unwrap_or_else(|| default_cert_file(&self.out_dir, &self.name))
    }

    pub fn usages(&self) -> Vec<Usage> {
        match self.server_name {
            Some(_) => vec![Usage::ClientAuth, Usage::ServerAuth],
            None    => vec![Usage::ClientAuth],
        }
    }
}

#[derive(Debug)]
pub struct Provisioned {
    pub path:   PathBuf,
    pub handle: IssuanceHandle,
    pub issued: Issued,
}

/// Request a certificate, wait for it to be signed and write it out.
pub async fn create_certificate<A: Authority + ?Sized + 'static>(
    authority: &Arc<A>,
    order:     &CertificateOrder,
    policy:    WaitPolicy,
) -> Result<Provisioned> {
    let path = order.outfile();
    pemfile::ensure_absent(&path)?;
    let key = load_or_generate_key(&order.key_file, order.key_bits).await?;

    let entity = authority.resolve_entity(&order.entity).await?;
    let issuer = authority.resolve_issuer(&order.issuer).await?;
    let domain = authority.resolve_domain().await?;
    debug!("{} {} -> {entity}, issuer {} -> {issuer}, domain {domain}",
           order.entity.kind(), order.entity.code(), order.issuer);

    let subject = format!("{}@{domain}", order.entity.code());
    let csr = key.create_csr(&subject, order.server_name.as_deref())?;
    debug!("CSR created for {}", csr.subject());

    let request = SubmitRequest {
        issuer,
        entity,
        name:     order.name.clone(),
        csr,
        duration: order.duration.clone(),
        usages:   order.usages(),
    };
    let handle = authority.submit_certificate(&request).await?;
    info!("certificate requested: {handle}");

    let issued = IssuanceWaiter::new(Arc::clone(authority), policy).wait(&handle).await?;
    pemfile::write_pem_file(PemLabel::Certificate, issued.certificate.der(), &path)?;
    info!("certificate {:?} written to {}", issued.certificate.name(), path.display());
    log_expiry(&issued.certificate);
    Ok(Provisioned { path, handle, issued })
}

/// One fetch, no waiting: a pending certificate is [`CertError::NotYetSigned`].
/// Writes to `outfile`, or `{reported name}.crt` in `out_dir`.
pub async fn fetch_single<A: Authority + ?Sized>(
    authority: &A,
    handle:    &IssuanceHandle,
    outfile:   Option<&Path>,
    out_dir:   &Path,
) -> Result<(PathBuf, Certificate)> {
    if let Some(p) = outfile {
        pemfile::ensure_absent(p)?;
    }
    let certificate = match authority.fetch_certificate(handle).await? {
        FetchOutcome::Signed(c) => c,
        FetchOutcome::Pending { .. } => {
            return Err(CertError::NotYetSigned { handle: handle.to_string() });
        }
    };
    let path = outfile
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_cert_file(out_dir, certificate.name()));
    pemfile::write_pem_file(PemLabel::Certificate, certificate.der(), &path)?;
    info!("certificate {handle} written to {}", path.display());
    log_expiry(&certificate);
    Ok((path, certificate))
}

fn log_expiry(certificate: &Certificate) {
    match certificate.not_after() {
        Some(at) => info!("certificate {:?} valid until {}", certificate.name(), at.to_rfc3339()),
        None => warn!("certificate {:?} has no representable expiry", certificate.name()),
    }
}

// ── CA bundles ───────────────────────────────────────────────────────────────

pub async fn ca_bundle_from_authority<A: Authority + ?Sized>(
    authority: &A,
    issuer:    &str,
) -> Result<Vec<Vec<u8>>> {
    let der = authority.fetch_ca(issuer).await?;
    debug!("CA for issuer {issuer}: {} bytes", der.len());
    Ok(vec![der])
}

pub fn ca_bundle_from_file(path: &Path) -> Result<Vec<Vec<u8>>> {
    pemfile::read_certificates(path)
}

/// Fetch the issuer's CA and write it to `outfile`.
pub async fn fetch_ca_to_file<A: Authority + ?Sized>(
    authority: &A,
    issuer:    &str,
    outfile:   &Path,
) -> Result<()> {
    pemfile::ensure_absent(outfile)?;
    for der in ca_bundle_from_authority(authority, issuer).await? {
        pemfile::write_pem_file(PemLabel::Certificate, &der, outfile)?;
    }
    info!("CA of issuer {issuer} written to {}", outfile.display());
    Ok(())
}
