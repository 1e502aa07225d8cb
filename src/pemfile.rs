//! PEM container files.
//!
//! Every artifact the client writes (keys, certificates, CA bundles) goes
//! through [`write_pem_file`], which refuses to replace an existing file.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use log::{debug, error};
use tempfile::NamedTempFile;

use crate::error::{CertError, Result};

/// Labels of the PEM blocks the client reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PemLabel {
    RsaPrivateKey,
    RsaPublicKey,
    CertificateRequest,
    Certificate,
}

impl PemLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            PemLabel::RsaPrivateKey      => "RSA PRIVATE KEY",
            PemLabel::RsaPublicKey       => "RSA PUBLIC KEY",
            PemLabel::CertificateRequest => "CERTIFICATE REQUEST",
            PemLabel::Certificate        => "CERTIFICATE",
        }
    }
}

/// Wrap `der` in a PEM block labelled `label`.
pub fn encode(label: PemLabel, der: &[u8]) -> String {
    let config = pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF);
    pem::encode_config(&pem::Pem::new(label.as_str(), der.to_vec()), config)
}

/// Write `contents` to `path`, failing with [`CertError::AlreadyExists`] if
/// anything is already there.
///
/// The bytes go to a temporary file next to `path` first, which is linked
/// into place only once fully written and synced. A failed write leaves
/// nothing behind.
pub fn write_new_file(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    match tmp.persist_noclobber(path) {
        Ok(_) => {}
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
            error!("refusing to overwrite {}", path.display());
            return Err(CertError::AlreadyExists(path.to_path_buf()));
        }
        Err(e) => return Err(e.error.into()),
    }
    debug!("wrote {} ({} bytes)", path.display(), contents.len());
    Ok(())
}

/// PEM-encode `der` and write it to a new file at `path`.
pub fn write_pem_file(label: PemLabel, der: &[u8], path: &Path) -> Result<()> {
    write_new_file(path, encode(label, der).as_bytes())
}

/// Fail early if `path` is already taken.
pub fn ensure_absent(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(CertError::AlreadyExists(path.to_path_buf()));
    }
    Ok(())
}

/// Read every `CERTIFICATE` block in `path`.
pub fn read_certificates(path: &Path) -> Result<Vec<Vec<u8>>> {
    let text = fs::read(path)?;
    let blocks = pem::parse_many(&text)
        .map_err(|e| CertError::Decode(format!("{}: {e}", path.display())))?;
    let certs: Vec<Vec<u8>> = blocks
        .into_iter()
        .filter(|b| b.tag() == PemLabel::Certificate.as_str())
        .map(|b| b.into_contents())
        .collect();
    if certs.is_empty() {
        return Err(CertError::Decode(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}
