//! Client settings file parser.
//!
//! Plain `key = value` lines; `#` starts a comment, unknown keys are
//! ignored. Command-line flags and environment variables override whatever
//! the file sets.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::error::{CertError, Result};
use crate::keys::{DEFAULT_KEY_BITS, MIN_KEY_BITS};
use crate::mqtt::DEFAULT_BROKER_PORT;
use crate::oauth::CALLBACK_PORT;
use crate::provision::{DEFAULT_DURATION, DEFAULT_ISSUER};
use crate::waiter::{WaitPolicy, FETCH_DELAY, FETCH_TIMEOUT};

const CONFIG_FILE: &str = "cert-client.conf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Base URL of the authority API.
    pub api_url:       Option<String>,
    pub issuer:        String,
    /// ISO-8601 certificate lifetime.
    pub duration:      String,
    pub key_bits:      usize,
    /// Seconds to wait for a signed certificate.
    pub fetch_timeout: u64,
    /// Seconds between two polls.
    pub fetch_delay:   u64,
    pub callback_port: u16,
    /// Seconds allowed for the browser login; unbounded when unset.
    pub oauth_timeout: Option<u64>,
    pub mqtt_broker:   Option<String>,
    pub mqtt_port:     u16,
    pub log_level:     String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url:       None,
            issuer:        DEFAULT_ISSUER.to_string(),
            duration:      DEFAULT_DURATION.to_string(),
            key_bits:      DEFAULT_KEY_BITS,
            fetch_timeout: FETCH_TIMEOUT.as_secs(),
            fetch_delay:   FETCH_DELAY.as_secs(),
            callback_port: CALLBACK_PORT,
            oauth_timeout: None,
            mqtt_broker:   None,
            mqtt_port:     DEFAULT_BROKER_PORT,
            log_level:     "info".to_string(),
        }
    }
}

impl Settings {
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_secs(self.fetch_timeout),
            delay:   Duration::from_secs(self.fetch_delay),
        }
    }

    pub fn oauth_timeout(&self) -> Option<Duration> {
        self.oauth_timeout.map(Duration::from_secs)
    }

    /// The API URL; required by every command that talks to the authority.
    pub fn api_url(&self) -> Result<Url> {
        let raw = self
            .api_url
            .as_deref()
            .ok_or_else(|| CertError::Config("API URL not set (--api-url or CERT_API_URL)".into()))?;
        let url = Url::parse(raw).map_err(|e| CertError::Config(format!("invalid API URL {raw:?}: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(CertError::Config(format!("API URL must be http(s), not {other}"))),
        }
    }
}

fn number<T: std::str::FromStr>(key: &str, val: &str) -> Result<T> {
    val.parse()
        .map_err(|_| CertError::Config(format!("{key}: invalid number {val:?}")))
}

pub fn parse_settings(content: &str) -> Result<Settings> {
    let mut cfg = Settings::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, '=');
        let key = match parts.next() {
            Some(k) => k.trim().to_ascii_lowercase(),
            None => continue,
        };
        let val = match parts.next() {
            Some(v) => v.trim().to_string(),
            None => continue,
        };
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "api_url"       => cfg.api_url       = Some(val),
            "issuer"        => cfg.issuer        = val,
            "duration"      => cfg.duration      = val,
            "key_bits"      => cfg.key_bits      = number(&key, &val)?,
            "fetch_timeout" => cfg.fetch_timeout = number(&key, &val)?,
            "fetch_delay"   => cfg.fetch_delay   = number(&key, &val)?,
            "callback_port" => cfg.callback_port = number(&key, &val)?,
            "oauth_timeout" => cfg.oauth_timeout = Some(number(&key, &val)?),
            "mqtt_broker"   => cfg.mqtt_broker   = Some(val),
            "mqtt_port"     => cfg.mqtt_port     = number(&key, &val)?,
            "log_level"     => cfg.log_level     = val,
            _ => {} // ignore unknown keys
        }
    }

    Ok(cfg)
}

/// Parse `path` as a settings file.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let content = fs::read_to_string(path)
        .map_err(|e| CertError::Config(format!("cannot read {}: {e}", path.display())))?;
    parse_settings(&content)
}

/// `$XDG_CONFIG_HOME/cert-client.conf`, else `~/.config/cert-client.conf`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir).join(CONFIG_FILE));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join(CONFIG_FILE))
}

/// Validate cross-field constraints.
pub fn validate_settings(cfg: &Settings) -> Result<()> {
    if cfg.api_url.is_some() {
        cfg.api_url()?;
    }
    if cfg.key_bits < MIN_KEY_BITS {
        return Err(CertError::Config(format!(
            "key_bits must be at least {MIN_KEY_BITS}, got {}",
            cfg.key_bits
        )));
    }
    if cfg.fetch_delay == 0 {
        return Err(CertError::Config("fetch_delay must be positive".into()));
    }
    if cfg.fetch_timeout < cfg.fetch_delay {
        return Err(CertError::Config(format!(
            "fetch_timeout ({}s) must not be shorter than fetch_delay ({}s)",
            cfg.fetch_timeout, cfg.fetch_delay
        )));
    }
    if cfg.duration.is_empty() || !cfg.duration.starts_with('P') {
        return Err(CertError::Config(format!(
            "duration must be an ISO-8601 duration like P365D, got {:?}",
            cfg.duration
        )));
    }
    Ok(())
}
