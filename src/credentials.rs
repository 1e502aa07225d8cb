//! Where the API bearer token comes from.
//!
//! A static key (flag or `CERT_API_KEY`) always wins. Without one, the
//! loopback OAuth login runs with `CLIENT_ID`/`CLIENT_SECRET` from the
//! environment.

use std::time::Duration;

use log::info;
use url::Url;

use crate::error::Result;
use crate::oauth::{self, ClientCredentials, LoopbackAuthenticator, OAuthConfig};

/// How the browser login is run.
#[derive(Debug, Clone, Copy)]
pub struct LoginOptions {
    pub port:         u16,
    pub timeout:      Option<Duration>,
    /// Launch the browser; otherwise the login URL is printed.
    pub open_browser: bool,
}

#[derive(Debug, Clone)]
pub enum CredentialSource {
    ApiKey(String),
    OAuth { credentials: ClientCredentials, login: LoginOptions },
}

impl CredentialSource {
    /// Pick the source. `credentials` is only consulted without an API key,
    /// and fails fast when the client id or secret is missing.
    pub fn select(
        api_key:     Option<String>,
        credentials: impl FnOnce() -> Result<ClientCredentials>,
        login:       LoginOptions,
    ) -> Result<Self> {
        match api_key.filter(|k| !k.trim().is_empty()) {
            Some(key) => Ok(Self::ApiKey(key)),
            None => Ok(Self::OAuth { credentials: credentials()?, login }),
        }
    }

    /// Produce the bearer token, running the browser login if needed.
    pub async fn token(self, api_url: &Url) -> Result<String> {
        match self {
            Self::ApiKey(key) => Ok(key),
            Self::OAuth { credentials, login } => {
                info!("no API key given; starting browser login");
                let config = OAuthConfig::for_api(api_url, credentials, login.port)?;
                let auth = LoopbackAuthenticator::new(config).with_timeout(login.timeout);
                let auth = if login.open_browser {
                    auth
                } else {
                    auth.with_browser(oauth::print_login_url)
                };
                auth.authenticate().await
            }
        }
    }
}
