//! OAuth2 authorization-code login through a loopback listener.
//!
//! One [`OAuthSession`] per flow: it owns the CSRF state token, the listener
//! task and the one-shot channel the callback handler reports through. The
//! caller blocks on that channel, then tears the listener down with a bounded
//! grace period.
//!
//! Routes on `localhost:{port}` (both `127.0.0.1` and `::1` where the host
//! has IPv6 loopback, since the redirect URI names `localhost`):
//!   - `GET /login`          307 to the authorize URL carrying the state token
//!   - `GET /auth/callback`  checks state, exchanges the code, reports once;
//!                           later calls get `410 Gone`

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use log::{debug, error, info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::error::{CertError, Result};

pub const CALLBACK_PORT: u16 = 9090;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const STATE_BYTES: usize = 32;

#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id:     String,
    pub client_secret: String,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ClientCredentials {
    /// Read `CLIENT_ID` / `CLIENT_SECRET` from the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or(CertError::MissingCredentials(key))
        };
        Ok(Self { client_id: get("CLIENT_ID")?, client_secret: get("CLIENT_SECRET")? })
    }
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub authorize_url: Url,
    pub token_url:     Url,
    pub credentials:   ClientCredentials,
    /// Loopback port; 0 picks a free one.
    pub port:          u16,
}

impl OAuthConfig {
    /// Endpoints `{api}/authenticate` and `{api}/authenticate/token`.
    pub fn for_api(api_url: &Url, credentials: ClientCredentials, port: u16) -> Result<Self> {
        let base = api_url.as_str().trim_end_matches('/');
        let base = base.strip_suffix("/graphql").unwrap_or(base);
        let parse = |s: String| {
            Url::parse(&s).map_err(|e| CertError::Config(format!("OAuth endpoint {s}: {e}")))
        };
        Ok(Self {
            authorize_url: parse(format!("{base}/authenticate"))?,
            token_url:     parse(format!("{base}/authenticate/token"))?,
            credentials,
            port,
        })
    }
}

/// Single-use CSRF token: 32 bytes from the OS CSPRNG, base64url.
#[derive(Clone)]
pub struct StateToken(String);

impl StateToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; STATE_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against the echoed value.
    pub fn matches(&self, echoed: &str) -> bool {
        self.0.as_bytes().ct_eq(echoed.as_bytes()).into()
    }
}

impl std::fmt::Debug for StateToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StateToken(..)")
    }
}

// ── Listener state ───────────────────────────────────────────────────────────

struct Shared {
    config:       OAuthConfig,
    state:        StateToken,
    redirect_uri: String,
    http:         reqwest::Client,
    result:       Mutex<Option<oneshot::Sender<Result<String>>>>,
}

impl Shared {
    fn authorize_location(&self) -> String {
        let mut url = self.config.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.credentials.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("state", self.state.as_str());
        url.into()
    }

    /// Take the result channel; `None` once a callback has been handled.
    fn take_sender(&self) -> Option<oneshot::Sender<Result<String>>> {
        self.result.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code:  Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

async fn login(State(shared): State<Arc<Shared>>) -> Redirect {
    debug!("login requested, redirecting to authorize endpoint");
    Redirect::temporary(&shared.authorize_location())
}

async fn callback(
    State(shared): State<Arc<Shared>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let Some(sender) = shared.take_sender() else {
        warn!("OAuth callback after the session already completed");
        return (StatusCode::GONE, "login session already completed").into_response();
    };

    let outcome = match (&params.state, &params.error, &params.code) {
        (Some(state), _, _) if !shared.state.matches(state) => Err(CertError::StateMismatch),
        (None, _, _) => Err(CertError::StateMismatch),
        (_, Some(denied), _) => Err(CertError::TokenExchange(format!("authorization denied: {denied}"))),
        (_, None, None) => Err(CertError::TokenExchange("callback carried no code".into())),
        (_, None, Some(code)) => exchange_code(&shared, code).await,
    };

    let response = match &outcome {
        Ok(_) => (StatusCode::OK, "Login complete. You can close this window.").into_response(),
        Err(CertError::StateMismatch) => {
            error!("OAuth state mismatch; aborting login");
            (StatusCode::BAD_REQUEST, "state mismatch").into_response()
        }
        Err(e) => {
            error!("OAuth login failed: {e}");
            (StatusCode::BAD_GATEWAY, "login failed").into_response()
        }
    };
    if sender.send(outcome).is_err() {
        warn!("OAuth result dropped; nobody is waiting for it");
    }
    response
}

async fn exchange_code(shared: &Shared, code: &str) -> Result<String> {
    let creds = &shared.config.credentials;
    let form = [
        ("grant_type",    "authorization_code"),
        ("code",          code),
        ("redirect_uri",  shared.redirect_uri.as_str()),
        ("client_id",     creds.client_id.as_str()),
        ("client_secret", creds.client_secret.as_str()),
    ];
    let resp = shared.http
        .post(shared.config.token_url.clone())
        .form(&form)
        .send()
        .await
        .map_err(|e| CertError::TokenExchange(e.to_string()))?;
    let status = resp.status();
    let body = resp.text().await.map_err(|e| CertError::TokenExchange(e.to_string()))?;
    if !status.is_success() {
        return Err(CertError::TokenExchange(format!("token endpoint returned {status}: {body}")));
    }
    let token: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| CertError::TokenExchange(format!("bad token response: {e}")))?;
    if token.access_token.is_empty() {
        return Err(CertError::TokenExchange("empty access_token".into()));
    }
    info!("OAuth code exchanged for an access token");
    Ok(token.access_token)
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct OAuthSession {
    local_addr: SocketAddr,
    result:     oneshot::Receiver<Result<String>>,
    shutdown:   watch::Sender<bool>,
    task:       JoinHandle<()>,
}

impl std::fmt::Debug for OAuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSession")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl OAuthSession {
    /// Bind the loopback listener and start serving. Fails if the port is
    /// taken, e.g. by a concurrent login.
    pub async fn start(config: OAuthConfig) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.port)).await?;
        let local_addr = listener.local_addr()?;
        // Same port on the IPv6 loopback, for hosts resolving `localhost` to
        // `::1` first. Optional: not every host has one.
        let listener_v6 = match TcpListener::bind((Ipv6Addr::LOCALHOST, local_addr.port())).await {
            Ok(l) => Some(l),
            Err(e) => {
                debug!("no IPv6 loopback listener on port {}: {e}", local_addr.port());
                None
            }
        };
        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            redirect_uri: format!("http://localhost:{}/auth/callback", local_addr.port()),
            state:        StateToken::generate(),
            http:         reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?,
            result:       Mutex::new(Some(result_tx)),
            config,
        });

        let app = Router::new()
            .route("/login", get(login))
            .route("/auth/callback", get(callback))
            .with_state(shared);

        let task = tokio::spawn(async move {
            let v4 = serve_until(listener, app.clone(), shutdown_rx.clone());
            match listener_v6 {
                Some(l) => {
                    tokio::join!(v4, serve_until(l, app, shutdown_rx));
                }
                None => v4.await,
            }
        });
        info!("OAuth listener on {local_addr}");

        Ok(Self { local_addr, result: result_rx, shutdown: shutdown_tx, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The URL to open in the user's browser.
    pub fn login_url(&self) -> String {
        format!("http://localhost:{}/login", self.local_addr().port())
    }

    /// Block until the callback reports. `None` waits as long as the user takes.
    pub async fn await_token(&mut self, timeout: Option<Duration>) -> Result<String> {
        let received = match timeout {
            Some(after) => tokio::time::timeout(after, &mut self.result)
                .await
                .map_err(|_| CertError::TimedOut { what: "OAuth login callback".into(), after })?,
            None => (&mut self.result).await,
        };
        received.unwrap_or_else(|_| {
            Err(CertError::Protocol("login listener stopped before a callback arrived".into()))
        })
    }

    /// Signal the listener to stop, abort it if it overruns the grace period.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task).await.is_err() {
            warn!("OAuth listener did not stop within {SHUTDOWN_GRACE:?}; aborting");
            self.task.abort();
        }
        debug!("OAuth listener on {} stopped", self.local_addr);
    }
}

impl Drop for OAuthSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_until(listener: TcpListener, app: Router, mut stop: watch::Receiver<bool>) {
    let addr = listener.local_addr().ok();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = stop.changed().await;
    });
    if let Err(e) = server.await {
        error!("OAuth listener {addr:?} error: {e}");
    }
}

// ── Authenticator ────────────────────────────────────────────────────────────

pub type BrowserOpener = Box<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// Runs one complete login: listener up, browser opened, token awaited,
/// listener down.
pub struct LoopbackAuthenticator {
    config:  OAuthConfig,
    timeout: Option<Duration>,
    opener:  BrowserOpener,
}

impl LoopbackAuthenticator {
    pub fn new(config: OAuthConfig) -> Self {
        Self { config, timeout: None, opener: Box::new(open_browser) }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_browser(mut self, opener: impl Fn(&str) -> Result<()> + Send + Sync + 'static) -> Self {
        self.opener = Box::new(opener);
        self
    }

    pub async fn authenticate(self) -> Result<String> {
        let mut session = OAuthSession::start(self.config).await?;
        let login_url = session.login_url();
        info!("opening browser for login: {login_url}");

        let token = match (self.opener)(&login_url) {
            Ok(()) => session.await_token(self.timeout).await,
            Err(e) => Err(e),
        };
        session.shutdown().await;
        token
    }
}

/// Print `url` for the user to open by hand.
pub fn print_login_url(url: &str) -> Result<()> {
    eprintln!("Open {url} in a browser to log in.");
    Ok(())
}

/// Launch the platform's default browser on `url`.
pub fn open_browser(url: &str) -> Result<()> {
    let (program, args): (&str, &[&str]) = if cfg!(target_os = "windows") {
        ("cmd", &["/c", "start"])
    } else if cfg!(target_os = "macos") {
        ("open", &[])
    } else {
        ("xdg-open", &[])
    };
    tokio::process::Command::new(program)
        .args(args)
        .arg(url)
        .spawn()
        .map(|_| ())
        .map_err(|e| CertError::Browser(format!("{program}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::routing::post;
    use axum::{Form, Json};

    use super::*;

    fn creds() -> ClientCredentials {
        ClientCredentials { client_id: "cli".into(), client_secret: "shh".into() }
    }

    /// Fake token endpoint; returns its base URL and a hit counter.
    async fn token_server() -> (Url, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            "/api/authenticate/token",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(form["grant_type"], "authorization_code");
                    assert_eq!(form["client_id"], "cli");
                    assert_eq!(form["client_secret"], "shh");
                    assert!(form["redirect_uri"].ends_with("/auth/callback"));
                    if form["code"] == "good-code" {
                        Json(serde_json::json!({"access_token": "tok-123", "token_type": "bearer"}))
                            .into_response()
                    } else {
                        (StatusCode::BAD_REQUEST, "invalid_grant").into_response()
                    }
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (Url::parse(&format!("http://{addr}/api")).unwrap(), hits)
    }

    fn no_redirects() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    #[test]
    fn missing_client_credentials_are_named() {
        let err = ClientCredentials::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, CertError::MissingCredentials("CLIENT_ID")));

        let err = ClientCredentials::from_lookup(|k| (k == "CLIENT_ID").then(|| "id".to_string()))
            .unwrap_err();
        assert_eq!(err.to_string(), "CLIENT_SECRET not set");
    }

    #[test]
    fn endpoints_derive_from_api_url() {
        let api = Url::parse("https://api.example.com/graphql").unwrap();
        let cfg = OAuthConfig::for_api(&api, creds(), CALLBACK_PORT).unwrap();
        assert_eq!(cfg.authorize_url.as_str(), "https://api.example.com/authenticate");
        assert_eq!(cfg.token_url.as_str(), "https://api.example.com/authenticate/token");
    }

    #[test]
    fn state_tokens_are_unpredictable_and_compared_exactly() {
        let a = StateToken::generate();
        let b = StateToken::generate();
        assert_ne!(a.as_str(), b.as_str());
        assert_eq!(a.as_str().len(), 43);
        assert!(a.matches(a.as_str()));
        assert!(!a.matches(b.as_str()));
        assert!(!a.matches(&a.as_str()[..42]));
        assert!(!a.matches(""));
    }

    #[tokio::test]
    async fn full_login_yields_access_token() {
        let (api, hits) = token_server().await;
        let cfg = OAuthConfig::for_api(&api, creds(), 0).unwrap();

        let auth = LoopbackAuthenticator::new(cfg)
            .with_timeout(Some(Duration::from_secs(10)))
            .with_browser(|login_url| {
                let login_url = login_url.replace("localhost", "127.0.0.1");
                tokio::spawn(async move {
                    let http = no_redirects();
                    let resp = http.get(&login_url).send().await.unwrap();
                    assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
                    let location = resp.headers()["location"].to_str().unwrap();
                    let authorize = Url::parse(location).unwrap();
                    assert!(authorize.path().ends_with("/authenticate"));
                    let q: HashMap<_, _> = authorize.query_pairs().into_owned().collect();
                    assert_eq!(q["response_type"], "code");
                    assert_eq!(q["client_id"], "cli");

                    let callback = Url::parse_with_params(
                        &login_url.replace("/login", "/auth/callback"),
                        &[("code", "good-code"), ("state", q["state"].as_str())],
                    )
                    .unwrap();
                    let resp = http.get(callback).send().await.unwrap();
                    assert_eq!(resp.status(), StatusCode::OK);
                });
                Ok(())
            });

        assert_eq!(auth.authenticate().await.unwrap(), "tok-123");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mismatched_state_aborts_without_exchange() {
        let (api, hits) = token_server().await;
        let cfg = OAuthConfig::for_api(&api, creds(), 0).unwrap();
        let mut session = OAuthSession::start(cfg).await.unwrap();
        let base = format!("http://{}", session.local_addr());
        let http = no_redirects();

        let forged = format!("{base}/auth/callback?code=good-code&state=forged");
        let resp = http.get(&forged).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let err = session.await_token(Some(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, CertError::StateMismatch));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // The session is spent.
        let resp = http.get(&forged).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::GONE);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_code_is_a_token_exchange_error() {
        let (api, hits) = token_server().await;
        let cfg = OAuthConfig::for_api(&api, creds(), 0).unwrap();
        let mut session = OAuthSession::start(cfg).await.unwrap();
        let base = format!("http://{}", session.local_addr());
        let http = no_redirects();

        let resp = http.get(format!("{base}/login")).send().await.unwrap();
        let location = Url::parse(resp.headers()["location"].to_str().unwrap()).unwrap();
        let state = location
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let resp = http
            .get(format!("{base}/auth/callback?code=bad-code&state={state}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let err = session.await_token(None).await.unwrap_err();
        assert!(matches!(err, CertError::TokenExchange(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn callback_reachable_on_both_loopback_addresses() {
        // Hosts without IPv6 loopback have nothing to check.
        if std::net::TcpListener::bind((Ipv6Addr::LOCALHOST, 0)).is_err() {
            return;
        }
        let (api, _) = token_server().await;
        let cfg = OAuthConfig::for_api(&api, creds(), 0).unwrap();
        let session = OAuthSession::start(cfg).await.unwrap();
        let port = session.local_addr().port();
        let http = no_redirects();

        for host in ["127.0.0.1", "[::1]"] {
            let resp = http.get(format!("http://{host}:{port}/login")).send().await.unwrap();
            assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT, "via {host}");
        }
        session.shutdown().await;
    }

    #[tokio::test]
    async fn abandoned_login_times_out() {
        let (api, _) = token_server().await;
        let cfg = OAuthConfig::for_api(&api, creds(), 0).unwrap();
        let auth = LoopbackAuthenticator::new(cfg)
            .with_timeout(Some(Duration::from_millis(200)))
            .with_browser(|_| Ok(()));
        let err = auth.authenticate().await.unwrap_err();
        assert!(matches!(err, CertError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn browser_failure_is_fatal() {
        let (api, _) = token_server().await;
        let cfg = OAuthConfig::for_api(&api, creds(), 0).unwrap();
        let auth = LoopbackAuthenticator::new(cfg)
            .with_browser(|_| Err(CertError::Browser("no display".into())));
        let err = auth.authenticate().await.unwrap_err();
        assert!(matches!(err, CertError::Browser(_)));
    }
}
