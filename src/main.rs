//! Certificate provisioning client.
//!
//! Usage:
//!   cert-client create keypair -b 4096
//!   cert-client create certificate -n device-01 -s truck-7
//!   cert-client fetch certificate --uuid <UUID>
//!   cert-client fetch ca -i default -o ca.crt
//!   cert-client validate -c device-01.crt -a ca.crt --mqtt-broker mqtt.example.com

mod authority;
mod config;
mod credentials;
mod error;
mod keys;
mod mqtt;
mod oauth;
mod pemfile;
mod provision;
mod tls;
mod waiter;

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgGroup, Args, Parser, Subcommand};
use log::{debug, error, info, warn};

use crate::authority::{AuthorityClient, EntityRef, IssuanceHandle};
use crate::config::Settings;
use crate::credentials::{CredentialSource, LoginOptions};
use crate::error::CertError;
use crate::mqtt::BrokerCredential;
use crate::oauth::ClientCredentials;
use crate::provision::{CertificateOrder, PRIVATE_KEY_FILE};
use crate::tls::TrustValidator;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "cert-client", version, about = "Request, fetch and validate X.509 client certificates")]
struct Cli {
    /// Settings file (default: ~/.config/cert-client.conf when present).
    #[arg(long, global = true, env = "CERT_CONFIG")]
    config: Option<PathBuf>,

    /// Minimum level of log events to display.
    #[arg(long, global = true, env = "CERT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Base URL of the authority API.
    #[arg(long, global = true, env = "CERT_API_URL")]
    api_url: Option<String>,

    /// Static API key; without one a browser login is started.
    #[arg(long, global = true, env = "CERT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Print the login URL instead of launching a browser.
    #[arg(long, global = true, env = "CERT_NO_BROWSER")]
    no_browser: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create key pairs and certificates.
    #[command(subcommand)]
    Create(CreateCommand),
    /// Fetch certificates and CA bundles.
    #[command(subcommand)]
    Fetch(FetchCommand),
    /// Write the public key of an existing private key.
    Dump(DumpArgs),
    /// Prove a certificate against an MQTT broker over mutual TLS.
    Validate(ValidateArgs),
}

#[derive(Debug, Subcommand)]
enum CreateCommand {
    /// Generate a new RSA key pair.
    Keypair(KeypairArgs),
    /// Request a certificate and wait until it is signed.
    Certificate(CertificateArgs),
}

#[derive(Debug, Subcommand)]
enum FetchCommand {
    /// Fetch an already requested certificate, without waiting.
    Certificate(FetchCertificateArgs),
    /// Fetch the CA certificate of an issuer.
    Ca(FetchCaArgs),
}

#[derive(Debug, Args)]
struct KeypairArgs {
    #[arg(short = 'b', long)]
    key_bits: Option<usize>,
    #[arg(short = 'o', long, default_value = PRIVATE_KEY_FILE)]
    private_key_outfile: PathBuf,
    #[arg(short = 'u', long)]
    public_key_outfile: Option<PathBuf>,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("entity").required(true).args(["system", "component"])))]
struct CertificateArgs {
    /// Name of the certificate.
    #[arg(short = 'n', long)]
    name: String,
    /// Code of the system the certificate is for.
    #[arg(short = 's', long)]
    system: Option<String>,
    /// Code of the component the certificate is for.
    #[arg(short = 'c', long)]
    component: Option<String>,
    #[arg(short = 'i', long)]
    issuer: Option<String>,
    /// ISO-8601 lifetime, e.g. P365D.
    #[arg(short = 'd', long)]
    duration: Option<String>,
    /// Private key; generated when the file does not exist.
    #[arg(short = 'p', long, default_value = PRIVATE_KEY_FILE)]
    private_key_infile: PathBuf,
    #[arg(short = 'b', long)]
    key_bits: Option<usize>,
    /// Output file (default: NAME.crt).
    #[arg(long)]
    cert_outfile: Option<PathBuf>,
    /// DNS name for a server certificate.
    #[arg(long)]
    server_name: Option<String>,
    /// Seconds to wait for the signed certificate.
    #[arg(long)]
    fetch_timeout: Option<u64>,
    /// Seconds between polls.
    #[arg(long)]
    fetch_delay: Option<u64>,
}

#[derive(Debug, Args)]
struct FetchCertificateArgs {
    #[arg(long)]
    uuid: IssuanceHandle,
    /// Output file (default: reported name + .crt).
    #[arg(long)]
    cert_outfile: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct FetchCaArgs {
    #[arg(short = 'i', long)]
    issuer: Option<String>,
    #[arg(short = 'o', long, default_value = "ca.crt")]
    outfile: PathBuf,
}

#[derive(Debug, Args)]
struct DumpArgs {
    #[arg(short = 'p', long, default_value = PRIVATE_KEY_FILE)]
    private_key_infile: PathBuf,
    #[arg(short = 'u', long, default_value = "public.key")]
    pubkey_outfile: PathBuf,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    /// Certificate to present.
    #[arg(short = 'c', long)]
    certificate_infile: PathBuf,
    #[arg(short = 'p', long, default_value = PRIVATE_KEY_FILE)]
    private_key_infile: PathBuf,
    /// CA bundle; fetched from the issuer when absent.
    #[arg(short = 'a', long, conflicts_with = "issuer")]
    ca_cert: Option<PathBuf>,
    #[arg(short = 'i', long)]
    issuer: Option<String>,
    #[arg(short = 'b', long)]
    mqtt_broker: Option<String>,
    #[arg(long)]
    mqtt_broker_port: Option<u16>,
    /// Subscribe here and wait for one message after the handshake.
    #[arg(short = 't', long)]
    topic: Option<String>,
    #[arg(long)]
    client_id: Option<String>,
    /// Seconds to wait for a message on the topic.
    #[arg(long, default_value_t = 30)]
    wait: u64,
    /// Accept a broker certificate issued for another host name.
    #[arg(long)]
    skip_hostname_check: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cert-client: {e:#}");
            process::exit(1);
        }
    };
    setup_logging(&settings.log_level);

    if rustls_post_quantum::provider().install_default().is_err() {
        debug!("a TLS crypto provider was already installed");
    }

    if let Err(e) = run(cli, settings).await {
        error!("{e:#}");
        if let Some(hint) = e.downcast_ref::<CertError>().and_then(hint) {
            eprintln!("cert-client: {hint}");
        }
        process::exit(1);
    }
}

/// File < env < flag; command-specific flags are applied by each command.
fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let path = cli
        .config
        .clone()
        .or_else(|| config::default_config_path().filter(|p| p.exists()));
    let mut settings = match path {
        Some(p) => config::load_settings(&p).with_context(|| format!("settings file {}", p.display()))?,
        None => Settings::default(),
    };
    if let Some(url) = &cli.api_url {
        settings.api_url = Some(url.clone());
    }
    if let Some(level) = &cli.log_level {
        settings.log_level = level.clone();
    }
    Ok(settings)
}

fn setup_logging(level: &str) {
    let parsed = level.parse::<log::LevelFilter>();
    env_logger::Builder::new()
        .filter_level(*parsed.as_ref().unwrap_or(&log::LevelFilter::Debug))
        .parse_default_env()
        .init();
    if parsed.is_err() {
        warn!("invalid log level '{level}', defaulting to 'debug'");
    }
}

/// What the operator should do next, for errors where that differs.
fn hint(e: &CertError) -> Option<&'static str> {
    match e {
        CertError::TimedOut { .. } | CertError::NotYetSigned { .. } => {
            Some("the certificate is not signed yet; try `fetch certificate --uuid <UUID>` later")
        }
        CertError::Rejected(_) | CertError::Decode(_) => {
            Some("the authority refused or garbled the certificate; contact the issuer")
        }
        CertError::StateMismatch => Some("login aborted; start again from a fresh browser window"),
        CertError::MissingCredentials(_) => Some("pass --api-key or set CLIENT_ID and CLIENT_SECRET"),
        _ => None,
    }
}

async fn connect_authority(settings: &Settings, auth: &GlobalAuth) -> anyhow::Result<AuthorityClient> {
    let url = settings.api_url()?;
    let login = LoginOptions {
        port:         settings.callback_port,
        timeout:      settings.oauth_timeout(),
        open_browser: !auth.no_browser,
    };
    let source = CredentialSource::select(auth.api_key.clone(), ClientCredentials::from_env, login)?;
    let token = source.token(&url).await?;
    Ok(AuthorityClient::new(&url, token)?)
}

/// The global flags that decide how to authenticate.
struct GlobalAuth {
    api_key:    Option<String>,
    no_browser: bool,
}

async fn run(cli: Cli, mut settings: Settings) -> anyhow::Result<()> {
    let auth = GlobalAuth { api_key: cli.api_key, no_browser: cli.no_browser };
    match cli.command {
        Command::Create(CreateCommand::Keypair(args)) => {
            if let Some(bits) = args.key_bits {
                settings.key_bits = bits;
            }
            config::validate_settings(&settings)?;
            provision::create_keypair(
                settings.key_bits,
                &args.private_key_outfile,
                args.public_key_outfile.as_deref(),
            )
            .await?;
        }

        Command::Create(CreateCommand::Certificate(args)) => {
            if let Some(v) = args.issuer        { settings.issuer        = v; }
            if let Some(v) = args.duration      { settings.duration      = v; }
            if let Some(v) = args.key_bits      { settings.key_bits      = v; }
            if let Some(v) = args.fetch_timeout { settings.fetch_timeout = v; }
            if let Some(v) = args.fetch_delay   { settings.fetch_delay   = v; }
            config::validate_settings(&settings)?;

            let entity = match (args.system, args.component) {
                (Some(code), None) => EntityRef::System(code),
                (None, Some(code)) => EntityRef::Component(code),
                _ => anyhow::bail!("exactly one of --system or --component is required"),
            };
            let order = CertificateOrder {
                name:         args.name,
                entity,
                issuer:       settings.issuer.clone(),
                duration:     settings.duration.clone(),
                key_file:     args.private_key_infile,
                key_bits:     settings.key_bits,
                cert_outfile: args.cert_outfile,
                out_dir:      PathBuf::from("."),
                server_name:  args.server_name,
            };
            // Fail on a taken output file before any login or request.
            pemfile::ensure_absent(&order.outfile())?;

            let authority = Arc::new(connect_authority(&settings, &auth).await?);
            let done = provision::create_certificate(&authority, &order, settings.wait_policy()).await?;
            info!(
                "certificate {} ({} attempts, {} retries) written to {}",
                done.handle,
                done.issued.attempts,
                done.issued.retries.len(),
                done.path.display()
            );
        }

        Command::Fetch(FetchCommand::Certificate(args)) => {
            config::validate_settings(&settings)?;
            if let Some(p) = &args.cert_outfile {
                pemfile::ensure_absent(p)?;
            }
            let authority = connect_authority(&settings, &auth).await?;
            provision::fetch_single(&authority, &args.uuid, args.cert_outfile.as_deref(), Path::new(".")).await?;
        }

        Command::Fetch(FetchCommand::Ca(args)) => {
            config::validate_settings(&settings)?;
            pemfile::ensure_absent(&args.outfile)?;
            let issuer = args.issuer.unwrap_or(settings.issuer.clone());
            let authority = connect_authority(&settings, &auth).await?;
            provision::fetch_ca_to_file(&authority, &issuer, &args.outfile).await?;
        }

        Command::Dump(args) => {
            provision::dump_public_key(&args.private_key_infile, &args.pubkey_outfile)?;
        }

        Command::Validate(args) => {
            if let Some(v) = args.mqtt_broker      { settings.mqtt_broker = Some(v); }
            if let Some(v) = args.mqtt_broker_port { settings.mqtt_port   = v; }
            config::validate_settings(&settings)?;
            let host = settings
                .mqtt_broker
                .clone()
                .ok_or_else(|| CertError::Config("MQTT broker not set (--mqtt-broker)".into()))?;

            let ca = match args.ca_cert {
                Some(path) => provision::ca_bundle_from_file(&path)?,
                None => {
                    let issuer = args.issuer.unwrap_or(settings.issuer.clone());
                    let authority = connect_authority(&settings, &auth).await?;
                    provision::ca_bundle_from_authority(&authority, &issuer).await?
                }
            };

            let validator = TrustValidator::new(
                &ca,
                &args.certificate_infile,
                &args.private_key_infile,
                &host,
                settings.mqtt_port,
                !args.skip_hostname_check,
            )?;
            validator.handshake().await?;

            if let Some(topic) = args.topic {
                let broker = BrokerCredential {
                    host,
                    port:      settings.mqtt_port,
                    client_id: BrokerCredential::client_id_or_random(args.client_id),
                    ca,
                    cert_pem:  fs::read(&args.certificate_infile)?,
                    key_pem:   fs::read(&args.private_key_infile)?,
                };
                let msg = mqtt::await_one_message(&broker, &topic, Duration::from_secs(args.wait)).await?;
                info!(
                    "received {} bytes on {} after {:?}",
                    msg.payload.len(),
                    msg.topic,
                    msg.elapsed
                );
            }
            info!("certificate {} is valid for the broker", args.certificate_infile.display());
        }
    }
    Ok(())
}
