//! web3gateway - Main entry point
//!
//! Serves web3:// websites on their DNS domains over HTTP(S)

use anyhow::{bail, Context, Result};
use clap::Parser;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use web3gateway::acme::default_directory_url;
use web3gateway::registry::is_valid_dns_domain;
use web3gateway::tls::{self, RENEWAL_CHECK_INTERVAL};
use web3gateway::{
    AcmeIssuer, CertificateIssuer, CertificateManager, ChallengeRegistry, DomainRegistry,
    GatewayConfig, GatewayServer, HttpGatewayResolver, SelfSignedIssuer, SniResolver,
    UrlTranslator,
};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^.+@.+\..+$").expect("static regex"));

/// web3gateway - Serve web3:// websites over HTTP(S)
#[derive(Parser, Debug)]
#[command(name = "web3gateway")]
#[command(version)]
#[command(about = "Serve web3:// websites on their own DNS domains")]
struct Args {
    /// Websites to serve: web3://<host>[:<chainId>][=<dns-domain>]
    #[arg(required = true, value_name = "SITE")]
    sites: Vec<String>,

    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT", default_value = "8443")]
    https_port: u16,

    /// Run in production mode (ports 80/443, HTTPS enabled)
    #[arg(long)]
    production: bool,

    /// Global web3 HTTP gateway used for links to websites not served here
    #[arg(long, env = "GLOBAL_WEB3_HTTP_GATEWAY_DNS_DOMAIN", default_value = "web3gateway.dev")]
    global_gateway_domain: String,

    /// Web3 HTTP gateway fetching the content (defaults to the global gateway)
    #[arg(long, env = "UPSTREAM_GATEWAY")]
    upstream_gateway: Option<String>,

    /// Talk plain HTTP to the upstream gateway
    #[arg(long)]
    upstream_insecure: bool,

    /// Obtain certificates from Let's Encrypt and serve HTTPS
    #[arg(long, env = "LETSENCRYPT_ENABLE_HTTPS", default_value = "false")]
    lets_encrypt_enable_https: bool,

    /// Contact email of the ACME account
    #[arg(long, env = "LETSENCRYPT_EMAIL")]
    lets_encrypt_email: Option<String>,

    /// ACME directory URL (Let's Encrypt production by default)
    #[arg(long, env = "ACME_DIRECTORY_URL")]
    acme_directory_url: Option<String>,

    /// Issue self-signed certificates instead of contacting an ACME authority
    #[arg(long)]
    self_signed: bool,

    /// Keep every fetched response in memory
    #[arg(long, env = "FORCE_CACHE", default_value = "false")]
    force_cache: bool,

    /// Configuration directory (certificates are stored in its certs/ folder)
    #[arg(long, env = "CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);
    tls::install_crypto_provider();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(level: &str) {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

async fn run(mut args: Args) -> Result<()> {
    // Production mode overrides
    if args.production {
        args.http_port = 80;
        args.https_port = 443;
        args.lets_encrypt_enable_https = true;
    }
    let enable_https = args.lets_encrypt_enable_https;

    if !is_valid_dns_domain(&args.global_gateway_domain) {
        bail!("Invalid global gateway domain: {}", args.global_gateway_domain);
    }

    let email = match (&args.lets_encrypt_email, enable_https && !args.self_signed) {
        (Some(email), _) if !EMAIL_RE.is_match(email) => bail!("Invalid Let's Encrypt email: {}", email),
        (None, true) => bail!("--lets-encrypt-email is required to enable HTTPS"),
        (email, _) => email.clone(),
    };

    let registry = Arc::new(DomainRegistry::from_args(&args.sites, enable_https)?);
    info!("Serving {} web3:// website(s):", registry.sites().len());
    for site in registry.sites() {
        info!("  {}", site);
    }

    let translator = UrlTranslator::new(registry.clone(), Some(args.global_gateway_domain.clone()));
    let upstream = args
        .upstream_gateway
        .clone()
        .unwrap_or_else(|| args.global_gateway_domain.clone());
    let resolver = Arc::new(HttpGatewayResolver::new(upstream.clone(), !args.upstream_insecure)?);
    info!("Fetching content through {}", upstream);

    let challenges = Arc::new(ChallengeRegistry::new());
    let config = GatewayConfig {
        http_port: args.http_port,
        https_port: args.https_port,
        enable_https,
        force_cache: args.force_cache,
    };
    let server = Arc::new(GatewayServer::new(config, translator, resolver, challenges.clone()));

    // HTTP first: challenge requests arrive there during issuance
    let http = tokio::spawn(server.clone().run_http());

    if !enable_https {
        info!("web3gateway started");
        return http.await?;
    }

    let config_dir = match args.config_dir {
        Some(dir) => dir,
        None => CertificateManager::default_config_dir()
            .context("Cannot determine the configuration directory, use --config-dir")?,
    };

    let issuer: Arc<dyn CertificateIssuer> = if args.self_signed {
        Arc::new(SelfSignedIssuer::default())
    } else {
        let directory = args
            .acme_directory_url
            .clone()
            .unwrap_or_else(|| default_directory_url().to_string());
        info!("ACME directory: {}", directory);
        Arc::new(AcmeIssuer::new(directory, email.unwrap_or_default()))
    };

    let cert_manager = Arc::new(
        CertificateManager::new(config_dir.join("certs"), issuer)?.with_challenges(challenges),
    );
    info!("Certificate manager initialized at: {}", cert_manager.certs_dir().display());

    let sni = Arc::new(SniResolver::new());
    let domains = registry.dns_domains();
    for domain in &domains {
        let cert = cert_manager
            .ensure_certificate(domain)
            .await
            .with_context(|| format!("Cannot obtain a certificate for {}", domain))?;
        sni.install(&cert)?;
    }

    tls::spawn_renewal_loop(cert_manager, sni.clone(), domains, RENEWAL_CHECK_INTERVAL);

    let acceptor = TlsAcceptor::from(tls::server_config(sni)?);
    let https = tokio::spawn(server.run_https(acceptor));

    info!("web3gateway started");

    tokio::select! {
        result = http => result?,
        result = https => result?,
    }
}
