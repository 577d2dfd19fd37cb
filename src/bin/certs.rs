//! CLI tool for inspecting the gateway's certificates
//!
//! Usage:
//!   web3gateway-certs list [--json]
//!   web3gateway-certs show <domain>
//!   web3gateway-certs self-sign <domain> [--days <days>]

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use web3gateway::certificate::DEFAULT_RENEW_BEFORE_DAYS;
use web3gateway::{CertificateManager, DomainCertificate, SelfSignedIssuer};

/// CLI tool for the certificates of web3gateway
#[derive(Parser, Debug)]
#[command(name = "web3gateway-certs")]
#[command(version)]
#[command(about = "Inspect the certificates stored by web3gateway")]
struct Args {
    /// Configuration directory (certificates are stored in its certs/ folder)
    #[arg(long, env = "CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List stored certificates
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the certificate of a domain
    Show {
        /// Domain name (e.g., site.com)
        domain: String,
    },

    /// Create a self-signed certificate for local testing
    SelfSign {
        /// Domain name
        domain: String,

        /// Validity in days
        #[arg(long, default_value = "90")]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_dir = match args.config_dir {
        Some(dir) => dir,
        None => CertificateManager::default_config_dir()
            .context("Cannot determine the configuration directory, use --config-dir")?,
    };
    let certs_dir = config_dir.join("certs");
    let renew_before = Duration::days(DEFAULT_RENEW_BEFORE_DAYS);

    match args.command {
        Commands::List { json } => {
            let manager = CertificateManager::new(&certs_dir, Arc::new(SelfSignedIssuer::default()))?;
            let certs = manager.list()?;

            if certs.is_empty() {
                println!("No certificates found in {}", certs_dir.display());
                return Ok(());
            }

            if json {
                let json_output: Vec<serde_json::Value> = certs
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "domain": c.domain,
                            "not_after": c.not_after.to_rfc3339(),
                            "days_left": c.remaining(Utc::now()).num_days(),
                            "renewal_due": c.needs_renewal(renew_before, Utc::now()),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&json_output)?);
            } else {
                println!("{:<40} {:<22} {:<10} {:<8}", "DOMAIN", "NOT_AFTER", "DAYS_LEFT", "RENEW");
                println!("{}", "-".repeat(83));

                for cert in &certs {
                    println!(
                        "{:<40} {:<22} {:<10} {:<8}",
                        cert.domain,
                        cert.not_after.format("%Y-%m-%d %H:%M:%S"),
                        cert.remaining(Utc::now()).num_days(),
                        if cert.needs_renewal(renew_before, Utc::now()) { "due" } else { "-" }
                    );
                }

                println!("\nTotal: {} certificate(s)", certs.len());
            }
        }

        Commands::Show { domain } => {
            let manager = CertificateManager::new(&certs_dir, Arc::new(SelfSignedIssuer::default()))?;
            match manager.load(&domain)? {
                Some(cert) => print_certificate(&manager, &cert, renew_before),
                None => {
                    eprintln!("No certificate found for {}", domain);
                    std::process::exit(1);
                }
            }
        }

        Commands::SelfSign { domain, days } => {
            let issuer = Arc::new(SelfSignedIssuer::new(Duration::days(days)));
            let manager = CertificateManager::new(&certs_dir, issuer)?;
            let cert = manager.ensure_certificate(&domain).await?;

            println!("Certificate ready:");
            print_certificate(&manager, &cert, renew_before);
        }
    }

    Ok(())
}

fn print_certificate(manager: &CertificateManager, cert: &DomainCertificate, renew_before: Duration) {
    let (key_path, cert_path) = manager.cert_paths(&cert.domain);
    let now = Utc::now();

    println!("  Domain:       {}", cert.domain);
    println!("  Not after:    {}", cert.not_after.to_rfc3339());
    println!("  Days left:    {}", cert.remaining(now).num_days());
    println!("  Renewal due:  {}", cert.needs_renewal(renew_before, now));
    println!("  Certificate:  {}", cert_path.display());
    println!("  Private key:  {}", key_path.display());
}
