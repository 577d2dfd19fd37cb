//! TLS termination for the served DNS domains
//!
//! The certificate is chosen per connection from the SNI server name.
//! Installed contexts are replaced in place when a certificate is renewed, so
//! new handshakes pick up the renewed certificate without a restart.

use crate::certificate::{CertificateManager, DomainCertificate};
use crate::error::{GatewayError, Result};
use futures_util::future::join_all;
use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Interval between two renewal checks
pub const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// SNI-based certificate resolver
#[derive(Debug, Default)]
pub struct SniResolver {
    contexts: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl SniResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the context of a domain
    pub fn install(&self, cert: &DomainCertificate) -> Result<()> {
        let key = certified_key(cert)?;
        self.contexts
            .write()
            .insert(cert.domain.to_lowercase(), Arc::new(key));
        info!(domain = %cert.domain, not_after = %cert.not_after, "TLS context installed");
        Ok(())
    }

    /// Context for a server name; `None` fails the handshake
    pub fn resolve_name(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let found = self.contexts.read().get(&server_name.to_lowercase()).cloned();
        if found.is_none() {
            warn!(server_name = %server_name, "No SSL certificate found for domain");
        }
        found
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.contexts.read().keys().cloned().collect();
        domains.sort();
        domains
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) => self.resolve_name(name),
            None => {
                warn!("TLS handshake without SNI server name");
                None
            }
        }
    }
}

/// Build the signing context of a stored certificate
fn certified_key(cert: &DomainCertificate) -> Result<CertifiedKey> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert.certificate_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("{}: {}", cert.domain, e)))?;

    if certs.is_empty() {
        return Err(GatewayError::Tls(format!(
            "{}: no certificates found",
            cert.domain
        )));
    }

    let key = rustls_pemfile::private_key(&mut cert.private_key_pem.as_slice())
        .map_err(|e| GatewayError::Tls(format!("{}: {}", cert.domain, e)))?
        .ok_or_else(|| GatewayError::Tls(format!("{}: no private key found", cert.domain)))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| GatewayError::Tls(format!("{}: unsupported private key: {}", cert.domain, e)))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Make ring the process-wide rustls provider; no-op when one is already set
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Server configuration answering handshakes from `resolver`
pub fn server_config(resolver: Arc<SniResolver>) -> Result<Arc<ServerConfig>> {
    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| GatewayError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(resolver);

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Check every domain once, concurrently; failures are logged per domain
pub async fn renew_all(manager: &CertificateManager, resolver: &SniResolver, domains: &[String]) {
    let checks = domains.iter().map(|domain| async move {
        match manager.ensure_certificate(domain).await {
            Ok(cert) => {
                if let Err(e) = resolver.install(&cert) {
                    error!(domain = %domain, error = %e, "Cannot install renewed certificate");
                }
            }
            Err(e) => error!(domain = %domain, error = %e, "Certificate renewal check failed"),
        }
    });
    join_all(checks).await;
}

/// Run [`renew_all`] every `period`, starting one period from now
pub fn spawn_renewal_loop(
    manager: Arc<CertificateManager>,
    resolver: Arc<SniResolver>,
    domains: Vec<String>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            info!(domains = domains.len(), "Checking certificates for renewal");
            renew_all(&manager, &resolver, &domains).await;
        }
    })
}
