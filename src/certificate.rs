//! Certificate manager for the served DNS domains
//!
//! Certificates are obtained through a [`CertificateIssuer`] (ACME in
//! production, self-signed for development), stored as
//! `<domain>-key.pem` / `<domain>-cert.pem` and renewed once they get close
//! to expiry. HTTP-01 challenge responses live in a [`ChallengeRegistry`]
//! only for the duration of an issuance.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use dashmap::DashMap;
use directories::ProjectDirs;
use rcgen::{date_time_ymd, CertificateParams, KeyPair};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{error, info, warn};

/// Certificates expiring within this many days are renewed
pub const DEFAULT_RENEW_BEFORE_DAYS: i64 = 30;

/// Path prefix of HTTP-01 challenge requests
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 challenge responses, by token
#[derive(Debug, Default)]
pub struct ChallengeRegistry {
    responses: DashMap<String, String>,
}

impl ChallengeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `token` with `key_authorization` until the guard is dropped
    pub fn register(&self, token: &str, key_authorization: &str) -> ChallengeGuard<'_> {
        info!(path = %format!("{}{}", ACME_CHALLENGE_PREFIX, token), "Waiting for challenge request");
        self.responses
            .insert(token.to_string(), key_authorization.to_string());
        ChallengeGuard {
            registry: self,
            token: token.to_string(),
        }
    }

    /// Key authorization for a challenge token
    pub fn get(&self, token: &str) -> Option<String> {
        self.responses.get(token).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

/// Scoped challenge registration, removed on drop
#[derive(Debug)]
pub struct ChallengeGuard<'a> {
    registry: &'a ChallengeRegistry,
    token: String,
}

impl Drop for ChallengeGuard<'_> {
    fn drop(&mut self) {
        self.registry.responses.remove(&self.token);
    }
}

/// A certificate and its private key, as stored on disk
#[derive(Debug, Clone)]
pub struct DomainCertificate {
    pub domain: String,
    pub private_key_pem: Vec<u8>,
    pub certificate_pem: Vec<u8>,
    pub not_after: DateTime<Utc>,
}

impl DomainCertificate {
    /// Validity left at `now`
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.not_after - now
    }

    pub fn needs_renewal(&self, renew_before: Duration, now: DateTime<Utc>) -> bool {
        self.remaining(now) <= renew_before
    }
}

/// PEM material returned by an issuer
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub private_key_pem: String,
    pub certificate_pem: String,
}

/// Lifecycle of a domain's certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateState {
    Absent,
    Valid,
    RenewalDue,
}

/// Something able to issue a certificate for a DNS domain
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Issue a certificate for `domain`. HTTP-01 responses must be
    /// registered in `challenges` and released before returning.
    async fn issue(&self, domain: &str, challenges: &ChallengeRegistry) -> Result<IssuedCertificate>;
}

/// Issues self-signed certificates, for development setups
#[derive(Debug, Clone)]
pub struct SelfSignedIssuer {
    validity: Duration,
}

impl SelfSignedIssuer {
    pub fn new(validity: Duration) -> Self {
        Self { validity }
    }
}

impl Default for SelfSignedIssuer {
    fn default() -> Self {
        Self::new(Duration::days(90))
    }
}

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn issue(&self, domain: &str, _challenges: &ChallengeRegistry) -> Result<IssuedCertificate> {
        let key_pair = KeyPair::generate().map_err(|e| GatewayError::issuance(domain, e))?;
        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| GatewayError::issuance(domain, e))?;

        let now = Utc::now();
        let (from, until) = (now - Duration::days(1), now + self.validity);
        params.not_before = date_time_ymd(from.year(), from.month() as u8, from.day() as u8);
        params.not_after = date_time_ymd(until.year(), until.month() as u8, until.day() as u8);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| GatewayError::issuance(domain, e))?;

        info!(domain = %domain, "Generated self-signed certificate");

        Ok(IssuedCertificate {
            private_key_pem: key_pair.serialize_pem(),
            certificate_pem: cert.pem(),
        })
    }
}

/// Expiry of the first certificate of a PEM chain
pub fn parse_not_after(certificate_pem: &[u8]) -> Result<DateTime<Utc>> {
    let mut reader = certificate_pem;
    let der = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| GatewayError::Tls("no certificate in PEM data".to_string()))?
        .map_err(|e| GatewayError::Tls(format!("invalid PEM: {}", e)))?;

    let (_, cert) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| GatewayError::Tls(format!("invalid certificate: {}", e)))?;

    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| GatewayError::Tls("certificate expiry out of range".to_string()))
}

/// Certificate manager for handling the served domains' certificates
pub struct CertificateManager {
    certs_dir: PathBuf,
    issuer: Arc<dyn CertificateIssuer>,
    challenges: Arc<ChallengeRegistry>,
    renew_before: Duration,
    /// One issuance at a time per domain
    domain_locks: DashMap<String, Arc<TokioMutex<()>>>,
}

impl CertificateManager {
    /// Create a new certificate manager storing certificates in `certs_dir`
    pub fn new<P: AsRef<Path>>(certs_dir: P, issuer: Arc<dyn CertificateIssuer>) -> Result<Self> {
        let certs_dir = certs_dir.as_ref().to_path_buf();
        fs::create_dir_all(&certs_dir)?;

        Ok(Self {
            certs_dir,
            issuer,
            challenges: Arc::new(ChallengeRegistry::new()),
            renew_before: Duration::days(DEFAULT_RENEW_BEFORE_DAYS),
            domain_locks: DashMap::new(),
        })
    }

    /// Share an existing challenge registry (the one the HTTP server answers from)
    pub fn with_challenges(mut self, challenges: Arc<ChallengeRegistry>) -> Self {
        self.challenges = challenges;
        self
    }

    pub fn with_renew_before(mut self, renew_before: Duration) -> Self {
        self.renew_before = renew_before;
        self
    }

    /// Per-user configuration directory (`~/.config/web3gateway` on Linux)
    pub fn default_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "web3gateway").map(|dirs| dirs.config_dir().to_path_buf())
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    pub fn challenges(&self) -> &Arc<ChallengeRegistry> {
        &self.challenges
    }

    /// Sanitize domain name for filesystem
    fn sanitize_domain(domain: &str) -> String {
        domain.replace('*', "wildcard").replace(['/', '\\'], "_")
    }

    /// Key and certificate file paths of a domain
    pub fn cert_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        let name = Self::sanitize_domain(domain);
        (
            self.certs_dir.join(format!("{}-key.pem", name)),
            self.certs_dir.join(format!("{}-cert.pem", name)),
        )
    }

    /// Load a domain's certificate from disk, reading its expiry afresh
    pub fn load(&self, domain: &str) -> Result<Option<DomainCertificate>> {
        let (key_path, cert_path) = self.cert_paths(domain);
        if !key_path.exists() || !cert_path.exists() {
            return Ok(None);
        }

        let private_key_pem = fs::read(&key_path)?;
        let certificate_pem = fs::read(&cert_path)?;
        let not_after = parse_not_after(&certificate_pem)?;

        Ok(Some(DomainCertificate {
            domain: domain.to_string(),
            private_key_pem,
            certificate_pem,
            not_after,
        }))
    }

    /// Current lifecycle state of a domain's certificate
    pub fn state(&self, domain: &str) -> Result<CertificateState> {
        Ok(match self.load(domain)? {
            None => CertificateState::Absent,
            Some(cert) if cert.needs_renewal(self.renew_before, Utc::now()) => {
                CertificateState::RenewalDue
            }
            Some(_) => CertificateState::Valid,
        })
    }

    /// Return a usable certificate for `domain`, issuing or renewing it when needed.
    ///
    /// A failed renewal keeps the current certificate while it has not expired.
    /// A failed first issuance is returned as an error.
    pub async fn ensure_certificate(&self, domain: &str) -> Result<DomainCertificate> {
        let lock = self
            .domain_locks
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone();
        let _issuing = lock.lock().await;

        let existing = match self.load(domain) {
            Ok(existing) => existing,
            Err(e) => {
                warn!(domain = %domain, error = %e, "Stored certificate unreadable, issuing a new one");
                None
            }
        };

        match &existing {
            Some(cert) => {
                let days_left = cert.remaining(Utc::now()).num_days();
                info!(domain = %domain, days_left, "Certificate found");
                if !cert.needs_renewal(self.renew_before, Utc::now()) {
                    return Ok(cert.clone());
                }
                info!(domain = %domain, "Certificate needs renewal, renewing");
            }
            None => info!(domain = %domain, "Certificate not found, creating a new one"),
        }

        match self.issue(domain).await {
            Ok(cert) => Ok(cert),
            Err(e) => match existing {
                Some(cert) if cert.not_after > Utc::now() => {
                    error!(domain = %domain, error = %e, "Certificate renewal failed, keeping current certificate");
                    Ok(cert)
                }
                _ => Err(e),
            },
        }
    }

    async fn issue(&self, domain: &str) -> Result<DomainCertificate> {
        let issued = self.issuer.issue(domain, &self.challenges).await?;

        let (key_path, cert_path) = self.cert_paths(domain);
        write_file(&key_path, issued.private_key_pem.as_bytes(), true)?;
        write_file(&cert_path, issued.certificate_pem.as_bytes(), false)?;

        let cert = self.load(domain)?.ok_or_else(|| {
            GatewayError::issuance(domain, "certificate missing after being saved")
        })?;

        info!(domain = %domain, not_after = %cert.not_after, "New certificate created and saved");
        Ok(cert)
    }

    /// All certificates stored in the certificate directory
    pub fn list(&self) -> Result<Vec<DomainCertificate>> {
        let mut domains: Vec<String> = fs::read_dir(&self.certs_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_suffix("-cert.pem"))
                    .map(|domain| domain.to_string())
            })
            .collect();
        domains.sort();

        let mut certs = Vec::new();
        for domain in domains {
            match self.load(&domain) {
                Ok(Some(cert)) => certs.push(cert),
                Ok(None) => {}
                Err(e) => warn!(domain = %domain, error = %e, "Skipping unreadable certificate"),
            }
        }
        Ok(certs)
    }
}

/// Replace a file through a temporary sibling so readers never see half a file
fn write_file(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    let tmp = path.with_extension("pem.tmp");
    fs::write(&tmp, contents)?;

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = private;

    fs::rename(&tmp, path)?;
    Ok(())
}
