//! Error types shared by the gateway library

use thiserror::Error;

/// Errors raised while translating, serving or securing web3:// websites
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed web3:// URL
    #[error("Invalid web3 URL: {0}")]
    InvalidAddress(String),

    /// DNS domain that does not match the accepted grammar
    #[error("Invalid DNS domain: {0}")]
    InvalidDomain(String),

    /// Several served websites (or HTTPS) without a DNS domain on each of them
    #[error("Every served web3:// website needs a DNS domain: {0}")]
    AmbiguousRouting(String),

    /// Neither a served website nor a global gateway can handle the URL
    #[error("No gateway can serve the web3 URL: {0}")]
    UnresolvableUrl(String),

    /// The content resolver failed to fetch a web3:// URL
    #[error("Upstream fetch failed: {0}")]
    UpstreamFetch(String),

    /// HTML patching could not decode or re-encode a chunk
    #[error("Cannot patch HTML: {0}")]
    PatchDecode(String),

    /// Obtaining a certificate from the issuing authority failed
    #[error("Certificate issuance failed for '{domain}': {message}")]
    CertificateIssuance { domain: String, message: String },

    /// Unreadable certificate or private key material
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub(crate) fn issuance(domain: &str, message: impl ToString) -> Self {
        GatewayError::CertificateIssuance {
            domain: domain.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
