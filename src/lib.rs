//! web3gateway - serve web3:// websites over plain HTTP(S)
//!
//! Maps DNS domains to web3:// websites and provides:
//! - Host-based routing to the served websites
//! - web3:// link translation and HTML patching of proxied pages
//! - HTTPS with automatic certificate issuance and renewal (ACME HTTP-01)
//! - Optional in-memory forced cache

pub mod acme;
pub mod cache;
pub mod certificate;
pub mod error;
pub mod patch;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod tls;
pub mod translate;

pub use acme::AcmeIssuer;
pub use cache::PageCache;
pub use certificate::{
    CertificateIssuer, CertificateManager, CertificateState, ChallengeRegistry, DomainCertificate,
    SelfSignedIssuer,
};
pub use error::{GatewayError, Result};
pub use patch::HtmlPatcher;
pub use proxy::{GatewayConfig, GatewayServer};
pub use registry::{DomainRegistry, ServedSite};
pub use resolver::{ContentResolver, HttpGatewayResolver, ResolvedResponse};
pub use tls::SniResolver;
pub use translate::UrlTranslator;
