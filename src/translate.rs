//! web3:// to gateway URL translation
//!
//! Pure string transform: links to a website served by this gateway point
//! back at the gateway itself, any other web3:// link is delegated to a
//! global gateway using subdomain encoding
//! (`<hostname>[.<chain>].<gateway-domain>`).

use crate::error::{GatewayError, Result};
use crate::registry::{identity_key, split_host_port, DomainRegistry};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

/// Schemes recognised in links
pub const WEB3_SCHEMES: [&str; 2] = ["web3", "w3"];

static WEB3_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<scheme>[^:]+)://(?P<hostname>[^:/?#]+)(?::(?P<chain>[1-9][0-9]*))?(?P<path>/[^?#]*)?(?:\?(?P<query>[^#]*))?(?:#(?P<fragment>.*))?$",
    )
    .expect("static regex")
});

static ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("static regex"));

/// Name service suffix whose names default to chain 1
const NAME_SERVICE_SUFFIX: &str = ".eth";

/// Components of a web3:// URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Web3Url<'a> {
    pub scheme: &'a str,
    pub hostname: &'a str,
    /// Chain id, only when written in the URL
    pub chain_id: Option<u64>,
    pub path: Option<&'a str>,
    pub query: Option<&'a str>,
    pub fragment: Option<&'a str>,
}

impl<'a> Web3Url<'a> {
    /// Parse with a permissive grammar. Malformed input is an ordinary
    /// `InvalidAddress` error.
    pub fn parse(url: &'a str) -> Result<Self> {
        let caps = WEB3_URL_RE
            .captures(url)
            .ok_or_else(|| GatewayError::InvalidAddress(url.to_string()))?;

        let scheme = caps.name("scheme").map(|m| m.as_str()).unwrap_or("");
        if !WEB3_SCHEMES.contains(&scheme) {
            return Err(GatewayError::InvalidAddress(format!(
                "{}: unsupported protocol {}",
                url, scheme
            )));
        }

        let chain_id = match caps.name("chain") {
            Some(chain) => Some(chain.as_str().parse::<u64>().map_err(|_| {
                GatewayError::InvalidAddress(format!("{}: chain id out of range", url))
            })?),
            None => None,
        };

        Ok(Self {
            scheme,
            hostname: caps.name("hostname").map(|m| m.as_str()).unwrap_or(""),
            chain_id,
            path: caps.name("path").map(|m| m.as_str()),
            query: caps.name("query").map(|m| m.as_str()),
            fragment: caps.name("fragment").map(|m| m.as_str()),
        })
    }

    /// Key matched against served websites; an explicit chain 1 is the default chain
    pub fn identity_key(&self) -> String {
        identity_key(self.hostname, self.chain_id.unwrap_or(1))
    }

    /// Whether the hostname is a plain 20-byte hex address
    pub fn is_address(&self) -> bool {
        ADDRESS_RE.is_match(self.hostname)
    }
}

/// Whether a string looks like a link the gateway should translate
pub fn is_web3_link(value: &str) -> bool {
    WEB3_SCHEMES.iter().any(|scheme| {
        value
            .strip_prefix(scheme)
            .map(|rest| rest.starts_with("://"))
            .unwrap_or(false)
    })
}

fn http_scheme(is_secure: bool) -> &'static str {
    if is_secure {
        "https"
    } else {
        "http"
    }
}

/// Translate a web3:// URL into the HTTP(S) URL a browser should follow.
///
/// `request_host` is the `Host` of the request being answered; its port is
/// kept on links to served websites.
pub fn translate(
    url: &str,
    request_host: &str,
    is_secure: bool,
    registry: &DomainRegistry,
    fallback_domain: Option<&str>,
) -> Result<String> {
    let parsed = Web3Url::parse(url)?;

    if let Some(site) = registry.find_by_identity(&parsed.identity_key()) {
        let (request_hostname, request_port) = split_host_port(request_host);
        let mut gateway = site
            .dns_domain
            .clone()
            .unwrap_or_else(|| request_hostname.to_string());
        if let Some(port) = request_port {
            gateway.push(':');
            gateway.push_str(port);
        }

        return Ok(format!(
            "{}://{}{}",
            http_scheme(is_secure),
            gateway,
            parsed.path.unwrap_or("")
        ));
    }

    match fallback_domain {
        Some(domain) => Ok(to_subdomain_url(&parsed, is_secure, domain)),
        None => Err(GatewayError::UnresolvableUrl(url.to_string())),
    }
}

/// Subdomain-encoded URL of a web3:// URL on a global gateway
pub fn to_subdomain_url(url: &Web3Url<'_>, is_secure: bool, gateway_domain: &str) -> String {
    let mut labels = vec![url.hostname.to_lowercase()];

    let chain_label = if url.is_address() {
        Some(url.chain_id.unwrap_or(1))
    } else if url.chain_id.is_none() && labels[0].ends_with(NAME_SERVICE_SUFFIX) {
        Some(1)
    } else {
        url.chain_id
    };
    if let Some(chain) = chain_label {
        labels.push(chain.to_string());
    }

    let mut result = format!(
        "{}://{}.{}{}",
        http_scheme(is_secure),
        labels.join("."),
        gateway_domain,
        url.path.unwrap_or("/")
    );
    if let Some(query) = url.query.filter(|q| !q.is_empty()) {
        result.push('?');
        result.push_str(query);
    }
    if let Some(fragment) = url.fragment.filter(|f| !f.is_empty()) {
        result.push('#');
        result.push_str(fragment);
    }
    result
}

/// Translator bound to the gateway's registry and fallback domain
#[derive(Debug, Clone)]
pub struct UrlTranslator {
    registry: Arc<DomainRegistry>,
    fallback_domain: Option<String>,
}

impl UrlTranslator {
    pub fn new(registry: Arc<DomainRegistry>, fallback_domain: Option<String>) -> Self {
        Self {
            registry,
            fallback_domain,
        }
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }

    pub fn fallback_domain(&self) -> Option<&str> {
        self.fallback_domain.as_deref()
    }

    pub fn translate(&self, url: &str, request_host: &str, is_secure: bool) -> Result<String> {
        translate(
            url,
            request_host,
            is_secure,
            &self.registry,
            self.fallback_domain.as_deref(),
        )
    }
}
