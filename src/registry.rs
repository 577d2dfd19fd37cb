//! Domain registry: the web3:// websites served by this gateway
//!
//! Built once at startup from the command line and read-only afterwards.
//! Answers which served website owns an inbound `Host`.

use crate::error::{GatewayError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Scheme accepted for served website addresses
pub const SITE_SCHEME: &str = "web3";

static SITE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^web3://(?P<hostname>[^:/?#]+)(?::(?P<chain>[1-9][0-9]*))?(?P<path>[^#]*)(?:#(?P<fragment>.*))?$",
    )
    .expect("static regex")
});

static DNS_DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+([\-.][a-z0-9]+)*(\.[a-z]{2,20})?$").expect("static regex")
});

/// A web3:// website exposed by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedSite {
    pub hostname: String,
    pub chain_id: u64,
    /// Canonical `web3://host[:chain]` address, without path
    pub base_address: String,
    pub dns_domain: Option<String>,
}

impl ServedSite {
    /// Parse a served website from its web3:// address and optional DNS domain
    pub fn parse(address: &str, dns_domain: Option<&str>) -> Result<Self> {
        let caps = SITE_URL_RE
            .captures(address)
            .ok_or_else(|| GatewayError::InvalidAddress(format!("{} (must start with web3://)", address)))?;

        let path = caps.name("path").map(|m| m.as_str()).unwrap_or("");
        if !path.is_empty() && path != "/" {
            return Err(GatewayError::InvalidAddress(format!(
                "{}: cannot serve a specific path only",
                address
            )));
        }
        if caps.name("fragment").is_some() {
            return Err(GatewayError::InvalidAddress(format!(
                "{}: fragment not allowed",
                address
            )));
        }

        let hostname = caps["hostname"].to_string();
        let explicit_chain = caps.name("chain").map(|m| m.as_str());
        let chain_id = match explicit_chain {
            Some(chain) => chain
                .parse::<u64>()
                .map_err(|_| GatewayError::InvalidAddress(format!("{}: chain id out of range", address)))?,
            None => 1,
        };

        let base_address = match explicit_chain {
            Some(chain) => format!("{}://{}:{}", SITE_SCHEME, hostname, chain),
            None => format!("{}://{}", SITE_SCHEME, hostname),
        };

        let dns_domain = match dns_domain {
            Some(domain) if !is_valid_dns_domain(domain) => {
                return Err(GatewayError::InvalidDomain(domain.to_string()));
            }
            Some(domain) => Some(domain.to_string()),
            None => None,
        };

        Ok(Self {
            hostname,
            chain_id,
            base_address,
            dns_domain,
        })
    }

    /// Parse a command line argument of the form `web3://host[:chain][=dns-domain]`
    pub fn from_arg(arg: &str) -> Result<Self> {
        match arg.split_once('=') {
            Some((address, domain)) => Self::parse(address, Some(domain)),
            None => Self::parse(arg, None),
        }
    }

    /// Key used to recognise links to this website: lowercased hostname,
    /// suffixed with `:chain` unless the chain is the default one.
    pub fn identity_key(&self) -> String {
        identity_key(&self.hostname, self.chain_id)
    }
}

impl fmt::Display for ServedSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dns_domain {
            Some(domain) => write!(f, "{} => {}", domain, self.base_address),
            None => write!(f, "{}", self.base_address),
        }
    }
}

/// Identity key shared by served websites and parsed web3:// URLs
pub(crate) fn identity_key(hostname: &str, chain_id: u64) -> String {
    if chain_id == 1 {
        hostname.to_lowercase()
    } else {
        format!("{}:{}", hostname.to_lowercase(), chain_id)
    }
}

/// Check a DNS domain against the conservative grammar used for configuration
pub fn is_valid_dns_domain(domain: &str) -> bool {
    DNS_DOMAIN_RE.is_match(domain)
}

/// Split a `Host` header into hostname and optional port
pub(crate) fn split_host_port(host: &str) -> (&str, Option<&str>) {
    // Bracketed IPv6 literal
    if host.starts_with('[') {
        if let Some(end) = host.find(']') {
            let port = host[end + 1..].strip_prefix(':');
            return (&host[..=end], port.filter(|p| !p.is_empty()));
        }
        return (host, None);
    }

    match host.split_once(':') {
        Some((name, port)) if !port.is_empty() => (name, Some(port)),
        Some((name, _)) => (name, None),
        None => (host, None),
    }
}

/// Immutable list of served websites
#[derive(Debug, Clone)]
pub struct DomainRegistry {
    sites: Vec<ServedSite>,
}

impl DomainRegistry {
    /// Build the registry, enforcing the routing invariants.
    ///
    /// Several websites can only be told apart by their DNS domain, so each
    /// of them must carry one. `require_dns_domains` applies the same rule to
    /// a single website (certificates are issued per DNS domain).
    pub fn new(sites: Vec<ServedSite>, require_dns_domains: bool) -> Result<Self> {
        if sites.is_empty() {
            return Err(GatewayError::InvalidAddress(
                "no web3:// website to serve".to_string(),
            ));
        }

        let missing: Vec<&str> = sites
            .iter()
            .filter(|site| site.dns_domain.is_none())
            .map(|site| site.base_address.as_str())
            .collect();

        if !missing.is_empty() && (sites.len() > 1 || require_dns_domains) {
            return Err(GatewayError::AmbiguousRouting(missing.join(", ")));
        }

        Ok(Self { sites })
    }

    /// Build the registry from `web3://host[:chain][=dns-domain]` arguments
    pub fn from_args<S: AsRef<str>>(args: &[S], require_dns_domains: bool) -> Result<Self> {
        let sites = args
            .iter()
            .map(|arg| ServedSite::from_arg(arg.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(sites, require_dns_domains)
    }

    pub fn sites(&self) -> &[ServedSite] {
        &self.sites
    }

    /// Whether the single served website answers every host
    pub fn is_single_tenant(&self) -> bool {
        self.sites.len() == 1 && self.sites[0].dns_domain.is_none()
    }

    /// Find the website serving an inbound `Host` header (port ignored)
    pub fn lookup(&self, host: &str) -> Option<&ServedSite> {
        if self.is_single_tenant() {
            return self.sites.first();
        }

        let (hostname, _) = split_host_port(host);
        self.sites.iter().find(|site| {
            site.dns_domain
                .as_deref()
                .map(|domain| domain.eq_ignore_ascii_case(hostname))
                .unwrap_or(false)
        })
    }

    /// Find the website with the given identity key
    pub fn find_by_identity(&self, key: &str) -> Option<&ServedSite> {
        self.sites.iter().find(|site| site.identity_key() == key)
    }

    /// DNS domains of all served websites
    pub fn dns_domains(&self) -> Vec<String> {
        self.sites
            .iter()
            .filter_map(|site| site.dns_domain.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "0x4e1f41613c9084fdb9e34e11fae9412427480e56";

    #[test]
    fn test_parse_site_defaults_chain() {
        let site = ServedSite::parse(&format!("web3://{}", ADDRESS), None).unwrap();
        assert_eq!(site.hostname, ADDRESS);
        assert_eq!(site.chain_id, 1);
        assert_eq!(site.base_address, format!("web3://{}", ADDRESS));
        assert!(site.dns_domain.is_none());
    }

    #[test]
    fn test_parse_site_with_chain_and_domain() {
        let site = ServedSite::from_arg(&format!("web3://{}:11155111/=mysite.com", ADDRESS)).unwrap();
        assert_eq!(site.chain_id, 11155111);
        assert_eq!(site.base_address, format!("web3://{}:11155111", ADDRESS));
        assert_eq!(site.dns_domain.as_deref(), Some("mysite.com"));
        assert_eq!(site.identity_key(), format!("{}:11155111", ADDRESS));
    }

    #[test]
    fn test_explicit_default_chain_shares_identity() {
        let implicit = ServedSite::parse("web3://MyDomain.eth", None).unwrap();
        let explicit = ServedSite::parse("web3://mydomain.eth:1", None).unwrap();
        assert_eq!(implicit.identity_key(), explicit.identity_key());
        assert_eq!(explicit.base_address, "web3://mydomain.eth:1");
    }

    #[test]
    fn test_reject_path_and_fragment() {
        assert!(matches!(
            ServedSite::parse("web3://mydomain.eth/index.html", None),
            Err(GatewayError::InvalidAddress(_))
        ));
        assert!(matches!(
            ServedSite::parse("web3://mydomain.eth/#top", None),
            Err(GatewayError::InvalidAddress(_))
        ));
        assert!(ServedSite::parse("web3://mydomain.eth/", None).is_ok());
    }

    #[test]
    fn test_reject_wrong_scheme() {
        assert!(matches!(
            ServedSite::parse("https://mydomain.eth", None),
            Err(GatewayError::InvalidAddress(_))
        ));
        assert!(matches!(
            ServedSite::parse("w3://mydomain.eth", None),
            Err(GatewayError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_reject_invalid_domain() {
        assert!(matches!(
            ServedSite::from_arg("web3://mydomain.eth=not_a_domain!"),
            Err(GatewayError::InvalidDomain(_))
        ));
        assert!(matches!(
            ServedSite::from_arg("web3://mydomain.eth=-site.com"),
            Err(GatewayError::InvalidDomain(_))
        ));
    }

    #[test]
    fn test_dns_domain_grammar() {
        assert!(is_valid_dns_domain("site.com"));
        assert!(is_valid_dns_domain("my-site.example.org"));
        assert!(is_valid_dns_domain("localhost"));
        assert!(!is_valid_dns_domain("site..com"));
        assert!(!is_valid_dns_domain("site.com."));
        assert!(!is_valid_dns_domain("Site.com"));
    }

    #[test]
    fn test_multiple_sites_need_domains() {
        let result = DomainRegistry::from_args(&["web3://a.eth=a.com", "web3://b.eth"], false);
        assert!(matches!(result, Err(GatewayError::AmbiguousRouting(_))));

        let registry =
            DomainRegistry::from_args(&["web3://a.eth=a.com", "web3://b.eth=b.com"], false).unwrap();
        assert_eq!(registry.dns_domains(), vec!["a.com", "b.com"]);
    }

    #[test]
    fn test_https_needs_domain_for_single_site() {
        assert!(DomainRegistry::from_args(&["web3://a.eth"], false).is_ok());
        assert!(matches!(
            DomainRegistry::from_args(&["web3://a.eth"], true),
            Err(GatewayError::AmbiguousRouting(_))
        ));
    }

    #[test]
    fn test_lookup_single_tenant() {
        let registry = DomainRegistry::from_args(&["web3://a.eth"], false).unwrap();
        assert!(registry.is_single_tenant());
        assert_eq!(registry.lookup("anything.example:8080").unwrap().hostname, "a.eth");
    }

    #[test]
    fn test_lookup_by_domain() {
        let registry =
            DomainRegistry::from_args(&["web3://a.eth=a.com", "web3://b.eth=b.com"], false).unwrap();
        assert_eq!(registry.lookup("b.com").unwrap().hostname, "b.eth");
        assert_eq!(registry.lookup("A.COM:8443").unwrap().hostname, "a.eth");
        assert!(registry.lookup("c.com").is_none());
    }

    #[test]
    fn test_lookup_single_site_with_domain() {
        let registry = DomainRegistry::from_args(&["web3://a.eth=a.com"], false).unwrap();
        assert!(!registry.is_single_tenant());
        assert!(registry.lookup("a.com").is_some());
        assert!(registry.lookup("other.com").is_none());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("site.com"), ("site.com", None));
        assert_eq!(split_host_port("site.com:8080"), ("site.com", Some("8080")));
        assert_eq!(split_host_port("[::1]:8080"), ("[::1]", Some("8080")));
        assert_eq!(split_host_port("[::1]"), ("[::1]", None));
    }
}
