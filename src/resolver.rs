//! Content resolution boundary
//!
//! The gateway does not speak the web3:// protocol itself: a
//! [`ContentResolver`] turns a web3:// URL into a status, headers and a lazy
//! body stream. [`HttpGatewayResolver`] does so by asking an upstream web3
//! HTTP gateway through its subdomain encoding.

use crate::error::{GatewayError, Result};
use crate::translate::{to_subdomain_url, Web3Url};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// Finite, non-restartable body of a resolved web3:// URL
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Response produced by a [`ContentResolver`]
pub struct ResolvedResponse {
    pub status: u16,
    /// Response headers, in upstream order
    pub headers: Vec<(String, String)>,
    pub body: BodyStream,
}

impl ResolvedResponse {
    /// First header with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

impl std::fmt::Debug for ResolvedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// First value of a header in an ordered header list (case-insensitive)
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Fetches the content behind a web3:// URL
#[async_trait]
pub trait ContentResolver: Send + Sync {
    /// Fetch a canonical web3:// URL; failures are `UpstreamFetch` errors
    async fn fetch(&self, url: &str) -> Result<ResolvedResponse>;
}

/// Resolver delegating to an upstream web3 HTTP gateway
#[derive(Debug, Clone)]
pub struct HttpGatewayResolver {
    client: reqwest::Client,
    gateway_domain: String,
    secure: bool,
}

impl HttpGatewayResolver {
    /// Resolver for the gateway at `gateway_domain` (may carry a `:port`)
    pub fn new(gateway_domain: impl Into<String>, secure: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::UpstreamFetch(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, gateway_domain, secure))
    }

    pub fn with_client(client: reqwest::Client, gateway_domain: impl Into<String>, secure: bool) -> Self {
        Self {
            client,
            gateway_domain: gateway_domain.into(),
            secure,
        }
    }

    /// Upstream HTTP URL for a web3:// URL
    pub fn upstream_url(&self, url: &str) -> Result<String> {
        let parsed = Web3Url::parse(url)?;
        Ok(to_subdomain_url(&parsed, self.secure, &self.gateway_domain))
    }
}

#[async_trait]
impl ContentResolver for HttpGatewayResolver {
    async fn fetch(&self, url: &str) -> Result<ResolvedResponse> {
        let upstream = self.upstream_url(url)?;
        debug!(url = %url, upstream = %upstream, "Fetching from upstream gateway");

        let response = self
            .client
            .get(&upstream)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamFetch(format!("{}: {}", upstream, e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(key, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (key.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| GatewayError::UpstreamFetch(e.to_string())))
            .boxed();

        Ok(ResolvedResponse {
            status,
            headers,
            body,
        })
    }
}
