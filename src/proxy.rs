//! HTTP/HTTPS server in front of the content resolver
//!
//! Maps the inbound `Host` to a served web3:// website, fetches the
//! requested path through the [`ContentResolver`] and streams the response
//! back, patching HTML on the way.

use crate::cache::{CachedResponse, CaptureStream, PageCache};
use crate::certificate::{ChallengeRegistry, ACME_CHALLENGE_PREFIX};
use crate::error::GatewayError;
use crate::patch::{is_html, ContentEncoding, HtmlPatcher, PatchedStream, RequestContext};
use crate::resolver::{header_value, BodyStream, ContentResolver, ResolvedResponse};
use crate::translate::{is_web3_link, UrlTranslator};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures_util::{stream, StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue, HOST, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use url::Url;

/// Body of every gateway response
pub type GatewayBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Headers describing the connection rather than the content
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Gateway server configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub https_port: u16,
    /// Redirect plain HTTP requests to HTTPS
    pub enable_https: bool,
    /// Keep every fetched response in memory for the process lifetime
    pub force_cache: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            https_port: 8443,
            enable_https: false,
            force_cache: false,
        }
    }
}

/// Gateway server
pub struct GatewayServer {
    config: GatewayConfig,
    translator: UrlTranslator,
    patcher: Arc<HtmlPatcher>,
    resolver: Arc<dyn ContentResolver>,
    cache: Arc<PageCache>,
    challenges: Arc<ChallengeRegistry>,
}

impl GatewayServer {
    /// Create a new gateway server
    pub fn new(
        config: GatewayConfig,
        translator: UrlTranslator,
        resolver: Arc<dyn ContentResolver>,
        challenges: Arc<ChallengeRegistry>,
    ) -> Self {
        let patcher = Arc::new(HtmlPatcher::new(translator.clone()));
        Self {
            config,
            translator,
            patcher,
            resolver,
            cache: Arc::new(PageCache::new()),
            challenges,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// Serve plain HTTP until the listener fails
    pub async fn run_http(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.http_port).parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTP port {}", self.config.http_port))?;
        info!("HTTP server listening on {}", addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr, false).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Serve HTTPS until the listener fails
    pub async fn run_https(self: Arc<Self>, acceptor: TlsAcceptor) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.https_port).parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTPS port {}", self.config.https_port))?;
        info!("HTTPS server listening on {}", addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();
            let acceptor = acceptor.clone();

            tokio::spawn(async move {
                let stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!("TLS handshake with {} failed: {}", remote_addr, e);
                        return;
                    }
                };
                if let Err(e) = server.handle_connection(stream, remote_addr, true).await {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single connection
    async fn handle_connection<I>(self: Arc<Self>, stream: I, remote_addr: SocketAddr, is_tls: bool) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = self.clone();
                    async move { server.handle_request(req, remote_addr, is_tls).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        is_tls: bool,
    ) -> Result<Response<GatewayBody>, Infallible> {
        match self.process_request(req, remote_addr, is_tls).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Request error: {}", e);
                Ok(Self::text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"))
            }
        }
    }

    /// Process request
    async fn process_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        is_tls: bool,
    ) -> Result<Response<GatewayBody>> {
        let path = req.uri().path().to_string();
        debug!("{} {} from {}", req.method(), path, remote_addr);

        // ACME challenge endpoint, answered on every listener
        if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
            if let Some(key_auth) = self.challenges.get(token) {
                return Ok(Self::text_response(StatusCode::OK, &key_auth));
            }
            return Ok(Self::text_response(StatusCode::NOT_FOUND, "Challenge not found"));
        }

        let host = match req.headers().get(HOST).and_then(|h| h.to_str().ok()) {
            Some(h) => h.to_string(),
            None => return Ok(Self::text_response(StatusCode::BAD_REQUEST, "Missing Host header")),
        };

        let is_secure = is_tls || Self::is_https_request(&req);

        if self.config.enable_https && !is_secure {
            return Ok(match self.https_location(&host, &req) {
                Some(location) => Self::redirect_response(&location),
                None => Self::text_response(StatusCode::BAD_REQUEST, "Invalid Host header"),
            });
        }

        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Ok(Self::text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"));
        }

        let site = match self.translator.registry().lookup(&host) {
            Some(site) => site,
            None => {
                info!("{} {} 503 (unknown host)", host, path);
                return Ok(Self::text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "No web3:// website found for this domain",
                ));
            }
        };

        let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let web3_url = format!("{}{}", site.base_address, path_and_query);

        let (resolved, from_cache) = match self.fetch(&web3_url).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!("{} {} 503 {}", host, path, e);
                return Ok(Self::text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    &format!("Error fetching the web3:// website: {}", e),
                ));
            }
        };

        let context = RequestContext::new(host.clone(), is_secure);
        let response = self.build_response(resolved, &context)?;

        info!(
            "{} {} {}{}",
            host,
            path,
            response.status().as_u16(),
            if from_cache { " (from cache)" } else { "" }
        );
        Ok(response)
    }

    /// Resolve a web3:// URL, going through the forced cache when enabled
    async fn fetch(&self, web3_url: &str) -> Result<(ResolvedResponse, bool), GatewayError> {
        if self.config.force_cache {
            if let Some(cached) = self.cache.get(web3_url) {
                return Ok((Self::replay(cached), true));
            }
        }

        let mut resolved = self.resolver.fetch(web3_url).await?;

        if self.config.force_cache {
            let body = std::mem::replace(&mut resolved.body, stream::empty().boxed());
            resolved.body = CaptureStream::new(
                body,
                self.cache.clone(),
                web3_url.to_string(),
                resolved.status,
                resolved.headers.clone(),
            )
            .boxed();
        }

        Ok((resolved, false))
    }

    fn replay(cached: CachedResponse) -> ResolvedResponse {
        let CachedResponse { status, headers, body } = cached;
        ResolvedResponse {
            status,
            headers,
            body: stream::once(async move { Ok(body) }).boxed(),
        }
    }

    /// Turn a resolved response into the client response
    fn build_response(&self, resolved: ResolvedResponse, context: &RequestContext) -> Result<Response<GatewayBody>> {
        let ResolvedResponse { status, headers, body } = resolved;

        let patch_html = header_value(&headers, "content-type").map(is_html).unwrap_or(false);
        let encoding = ContentEncoding::from_header(header_value(&headers, "content-encoding"));

        let mut builder = Response::builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));

        for (name, value) in &headers {
            let lower = name.to_ascii_lowercase();
            if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            if patch_html && lower == "content-length" {
                continue;
            }

            let value = if lower == LOCATION.as_str() && is_web3_link(value) {
                self.translate_location(value, context)
            } else {
                value.clone()
            };

            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => debug!("Dropping invalid upstream header {}", name),
            }
        }

        let body: BodyStream = if patch_html {
            PatchedStream::new(body, self.patcher.clone(), encoding, context.clone()).boxed()
        } else {
            body
        };

        builder
            .body(Self::stream_body(body))
            .context("Failed to build response")
    }

    /// Translated `Location`, or the original value when it cannot be translated
    fn translate_location(&self, value: &str, context: &RequestContext) -> String {
        match self.translator.translate(value, &context.host, context.is_secure) {
            Ok(translated) => translated,
            Err(e) => {
                warn!("Leaving Location header untranslated: {}", e);
                value.to_string()
            }
        }
    }

    /// HTTPS URL of the current request on the HTTPS port
    fn https_location<T>(&self, host: &str, req: &Request<T>) -> Option<String> {
        let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let mut url = Url::parse(&format!("https://{}{}", host, path_and_query)).ok()?;
        let port = match self.config.https_port {
            443 => None,
            port => Some(port),
        };
        url.set_port(port).ok()?;
        Some(url.to_string())
    }

    /// Check if request is from HTTPS (via proxy headers)
    fn is_https_request<T>(req: &Request<T>) -> bool {
        let header_is = |name: &str, expected: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case(expected))
                .unwrap_or(false)
        };

        header_is("x-forwarded-proto", "https")
            || header_is("x-forwarded-ssl", "on")
            || header_is("front-end-https", "on")
    }

    /// Create text response
    fn text_response(status: StatusCode, body: &str) -> Response<GatewayBody> {
        let mut response = Response::new(Self::full_body(Bytes::from(body.to_string())));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert("Content-Type", HeaderValue::from_static("text/plain"));
        response
    }

    /// Create redirect response
    fn redirect_response(location: &str) -> Response<GatewayBody> {
        let mut response = Response::new(Self::empty_body());
        *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
        if let Ok(value) = HeaderValue::from_str(location) {
            response.headers_mut().insert(LOCATION, value);
        }
        response
    }

    /// Create streaming body
    fn stream_body(body: BodyStream) -> GatewayBody {
        let frames = body
            .map_err(|e| std::io::Error::other(e.to_string()))
            .map_ok(Frame::data);
        StreamBody::new(frames).boxed_unsync()
    }

    /// Create full body
    fn full_body(bytes: Bytes) -> GatewayBody {
        Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
    }

    /// Create empty body
    fn empty_body() -> GatewayBody {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
    }
}
