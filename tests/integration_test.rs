//! Integration tests for web3gateway
//!
//! Runs the gateway server against a stub content resolver and checks:
//! - Host routing and error statuses
//! - HTML patching (plain and gzip) and Location translation
//! - ACME challenge route, HTTPS redirect and TLS termination
//! - Forced cache

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::sleep;
use tokio_rustls::TlsAcceptor;
use web3gateway::resolver::ResolvedResponse;
use web3gateway::tls::server_config;
use web3gateway::{
    CertificateManager, ChallengeRegistry, ContentResolver, DomainRegistry, GatewayConfig,
    GatewayError, GatewayServer, SelfSignedIssuer, SniResolver, UrlTranslator,
};

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19400);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const ADDRESS: &str = "0x4e1f41613c9084fdb9e34e11fae9412427480e56";

/// Canned upstream response
#[derive(Clone)]
struct Page {
    status: u16,
    headers: Vec<(String, String)>,
    chunks: Vec<Bytes>,
}

impl Page {
    fn new(status: u16, headers: &[(&str, &str)], chunks: Vec<Bytes>) -> Self {
        Self {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            chunks,
        }
    }

    fn html(body: &str) -> Self {
        Self::new(
            200,
            &[("Content-Type", "text/html; charset=utf-8"), ("Content-Length", &body.len().to_string())],
            vec![Bytes::from(body.to_string())],
        )
    }
}

/// Content resolver answering from a fixed page table
#[derive(Default)]
struct StubResolver {
    pages: HashMap<String, Page>,
    fetched: Mutex<Vec<String>>,
}

impl StubResolver {
    fn with_page(mut self, url: &str, page: Page) -> Self {
        self.pages.insert(url.to_string(), page);
        self
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }
}

#[async_trait]
impl ContentResolver for StubResolver {
    async fn fetch(&self, url: &str) -> web3gateway::Result<ResolvedResponse> {
        self.fetched.lock().push(url.to_string());
        let page = self
            .pages
            .get(url)
            .cloned()
            .ok_or_else(|| GatewayError::UpstreamFetch(format!("{}: not found on chain", url)))?;

        Ok(ResolvedResponse {
            status: page.status,
            headers: page.headers,
            body: stream::iter(page.chunks.into_iter().map(Ok)).boxed(),
        })
    }
}

fn site_url(path: &str) -> String {
    format!("web3://{}{}", ADDRESS, path)
}

/// Create test gateway server
fn setup_gateway(
    config: GatewayConfig,
    resolver: Arc<StubResolver>,
    challenges: Arc<ChallengeRegistry>,
) -> Arc<GatewayServer> {
    let registry = DomainRegistry::from_args(
        &[format!("web3://{}=site.com", ADDRESS), "web3://other.eth=other.com".to_string()],
        false,
    )
    .unwrap();
    let translator = UrlTranslator::new(Arc::new(registry), Some("gw.example".to_string()));
    Arc::new(GatewayServer::new(config, translator, resolver, challenges))
}

/// Start a plain HTTP gateway, returning its port
async fn start_gateway(resolver: Arc<StubResolver>, force_cache: bool) -> u16 {
    let http_port = get_unique_port();
    let config = GatewayConfig {
        http_port,
        https_port: get_unique_port(),
        enable_https: false,
        force_cache,
    };
    let gateway = setup_gateway(config, resolver, Arc::new(ChallengeRegistry::new()));

    tokio::spawn(async move {
        let _ = gateway.run_http().await;
    });

    // Wait for server to start
    sleep(Duration::from_millis(100)).await;
    http_port
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

fn gzip(data: &str) -> Bytes {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data.as_bytes()).unwrap();
    Bytes::from(encoder.finish().unwrap())
}

fn gunzip(data: &[u8]) -> String {
    let mut out = String::new();
    GzDecoder::new(data).read_to_string(&mut out).unwrap();
    out
}

#[tokio::test]
async fn test_html_links_rewritten_and_script_injected() {
    let html = format!(
        r#"<html><head><link href="web3://{}/style.css"></head><body><a href="web3://mydomain.eth/about">x</a><img src="/local.png"></body></html>"#,
        ADDRESS
    );
    let resolver = Arc::new(StubResolver::default().with_page(&site_url("/"), Page::html(&html)));
    let port = start_gateway(resolver.clone(), false).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/", port))
        .header("Host", "site.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/html"));

    let body = response.text().await.unwrap();
    assert!(body.contains(r#"href="http://site.com/style.css""#), "{}", body);
    assert!(body.contains(r#"href="http://mydomain.eth.1.gw.example/about""#), "{}", body);
    assert!(body.contains(r#"src="/local.png""#));
    assert!(body.contains("web3GatewaySites"));
    assert_eq!(body.matches("var web3GatewayFallbackDomain").count(), 1);
    assert!(body.find("<body>").unwrap() < body.find("web3GatewaySites").unwrap());

    assert_eq!(resolver.fetched(), vec![site_url("/")]);
}

#[tokio::test]
async fn test_gzip_html_patched_and_recompressed() {
    let html = r#"<html><body><a href="web3://other.eth/page">other</a></body></html>"#;
    let page = Page::new(
        200,
        &[("Content-Type", "text/html"), ("Content-Encoding", "gzip")],
        vec![gzip(html)],
    );
    let resolver = Arc::new(StubResolver::default().with_page(&site_url("/"), page));
    let port = start_gateway(resolver, false).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/", port))
        .header("Host", "site.com:8080")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");

    let body = gunzip(&response.bytes().await.unwrap());
    assert!(body.contains(r#"href="http://other.com:8080/page""#), "{}", body);
    assert!(body.contains("web3GatewaySites"));
}

#[tokio::test]
async fn test_non_html_passed_through() {
    let page = Page::new(
        200,
        &[("Content-Type", "text/plain"), ("Content-Length", "27")],
        vec![Bytes::from_static(b"web3://mydomain.eth/ "), Bytes::from_static(b"<body>")],
    );
    let resolver = Arc::new(StubResolver::default().with_page(&site_url("/notes.txt"), page));
    let port = start_gateway(resolver, false).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/notes.txt", port))
        .header("Host", "site.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "web3://mydomain.eth/ <body>");
}

#[tokio::test]
async fn test_query_string_reaches_resolver() {
    let resolver = Arc::new(
        StubResolver::default().with_page(&site_url("/search?q=a&page=2"), Page::html("<body></body>")),
    );
    let port = start_gateway(resolver.clone(), false).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/search?q=a&page=2", port))
        .header("Host", "SITE.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(resolver.fetched(), vec![site_url("/search?q=a&page=2")]);
}

#[tokio::test]
async fn test_unknown_host_503() {
    let resolver = Arc::new(StubResolver::default());
    let port = start_gateway(resolver.clone(), false).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/", port))
        .header("Host", "unknown.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(response.text().await.unwrap(), "No web3:// website found for this domain");
    assert!(resolver.fetched().is_empty());
}

#[tokio::test]
async fn test_missing_host_400() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let port = start_gateway(Arc::new(StubResolver::default()), false).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    stream
        .write_all(b"GET /test HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut response = vec![0u8; 1024];
    let n = stream.read(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response[..n]);

    assert!(response.contains("400"), "{}", response);
}

#[tokio::test]
async fn test_upstream_failure_503() {
    let port = start_gateway(Arc::new(StubResolver::default()), false).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/missing.html", port))
        .header("Host", "site.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("Error fetching the web3:// website: "), "{}", body);
    assert!(body.contains("not found on chain"));
}

#[tokio::test]
async fn test_post_not_allowed() {
    let resolver = Arc::new(StubResolver::default().with_page(&site_url("/"), Page::html("<body></body>")));
    let port = start_gateway(resolver.clone(), false).await;

    let response = client()
        .post(format!("http://127.0.0.1:{}/", port))
        .header("Host", "site.com")
        .body("data")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 405);
    assert!(resolver.fetched().is_empty());
}

#[tokio::test]
async fn test_location_header_translated() {
    let page = Page::new(
        302,
        &[("Location", "web3://other.eth/landing?from=old")],
        Vec::new(),
    );
    let resolver = Arc::new(StubResolver::default().with_page(&site_url("/old"), page));
    let port = start_gateway(resolver, false).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/old", port))
        .header("Host", "site.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 302);
    assert_eq!(response.headers().get("location").unwrap(), "http://other.com/landing");
}

#[tokio::test]
async fn test_force_cache_serves_second_request_from_memory() {
    let html = format!(r#"<body><a href="web3://{}/next">n</a></body>"#, ADDRESS);
    let resolver = Arc::new(StubResolver::default().with_page(&site_url("/"), Page::html(&html)));
    let port = start_gateway(resolver.clone(), true).await;

    let mut bodies = Vec::new();
    for host in ["site.com", "site.com:9000"] {
        let response = client()
            .get(format!("http://127.0.0.1:{}/", port))
            .header("Host", host)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        bodies.push(response.text().await.unwrap());
    }

    assert_eq!(resolver.fetched().len(), 1);
    // Replayed pages are patched for the request answering them
    assert!(bodies[0].contains(r#"href="http://site.com/next""#));
    assert!(bodies[1].contains(r#"href="http://site.com:9000/next""#));
}

#[tokio::test]
async fn test_acme_challenge_route() {
    let challenges = Arc::new(ChallengeRegistry::new());
    let http_port = get_unique_port();
    let config = GatewayConfig {
        http_port,
        https_port: get_unique_port(),
        enable_https: true,
        force_cache: false,
    };
    let gateway = setup_gateway(config, Arc::new(StubResolver::default()), challenges.clone());
    tokio::spawn(async move {
        let _ = gateway.run_http().await;
    });
    sleep(Duration::from_millis(100)).await;

    let url = format!("http://127.0.0.1:{}/.well-known/acme-challenge/token123", http_port);
    {
        let _guard = challenges.register("token123", "token123.thumbprint");

        let response = client().get(&url).header("Host", "site.com").send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "token123.thumbprint");
    }

    // Released once the issuance is over
    let response = client().get(&url).header("Host", "site.com").send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_https_redirect() {
    let http_port = get_unique_port();
    let https_port = get_unique_port();
    let config = GatewayConfig {
        http_port,
        https_port,
        enable_https: true,
        force_cache: false,
    };
    let resolver = Arc::new(StubResolver::default().with_page(&site_url("/a?b=c"), Page::html("<body></body>")));
    let gateway = setup_gateway(config, resolver, Arc::new(ChallengeRegistry::new()));
    tokio::spawn(async move {
        let _ = gateway.run_http().await;
    });
    sleep(Duration::from_millis(100)).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/a?b=c", http_port))
        .header("Host", "site.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 301);
    assert_eq!(
        response.headers().get("location").unwrap().to_str().unwrap(),
        format!("https://site.com:{}/a?b=c", https_port)
    );

    // Requests terminated by a TLS front proxy are served
    let response = client()
        .get(format!("http://127.0.0.1:{}/a?b=c", http_port))
        .header("Host", "site.com")
        .header("X-Forwarded-Proto", "https")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_https_serves_installed_domains() {
    let dir = tempdir().unwrap();
    let http_port = get_unique_port();
    let https_port = get_unique_port();

    let challenges = Arc::new(ChallengeRegistry::new());
    let manager = CertificateManager::new(dir.path(), Arc::new(SelfSignedIssuer::default()))
        .unwrap()
        .with_challenges(challenges.clone());
    let sni = Arc::new(SniResolver::new());
    sni.install(&manager.ensure_certificate("site.com").await.unwrap()).unwrap();

    let html = format!(r#"<body><a href="web3://{}/x">x</a></body>"#, ADDRESS);
    let resolver = Arc::new(StubResolver::default().with_page(&site_url("/"), Page::html(&html)));
    let config = GatewayConfig {
        http_port,
        https_port,
        enable_https: true,
        force_cache: false,
    };
    let gateway = setup_gateway(config, resolver, challenges);
    let acceptor = TlsAcceptor::from(server_config(sni).unwrap());
    tokio::spawn(async move {
        let _ = gateway.run_https(acceptor).await;
    });
    sleep(Duration::from_millis(200)).await;

    let local: SocketAddr = format!("127.0.0.1:{}", https_port).parse().unwrap();
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .resolve("site.com", local)
        .resolve("unknown.com", local)
        .build()
        .unwrap();

    let response = client
        .get(format!("https://site.com:{}/", https_port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains(&format!(r#"href="https://site.com:{}/x""#, https_port)), "{}", body);

    // No certificate for this server name: the handshake fails
    let result = client
        .get(format!("https://unknown.com:{}/", https_port))
        .send()
        .await;
    assert!(result.is_err());
}
