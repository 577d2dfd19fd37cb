//! HTML patching of web3:// responses
//!
//! Only the first chunk of an HTML response is patched: web3:// links in
//! resource attributes are translated, and a configuration block plus the
//! bundled client script are injected right after `<body>`. Compressed HTML
//! spread over several chunks cannot be patched and is left untouched.
//! Any decode/encode failure falls back to the original bytes.

use crate::error::{GatewayError, Result};
use crate::translate::{is_web3_link, UrlTranslator};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::Stream;
use once_cell::sync::Lazy;
use pin_project_lite::pin_project;
use regex::{Captures, Regex};
use serde::Serialize;
use std::io::{Read, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tracing::{debug, warn};

/// Client script rewriting links created after page load
pub const BEHAVIOR_SCRIPT: &str = include_str!("../assets/web3-links.js");

/// Upper bound for a decompressed first chunk
const MAX_DECOMPRESSED_BYTES: u64 = 32 * 1024 * 1024;

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<\s*([a-zA-Z0-9]+)((?:"[^"]*"|'[^']*'|[^"'>])*)>"#).expect("static regex")
});

static BODY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<body(?:\s[^>]*)?>").expect("static regex"));

/// One attribute: name, then an optional double-quoted, single-quoted or bare value.
/// Quoted values are consumed whole so their content is never read as attributes.
static ATTRIBUTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#)
        .expect("static regex")
});

/// Attribute carrying a fetchable resource, per element
fn link_attribute(tag: &str) -> Option<&'static str> {
    match tag.to_ascii_lowercase().as_str() {
        "a" | "link" | "area" => Some("href"),
        "img" | "script" | "iframe" | "video" | "audio" | "source" | "embed" | "input" => {
            Some("src")
        }
        "object" => Some("data"),
        _ => None,
    }
}

/// Value of the first `name` attribute in an attribute list
fn find_attribute<'h>(attributes: &'h str, name: &str) -> Option<regex::Match<'h>> {
    ATTRIBUTE_RE
        .captures_iter(attributes)
        .find(|caps| caps[1].eq_ignore_ascii_case(name))
        .and_then(|caps| caps.get(2).or_else(|| caps.get(3)).or_else(|| caps.get(4)))
}

/// Whether a `Content-Type` value designates HTML
pub fn is_html(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("text/html")
}

/// Declared `Content-Encoding` of a response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Other(String),
}

impl ContentEncoding {
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            None => ContentEncoding::Identity,
            Some(v) if v.is_empty() || v == "identity" => ContentEncoding::Identity,
            Some(v) if v == "gzip" || v == "x-gzip" => ContentEncoding::Gzip,
            Some(v) => ContentEncoding::Other(v),
        }
    }

    /// Whether the patcher can decode this encoding
    pub fn is_patchable(&self) -> bool {
        !matches!(self, ContentEncoding::Other(_))
    }
}

/// Host and scheme of the request being answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub host: String,
    pub is_secure: bool,
}

impl RequestContext {
    pub fn new(host: impl Into<String>, is_secure: bool) -> Self {
        Self {
            host: host.into(),
            is_secure,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InjectedSite<'a> {
    hostname_and_chain: String,
    dns_domain: Option<&'a str>,
}

/// Rewrites HTML so web3:// links work through the gateway
#[derive(Debug, Clone)]
pub struct HtmlPatcher {
    translator: UrlTranslator,
    /// Markup inserted after `<body>`, identical for every response
    injection: Arc<str>,
}

impl HtmlPatcher {
    pub fn new(translator: UrlTranslator) -> Self {
        Self::with_behavior_script(translator, BEHAVIOR_SCRIPT)
    }

    pub fn with_behavior_script(translator: UrlTranslator, script: &str) -> Self {
        let sites: Vec<InjectedSite<'_>> = translator
            .registry()
            .sites()
            .iter()
            .map(|site| InjectedSite {
                hostname_and_chain: site.identity_key(),
                dns_domain: site.dns_domain.as_deref(),
            })
            .collect();

        let sites_json = json_for_script(&sites);
        let fallback_json = json_for_script(&translator.fallback_domain());

        let injection = format!(
            "\n<script>\n/* web3gateway: served websites and global gateway, used by the script below */\nvar web3GatewaySites = {};\nvar web3GatewayFallbackDomain = {};\n</script>\n<script>\n{}</script>\n",
            sites_json, fallback_json, script
        );

        Self {
            translator,
            injection: Arc::from(injection),
        }
    }

    /// Markup inserted after the opening body tag
    pub fn injection(&self) -> &str {
        &self.injection
    }

    /// Patch the first chunk of an HTML body. Returns the original bytes when
    /// the chunk cannot be decoded or re-encoded.
    pub fn patch(&self, chunk: &[u8], encoding: &ContentEncoding, context: &RequestContext) -> Bytes {
        match self.try_patch(chunk, encoding, context) {
            Ok(patched) => Bytes::from(patched),
            Err(e) => {
                warn!(host = %context.host, error = %e, "Serving HTML unpatched");
                Bytes::copy_from_slice(chunk)
            }
        }
    }

    fn try_patch(
        &self,
        chunk: &[u8],
        encoding: &ContentEncoding,
        context: &RequestContext,
    ) -> Result<Vec<u8>> {
        let decoded = match encoding {
            ContentEncoding::Identity => chunk.to_vec(),
            ContentEncoding::Gzip => gunzip(chunk)?,
            ContentEncoding::Other(name) => {
                return Err(GatewayError::PatchDecode(format!(
                    "unsupported content encoding {}",
                    name
                )));
            }
        };

        // An uncompressed chunk may end in the middle of a character; keep
        // those trailing bytes as they are.
        let (text, tail) = match std::str::from_utf8(&decoded) {
            Ok(text) => (text, &[][..]),
            Err(e) if e.error_len().is_none() && *encoding == ContentEncoding::Identity => {
                let (head, tail) = decoded.split_at(e.valid_up_to());
                let text = std::str::from_utf8(head)
                    .map_err(|e| GatewayError::PatchDecode(e.to_string()))?;
                (text, tail)
            }
            Err(e) => return Err(GatewayError::PatchDecode(e.to_string())),
        };

        let rewritten = self.rewrite_attributes(text, context);
        let patched = self.inject(&rewritten);

        let mut output = patched.into_bytes();
        output.extend_from_slice(tail);

        match encoding {
            ContentEncoding::Gzip => gzip(&output),
            _ => Ok(output),
        }
    }

    /// Translate web3:// values of resource attributes. Values that cannot
    /// be translated are left as they are.
    pub fn rewrite_attributes(&self, html: &str, context: &RequestContext) -> String {
        TAG_RE
            .replace_all(html, |caps: &Captures<'_>| self.rewrite_tag(caps, context))
            .into_owned()
    }

    fn rewrite_tag(&self, caps: &Captures<'_>, context: &RequestContext) -> String {
        let tag = &caps[0];
        let (Some(whole), Some(name), Some(attributes)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            return tag.to_string();
        };
        let Some(attribute) = link_attribute(name.as_str()) else {
            return tag.to_string();
        };
        let Some(value) = find_attribute(attributes.as_str(), attribute) else {
            return tag.to_string();
        };
        if !is_web3_link(value.as_str()) {
            return tag.to_string();
        }

        match self
            .translator
            .translate(value.as_str(), &context.host, context.is_secure)
        {
            Ok(url) => {
                let start = attributes.start() - whole.start() + value.start();
                let end = attributes.start() - whole.start() + value.end();
                format!("{}{}{}", &tag[..start], url, &tag[end..])
            }
            Err(e) => {
                debug!(url = %value.as_str(), error = %e, "Leaving untranslatable link");
                tag.to_string()
            }
        }
    }

    /// Insert the patch right after the opening body tag, if there is one
    pub fn inject(&self, html: &str) -> String {
        match BODY_RE.find(html) {
            Some(body) => {
                let mut output = String::with_capacity(html.len() + self.injection.len());
                output.push_str(&html[..body.end()]);
                output.push_str(&self.injection);
                output.push_str(&html[body.end()..]);
                output
            }
            None => html.to_string(),
        }
    }
}

/// JSON safe to embed inside a `<script>` element
fn json_for_script<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "null".to_string())
        .replace("</", "<\\/")
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(data)
        .take(MAX_DECOMPRESSED_BYTES + 1)
        .read_to_end(&mut decoded)
        .map_err(|e| GatewayError::PatchDecode(format!("gzip decompression: {}", e)))?;

    if decoded.len() as u64 > MAX_DECOMPRESSED_BYTES {
        return Err(GatewayError::PatchDecode(format!(
            "decompressed HTML exceeds {} bytes",
            MAX_DECOMPRESSED_BYTES
        )));
    }
    Ok(decoded)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| GatewayError::PatchDecode(format!("gzip compression: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| GatewayError::PatchDecode(format!("gzip compression: {}", e)))
}

pin_project! {
    /// Body stream whose first non-empty chunk goes through the [`HtmlPatcher`]
    pub struct PatchedStream<S> {
        #[pin]
        inner: S,
        patcher: Arc<HtmlPatcher>,
        encoding: ContentEncoding,
        context: RequestContext,
        patched: bool,
    }
}

impl<S> PatchedStream<S> {
    pub fn new(
        inner: S,
        patcher: Arc<HtmlPatcher>,
        encoding: ContentEncoding,
        context: RequestContext,
    ) -> Self {
        Self {
            inner,
            patcher,
            encoding,
            context,
            patched: false,
        }
    }
}

impl<S, E> Stream for PatchedStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
{
    type Item = std::result::Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match ready!(this.inner.poll_next(cx)) {
            Some(Ok(chunk)) if !*this.patched && !chunk.is_empty() => {
                *this.patched = true;
                Poll::Ready(Some(Ok(this.patcher.patch(&chunk, this.encoding, this.context))))
            }
            other => Poll::Ready(other),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
