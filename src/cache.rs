//! In-memory page cache used by `--force-cache`
//!
//! Unbounded: entries are never expired nor evicted.

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures_util::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tracing::debug;

/// A complete resolver response, keyed by its web3:// URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Shared web3:// URL -> response map
#[derive(Debug, Default)]
pub struct PageCache {
    entries: DashMap<String, CachedResponse>,
}

impl PageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Store a response; a later write for the same key wins
    pub fn set(&self, key: impl Into<String>, response: CachedResponse) {
        self.entries.insert(key.into(), response);
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pin_project! {
    /// Passes a body through while recording it; the response is written to
    /// the cache only once the stream ended without error.
    pub struct CaptureStream<S> {
        #[pin]
        inner: S,
        cache: Arc<PageCache>,
        key: Option<String>,
        status: u16,
        headers: Vec<(String, String)>,
        buffer: BytesMut,
    }
}

impl<S> CaptureStream<S> {
    pub fn new(
        inner: S,
        cache: Arc<PageCache>,
        key: String,
        status: u16,
        headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            inner,
            cache,
            key: Some(key),
            status,
            headers,
            buffer: BytesMut::new(),
        }
    }
}

impl<S, E> Stream for CaptureStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = ready!(this.inner.poll_next(cx));

        match &item {
            Some(Ok(chunk)) => {
                if this.key.is_some() {
                    this.buffer.extend_from_slice(chunk);
                }
            }
            Some(Err(_)) => {
                // Partial bodies are never cached
                if let Some(key) = this.key.take() {
                    debug!(key = %key, "Body stream failed, not caching");
                }
                this.buffer.clear();
            }
            None => {
                if let Some(key) = this.key.take() {
                    debug!(key = %key, bytes = this.buffer.len(), "Caching response");
                    this.cache.set(
                        key,
                        CachedResponse {
                            status: *this.status,
                            headers: std::mem::take(this.headers),
                            body: std::mem::take(this.buffer).freeze(),
                        },
                    );
                }
            }
        }

        Poll::Ready(item)
    }
}
