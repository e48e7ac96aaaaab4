//! Fetch interception: cache-first with network fallback.
//!
//! ```text
//! GET ──► cache hit? ──yes──► stored response
//!              │no
//!              ▼
//!          network ──ok──► 200 + basic? ──yes──► respond, store in background
//!              │                 │no
//!              │                 └──────────► respond uncached
//!              │failed
//!              ▼
//!         navigation? ──yes──► offline page
//!              │no
//!              └──────────► 503 text/plain
//! ```
//!
//! Cached entries are served for as long as their generation lives; there is
//! no revalidation.

use std::sync::Arc;
use std::time::Duration;

use harbor_common::with_timeout;
use harbor_net::{Fetcher, Request, Response, ResponseType};
use http::StatusCode;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::clients::ClientId;
use crate::offline::OfflinePage;
use crate::ServiceWorkerError;

/// Body of the response served when a subresource is unavailable offline.
pub const UNAVAILABLE_BODY: &str = "Offline - resource unavailable";

// ==================== Fetch Event ====================

/// A fetch event.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// The intercepted request.
    pub request: Request,

    /// Client that issued the request.
    pub client_id: Option<ClientId>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Cache,
    Network,
    OfflinePage,
    Unavailable,
}

/// The response chosen for an intercepted request.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub response: Response,
    pub source: FetchSource,
}

impl FetchOutcome {
    fn new(response: Response, source: FetchSource) -> Self {
        Self { response, source }
    }
}

// ==================== Background Writes ====================

/// Tracks cache writes that run detached from the response path.
///
/// Failures are logged when the task is reaped and never retried.
#[derive(Default)]
pub struct CacheWriter {
    tasks: Mutex<JoinSet<Result<(), ServiceWorkerError>>>,
}

impl CacheWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entry without waiting for the write to finish.
    pub async fn spawn_put(
        &self,
        store: Arc<dyn CacheStore>,
        cache_name: String,
        key: CacheKey,
        entry: CacheEntry,
    ) {
        let mut tasks = self.tasks.lock().await;
        while let Some(done) = tasks.try_join_next() {
            log_write_result(done);
        }
        tasks.spawn(async move {
            trace!(cache = %cache_name, key = %key, "Storing response");
            store.put(&cache_name, key, entry).await
        });
    }

    /// Writes not yet reaped.
    pub async fn pending(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Wait for every outstanding write, including writes queued while
    /// waiting. Returns how many failed.
    pub async fn drain(&self) -> usize {
        let mut failed = 0;
        loop {
            // Taken out so spawn_put is never blocked behind a slow write.
            let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
            if tasks.is_empty() {
                return failed;
            }
            while let Some(done) = tasks.join_next().await {
                if !log_write_result(done) {
                    failed += 1;
                }
            }
        }
    }
}

fn log_write_result(done: Result<Result<(), ServiceWorkerError>, tokio::task::JoinError>) -> bool {
    match done {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "Background cache write failed");
            false
        }
        Err(e) => {
            warn!(error = %e, "Background cache write panicked or was cancelled");
            false
        }
    }
}

// ==================== Interceptor ====================

/// Per-request decision engine.
pub struct RequestInterceptor {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    cache_name: String,
    offline: OfflinePage,
    fetch_timeout: Duration,
    writer: CacheWriter,
}

impl RequestInterceptor {
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        cache_name: impl Into<String>,
        offline: OfflinePage,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            fetcher,
            cache_name: cache_name.into(),
            offline,
            fetch_timeout,
            writer: CacheWriter::new(),
        }
    }

    /// Background writes.
    pub fn writer(&self) -> &CacheWriter {
        &self.writer
    }

    /// Handle fetch event.
    ///
    /// Returns `None` for requests that are not intercepted (anything but
    /// GET); the host sends those to the network itself.
    pub async fn handle_fetch(&self, event: FetchEvent) -> Option<FetchOutcome> {
        let request = event.request;
        let key = match CacheKey::for_request(&request) {
            Some(key) => key,
            None => {
                trace!(url = %request.url, method = %request.method, "Passing through");
                return None;
            }
        };

        match self.store.match_in(&self.cache_name, &key).await {
            Ok(Some(entry)) => {
                debug!(key = %key, "Serving from cache");
                return Some(FetchOutcome::new(entry.to_response(), FetchSource::Cache));
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Cache lookup failed, using network"),
        }

        Some(self.from_network(request, key).await)
    }

    async fn from_network(&self, request: Request, key: CacheKey) -> FetchOutcome {
        let is_navigation = request.is_navigation();
        let cacheable_scheme = matches!(request.url.scheme(), "http" | "https");
        let url = request.url.clone();

        let result = match with_timeout(self.fetch_timeout, self.fetcher.fetch(request)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(response) => {
                if is_cacheable(&response) && cacheable_scheme {
                    self.writer
                        .spawn_put(
                            Arc::clone(&self.store),
                            self.cache_name.clone(),
                            key,
                            CacheEntry::from_response(&response),
                        )
                        .await;
                } else {
                    trace!(
                        url = %url,
                        status = %response.status,
                        response_type = ?response.response_type,
                        "Not caching response"
                    );
                }
                FetchOutcome::new(response, FetchSource::Network)
            }
            Err(error) => {
                debug!(url = %url, error = %error, navigation = is_navigation, "Network failed");
                if is_navigation {
                    FetchOutcome::new(self.offline_response().await, FetchSource::OfflinePage)
                } else {
                    FetchOutcome::new(
                        Response::synthesized(
                            url,
                            StatusCode::SERVICE_UNAVAILABLE,
                            "text/plain; charset=utf-8",
                            UNAVAILABLE_BODY,
                        ),
                        FetchSource::Unavailable,
                    )
                }
            }
        }
    }

    /// The stored offline page, or a freshly synthesized one if the store
    /// can't provide it.
    async fn offline_response(&self) -> Response {
        match self.store.match_in(&self.cache_name, &self.offline.key()).await {
            Ok(Some(entry)) => entry.to_response(),
            Ok(None) => self.offline.to_response(),
            Err(e) => {
                warn!(error = %e, "Offline page lookup failed");
                self.offline.to_response()
            }
        }
    }
}

/// Only complete same-origin responses that arrived without a redirect are
/// worth keeping; a redirected body belongs to a different URL than its key.
fn is_cacheable(response: &Response) -> bool {
    response.status == StatusCode::OK
        && response.response_type == ResponseType::Basic
        && !response.redirected
}
