//! Test doubles for the network and the cache store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hashbrown::HashMap;
use harbor_net::{Fetcher, NetError, Request, Response, ResponseType};
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::Semaphore;
use url::Url;

use crate::cache::{CacheEntry, CacheKey, CacheStore, MemoryCacheStorage};
use crate::ServiceWorkerError;

#[derive(Default)]
struct Script {
    responses: HashMap<String, Response>,
    failures_left: HashMap<String, u32>,
    calls: Vec<(Method, String)>,
}

/// Scripted network: URLs without a scripted response fail like a DNS error.
#[derive(Default)]
pub struct MockFetcher {
    script: Mutex<Script>,
    offline: AtomicBool,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, response: Response) -> Self {
        self.script
            .lock()
            .unwrap()
            .responses
            .insert(response.url.to_string(), response);
        self
    }

    /// Script a response under a request URL that differs from its final URL.
    pub fn with_response_for(self, url: &str, response: Response) -> Self {
        self.script.lock().unwrap().responses.insert(url.to_string(), response);
        self
    }

    pub fn with_ok(self, url: &str, body: &'static str) -> Self {
        let response = Response::new(Url::parse(url).unwrap(), StatusCode::OK, HeaderMap::new(), body);
        self.with_response(response)
    }

    pub fn with_status(self, url: &str, status: u16) -> Self {
        let response = Response::new(
            Url::parse(url).unwrap(),
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            "",
        );
        self.with_response(response)
    }

    pub fn with_type(self, url: &str, response_type: ResponseType) -> Self {
        let response = Response::new(Url::parse(url).unwrap(), StatusCode::OK, HeaderMap::new(), "x")
            .with_type(response_type);
        self.with_response(response)
    }

    /// Fail the first `n` fetches of `url`.
    pub fn failing_first(self, url: &str, n: u32) -> Self {
        self.script
            .lock()
            .unwrap()
            .failures_left
            .insert(url.to_string(), n);
        self
    }

    /// Toggle total network loss.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(_, u)| u == url)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.script.lock().unwrap().calls.len()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        let mut script = self.script.lock().unwrap();
        script.calls.push((request.method.clone(), url.clone()));

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("network unreachable".into()));
        }
        if let Some(left) = script.failures_left.get_mut(&url) {
            if *left > 0 {
                *left -= 1;
                return Err(NetError::RequestFailed("connection reset".into()));
            }
        }
        script
            .responses
            .get(&url)
            .cloned()
            .ok_or_else(|| NetError::RequestFailed(format!("dns error: {url}")))
    }
}

/// Memory store whose operations can be made to fail.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryCacheStorage,
    fail_deletes: bool,
    fail_puts: bool,
    fail_matches: bool,
    put_gate: Option<Arc<Semaphore>>,
}

impl FailingStore {
    pub async fn with_caches(names: &[&str]) -> Self {
        let store = Self::default();
        for name in names {
            store.inner.open(name).await.unwrap();
        }
        store
    }

    pub fn failing_deletes(mut self) -> Self {
        self.fail_deletes = true;
        self
    }

    pub fn failing_puts(mut self) -> Self {
        self.fail_puts = true;
        self
    }

    pub fn failing_matches(mut self) -> Self {
        self.fail_matches = true;
        self
    }

    /// Each put waits for one permit from `gate`.
    pub fn holding_puts(mut self, gate: Arc<Semaphore>) -> Self {
        self.put_gate = Some(gate);
        self
    }
}

fn injected(op: &str) -> ServiceWorkerError {
    ServiceWorkerError::CacheError(format!("injected {op} failure"))
}

#[async_trait]
impl CacheStore for FailingStore {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        self.inner.open(name).await
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        self.inner.keys().await
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        if self.fail_deletes {
            return Err(injected("delete"));
        }
        self.inner.delete(name).await
    }

    async fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        if self.fail_matches {
            return Err(injected("match"));
        }
        self.inner.match_in(name, key).await
    }

    async fn put(
        &self,
        name: &str,
        key: CacheKey,
        entry: CacheEntry,
    ) -> Result<(), ServiceWorkerError> {
        if let Some(gate) = &self.put_gate {
            gate.acquire().await.map_err(|_| injected("put"))?.forget();
        }
        if self.fail_puts {
            return Err(injected("put"));
        }
        self.inner.put(name, key, entry).await
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(CacheKey, CacheEntry)>,
    ) -> Result<(), ServiceWorkerError> {
        if self.fail_puts {
            return Err(injected("put"));
        }
        self.inner.put_all(name, entries).await
    }
}
