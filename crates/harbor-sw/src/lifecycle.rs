//! Worker lifecycle: state tracking, install-time pre-caching and
//! activation-time garbage collection.

use std::time::{Duration, Instant};

use harbor_common::{retry_with_backoff, with_timeout, RetryConfig};
use harbor_net::{Fetcher, Request};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::clients::ClientRegistry;
use crate::offline::OfflinePage;
use crate::ServiceWorkerError;

// ==================== State ====================

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceWorkerState {
    /// Initial state.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed; this worker will never activate.
    Redundant,
}

/// Lifecycle bookkeeping for one worker generation.
#[derive(Debug, Clone)]
pub(crate) struct Lifecycle {
    pub state: ServiceWorkerState,
    /// Activate as soon as installed instead of waiting for old clients.
    pub skip_waiting: bool,
    pub state_changed_at: Instant,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: ServiceWorkerState::Parsed,
            skip_waiting: false,
            state_changed_at: Instant::now(),
        }
    }
}

impl Lifecycle {
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        debug!(from = ?self.state, to = ?state, "Worker state change");
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }
}

// ==================== Pre-caching ====================

/// How shell/explicit URLs are fetched when pre-caching.
#[derive(Debug, Clone)]
pub(crate) struct PrecachePolicy {
    pub retry: RetryConfig,
    pub timeout: Duration,
}

/// Fetch every URL and store all of them into `cache_name`, or none of them.
///
/// All fetches complete before anything is written, so a failure leaves the
/// store exactly as it was.
pub(crate) async fn precache(
    store: &dyn CacheStore,
    fetcher: &dyn Fetcher,
    cache_name: &str,
    urls: &[Url],
    policy: &PrecachePolicy,
    mut seed: Vec<(CacheKey, CacheEntry)>,
) -> Result<usize, ServiceWorkerError> {
    for url in urls {
        let entry = retry_with_backoff(&policy.retry, || fetch_for_cache(fetcher, url, policy.timeout))
            .await?;
        seed.push((CacheKey::get(url), entry));
    }

    let count = seed.len();
    store.open(cache_name).await?;
    store.put_all(cache_name, seed).await?;
    Ok(count)
}

async fn fetch_for_cache(
    fetcher: &dyn Fetcher,
    url: &Url,
    timeout: Duration,
) -> Result<CacheEntry, ServiceWorkerError> {
    let request = Request::get(url.clone()).timeout(timeout);
    let response = with_timeout(timeout, fetcher.fetch(request))
        .await
        .map_err(|e| ServiceWorkerError::NetworkError(format!("{url}: {e}")))?
        .map_err(|e| ServiceWorkerError::NetworkError(format!("{url}: {e}")))?;

    if !response.ok() {
        return Err(ServiceWorkerError::NetworkError(format!(
            "{url}: unexpected status {}",
            response.status
        )));
    }
    Ok(CacheEntry::from_response(&response))
}

// ==================== Installer ====================

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub cache_name: String,
    /// Entries stored, including the offline page.
    pub entries: usize,
}

/// Seed the current generation with the offline page and the shell URLs.
pub(crate) async fn install(
    store: &dyn CacheStore,
    fetcher: &dyn Fetcher,
    cache_name: &str,
    shell_urls: &[Url],
    offline: &OfflinePage,
    policy: &PrecachePolicy,
) -> Result<InstallReport, ServiceWorkerError> {
    let offline_key = offline.key();
    // The offline document is synthesized, never fetched.
    let remaining: Vec<Url> = shell_urls
        .iter()
        .filter(|url| CacheKey::get(url) != offline_key)
        .cloned()
        .collect();

    info!(cache = cache_name, shell_urls = remaining.len(), "Installing");

    let seed = vec![(offline_key, offline.to_entry())];
    let entries = precache(store, fetcher, cache_name, &remaining, policy, seed)
        .await
        .map_err(|e| {
            warn!(cache = cache_name, error = %e, "Install failed");
            ServiceWorkerError::InstallFailed(e.to_string())
        })?;

    info!(cache = cache_name, entries, "Install complete");
    Ok(InstallReport {
        cache_name: cache_name.to_string(),
        entries,
    })
}

// ==================== Activator ====================

/// Result of a successful activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    /// Stale generations removed.
    pub deleted: Vec<String>,
    /// Clients now controlled by this worker.
    pub claimed: usize,
}

/// Delete every generation except `current`, then claim open clients.
///
/// Deletions run one after another and all of them settle before any client
/// is claimed.
pub(crate) async fn activate(
    store: &dyn CacheStore,
    clients: &dyn ClientRegistry,
    current: &str,
) -> Result<ActivationReport, ServiceWorkerError> {
    let names = store
        .keys()
        .await
        .map_err(|e| ServiceWorkerError::ActivationFailed(e.to_string()))?;

    let mut deleted = Vec::new();
    let mut failures = Vec::new();
    for name in names.into_iter().filter(|name| name != current) {
        match store.delete(&name).await {
            Ok(_) => {
                info!(cache = %name, "Deleted stale cache generation");
                deleted.push(name);
            }
            Err(e) => {
                warn!(cache = %name, error = %e, "Failed to delete stale cache generation");
                failures.push(format!("{name}: {e}"));
            }
        }
    }

    if !failures.is_empty() {
        return Err(ServiceWorkerError::ActivationFailed(failures.join("; ")));
    }

    let claimed = clients.claim(current).await?;
    info!(cache = current, claimed, "Activated");
    Ok(ActivationReport { deleted, claimed })
}

/// Delete every generation. Deleting an already empty store succeeds.
pub(crate) async fn clear_all(store: &dyn CacheStore) -> Result<usize, ServiceWorkerError> {
    let mut removed = 0;
    let mut failures = Vec::new();
    for name in store.keys().await? {
        match store.delete(&name).await {
            Ok(_) => removed += 1,
            Err(e) => failures.push(format!("{name}: {e}")),
        }
    }
    if failures.is_empty() {
        Ok(removed)
    } else {
        Err(ServiceWorkerError::CacheError(failures.join("; ")))
    }
}
