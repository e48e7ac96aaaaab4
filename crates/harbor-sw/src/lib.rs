//! # Harbor Service Worker
//!
//! The offline worker core: keeps a hosted application usable when the
//! network goes away.
//!
//! ## Features
//!
//! - **Generations**: one named cache per version string, stale ones
//!   collected on activation
//! - **Install**: all-or-nothing pre-caching of the shell URL set plus a
//!   synthesized offline page
//! - **Fetch interception**: cache-first, network fallback, opportunistic
//!   repopulation, offline page / 503 on total failure
//! - **Update polling**: periodic version descriptor check broadcast to clients
//! - **Control channel**: `skip-waiting`, `cache-urls`, `clear-cache`
//! - **Sync / push**: sync-request broadcast and notification dispatch
//!
//! ## Architecture
//!
//! ```text
//! OfflineWorker
//!     ├── Lifecycle (Parsed → Installing → Installed → Activating → Activated)
//!     ├── CacheStore
//!     │       └── "{prefix}-{version}" → Cache
//!     │                                     └── CacheKey → CacheEntry
//!     ├── RequestInterceptor ── Fetcher (network)
//!     │       └── CacheWriter (tracked background stores)
//!     ├── UpdatePoller ── UpdateChecker
//!     ├── ClientRegistry (broadcast targets)
//!     └── NotificationSink
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use harbor_common::HarborError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod control;
pub mod fetch;
pub mod lifecycle;
pub mod offline;
pub mod sync;
pub mod update;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheKey, CacheStore, MemoryCacheStorage};
pub use clients::{Client, ClientId, ClientMessage, ClientRegistry, ClientType, InMemoryClients};
pub use control::{ControlAck, ControlMessage};
pub use fetch::{CacheWriter, FetchEvent, FetchOutcome, FetchSource, RequestInterceptor};
pub use lifecycle::{ActivationReport, InstallReport, ServiceWorkerState};
pub use offline::OfflinePage;
pub use sync::{
    Notification, NotificationAction, NotificationSink, RecordingNotifications, SYNC_DATA_TAG,
};
pub use update::{UpdateCheck, UpdateChecker, UpdatePoller, VersionDescriptor};
pub use worker::{EventOutcome, LifecycleEvent, OfflineWorker, WorkerConfig, WorkerEvent};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Activation failed: {0}")]
    ActivationFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Client gone: {0}")]
    ClientGone(String),

    #[error("Notification error: {0}")]
    NotificationError(String),
}

impl From<ServiceWorkerError> for HarborError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::NetworkError(msg) => HarborError::network(msg),
            ServiceWorkerError::CacheError(msg) => HarborError::cache(msg),
            ServiceWorkerError::InvalidMessage(msg) => HarborError::control(msg),
            other => HarborError::internal(other.to_string()),
        }
    }
}

// ==================== Helpers ====================

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
pub(crate) mod testing;
