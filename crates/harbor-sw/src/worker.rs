//! The offline worker: owns the collaborators and dispatches lifecycle events.

use std::sync::Arc;
use std::time::Duration;

use harbor_common::RetryConfig;
use harbor_net::Fetcher;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::clients::{ClientId, ClientMessage, ClientRegistry, ClientType};
use crate::control::{command_name, ControlAck, ControlMessage};
use crate::fetch::{FetchEvent, FetchOutcome, RequestInterceptor};
use crate::lifecycle::{
    self, ActivationReport, InstallReport, Lifecycle, PrecachePolicy, ServiceWorkerState,
};
use crate::offline::OfflinePage;
use crate::sync::{opens_app, Notification, NotificationSink, SYNC_DATA_TAG};
use crate::update::{UpdateCheck, UpdateChecker, UpdatePoller};
use crate::{now_millis, ServiceWorkerError};

/// Tag of notifications raised from push events.
const PUSH_NOTIFICATION_TAG: &str = "harbor-push";

// ==================== Config ====================

/// Settings for one worker generation.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Version of the running code; names the cache generation.
    pub version: String,
    /// Prefix of cache generation names.
    pub cache_prefix: String,
    /// Origin of the hosted application.
    pub origin: Url,
    /// URLs that must be cached before install completes.
    pub shell_urls: Vec<Url>,
    /// URL the offline document is stored under.
    pub offline_url: Url,
    /// Where the version descriptor is published.
    pub version_url: Url,
    pub update_interval: Duration,
    pub fetch_timeout: Duration,
    /// Retry policy for install and `cache-urls` fetches.
    pub precache_retry: RetryConfig,
    pub app_name: String,
}

impl WorkerConfig {
    /// Defaults for an application served from `origin`.
    pub fn new(version: impl Into<String>, origin: Url) -> Self {
        let at = |path: &str| origin.join(path).unwrap_or_else(|_| origin.clone());
        Self {
            version: version.into(),
            cache_prefix: "harbor".to_string(),
            shell_urls: vec![at("/"), at("/offline.html")],
            offline_url: at("/offline.html"),
            version_url: at("/version.json"),
            update_interval: Duration::from_secs(60 * 60),
            fetch_timeout: Duration::from_secs(30),
            precache_retry: RetryConfig::none(),
            app_name: "Harbor".to_string(),
            origin,
        }
    }

    /// Name of this generation's cache.
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    /// Resolve a URL relative to the origin.
    pub fn resolve(&self, url: &str) -> Result<Url, ServiceWorkerError> {
        self.origin
            .join(url)
            .map_err(|e| ServiceWorkerError::InvalidMessage(format!("bad url '{url}': {e}")))
    }

    fn precache_policy(&self) -> PrecachePolicy {
        PrecachePolicy {
            retry: self.precache_retry.clone(),
            timeout: self.fetch_timeout,
        }
    }
}

// ==================== Events ====================

/// Events delivered to the worker by its host.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Install,
    Activate,
    Fetch(FetchEvent),
    Message {
        client_id: Option<ClientId>,
        data: JsonValue,
    },
    Sync {
        tag: String,
    },
    Push {
        payload: Option<String>,
    },
    NotificationClick {
        tag: String,
        action: Option<String>,
    },
}

/// What handling an event produced.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Installed {
        report: InstallReport,
        /// Present when the worker activated straight after installing.
        activation: Option<ActivationReport>,
    },
    Activated(ActivationReport),
    Response(FetchOutcome),
    /// Not intercepted; the host performs the request itself.
    Passthrough,
    Control(ControlAck),
    SyncRequested {
        notified: usize,
    },
    NotificationShown(Notification),
    NotificationClicked {
        client: Option<ClientId>,
    },
    Ignored,
}

/// Worker state notifications for the host.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    StateChange { state: ServiceWorkerState },
    ControllerChange { claimed: usize },
    CachesCleared { removed: usize },
}

// ==================== Worker ====================

/// One generation of the offline worker.
pub struct OfflineWorker {
    config: WorkerConfig,
    cache_name: String,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<dyn ClientRegistry>,
    notifications: Arc<dyn NotificationSink>,
    offline: OfflinePage,
    interceptor: RequestInterceptor,
    checker: Arc<UpdateChecker>,
    lifecycle: RwLock<Lifecycle>,
    poller: Mutex<Option<UpdatePoller>>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl OfflineWorker {
    /// Create a worker. The receiver yields state notifications.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<dyn ClientRegistry>,
        notifications: Arc<dyn NotificationSink>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cache_name = config.cache_name();
        let offline = OfflinePage::synthesize(&config.app_name, config.offline_url.clone());
        let interceptor = RequestInterceptor::new(
            Arc::clone(&store),
            Arc::clone(&fetcher),
            cache_name.clone(),
            offline.clone(),
            config.fetch_timeout,
        );
        let checker = Arc::new(UpdateChecker::new(
            Arc::clone(&fetcher),
            Arc::clone(&clients),
            config.version_url.clone(),
            config.version.clone(),
            config.fetch_timeout,
        ));

        info!(version = %config.version, cache = %cache_name, "Worker created");

        (
            Self {
                config,
                cache_name,
                store,
                fetcher,
                clients,
                notifications,
                offline,
                interceptor,
                checker,
                lifecycle: RwLock::new(Lifecycle::default()),
                poller: Mutex::new(None),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Name of the current cache generation.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub async fn state(&self) -> ServiceWorkerState {
        self.lifecycle.read().await.state
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn set_state(&self, state: ServiceWorkerState) {
        self.lifecycle.write().await.set_state(state);
        self.emit(WorkerEvent::StateChange { state });
    }

    // ---------- install / activate ----------

    /// Pre-cache the offline page and shell URLs into the current generation.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        {
            let mut lifecycle = self.lifecycle.write().await;
            match lifecycle.state {
                ServiceWorkerState::Parsed | ServiceWorkerState::Installed => {}
                other => {
                    return Err(ServiceWorkerError::StateError(format!(
                        "cannot install while {other:?}"
                    )))
                }
            }
            lifecycle.set_state(ServiceWorkerState::Installing);
        }
        self.emit(WorkerEvent::StateChange {
            state: ServiceWorkerState::Installing,
        });

        let result = lifecycle::install(
            self.store.as_ref(),
            self.fetcher.as_ref(),
            &self.cache_name,
            &self.config.shell_urls,
            &self.offline,
            &self.config.precache_policy(),
        )
        .await;

        match result {
            Ok(report) => {
                self.lifecycle.write().await.skip_waiting = true;
                self.set_state(ServiceWorkerState::Installed).await;
                Ok(report)
            }
            Err(e) => {
                self.set_state(ServiceWorkerState::Redundant).await;
                Err(e)
            }
        }
    }

    /// Whether the worker should activate as soon as it is installed.
    pub async fn skip_waiting_requested(&self) -> bool {
        self.lifecycle.read().await.skip_waiting
    }

    /// Let the installed generation activate without waiting for old clients.
    pub async fn skip_waiting(&self) {
        let installed = {
            let mut lifecycle = self.lifecycle.write().await;
            lifecycle.skip_waiting = true;
            lifecycle.state == ServiceWorkerState::Installed
        };
        if installed {
            if let Err(e) = self.activate().await {
                warn!(error = %e, "Activation after skip-waiting failed");
            }
        }
    }

    /// Remove stale generations, claim clients and start update polling.
    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        let previous = {
            let mut lifecycle = self.lifecycle.write().await;
            let previous = lifecycle.state;
            match previous {
                ServiceWorkerState::Installed | ServiceWorkerState::Activated => {}
                other => {
                    return Err(ServiceWorkerError::StateError(format!(
                        "cannot activate while {other:?}"
                    )))
                }
            }
            lifecycle.set_state(ServiceWorkerState::Activating);
            previous
        };
        self.emit(WorkerEvent::StateChange {
            state: ServiceWorkerState::Activating,
        });

        match lifecycle::activate(self.store.as_ref(), self.clients.as_ref(), &self.cache_name).await
        {
            Ok(report) => {
                self.set_state(ServiceWorkerState::Activated).await;
                self.emit(WorkerEvent::ControllerChange {
                    claimed: report.claimed,
                });
                self.start_update_polling().await;
                Ok(report)
            }
            Err(e) => {
                self.set_state(previous).await;
                Err(e)
            }
        }
    }

    // ---------- fetch ----------

    /// Intercept a request. `None` means the host should fetch it itself.
    pub async fn handle_fetch(&self, event: FetchEvent) -> Option<FetchOutcome> {
        if !self.lifecycle.read().await.is_active() {
            debug!(url = %event.request.url, "Not controlling yet");
            return None;
        }
        self.interceptor.handle_fetch(event).await
    }

    // ---------- control channel ----------

    /// Handle a control message and acknowledge it to the sender.
    pub async fn handle_message(&self, client_id: Option<&ClientId>, data: &JsonValue) -> ControlAck {
        let ack = match ControlMessage::parse(data) {
            Ok(message) => self.run_command(message).await,
            Err(e) => {
                warn!(error = %e, "Rejected control message");
                ControlAck::failed(command_name(data), e)
            }
        };

        if let Some(id) = client_id {
            if let Err(e) = self.clients.post(id, ack.to_message()).await {
                debug!(client = %id, error = %e, "Could not deliver ack");
            }
        }
        ack
    }

    async fn run_command(&self, message: ControlMessage) -> ControlAck {
        let command = message.command();
        debug!(command, "Control command");
        let result = match message {
            ControlMessage::SkipWaiting => {
                self.skip_waiting().await;
                Ok(())
            }
            ControlMessage::CacheUrls { urls } => self.cache_urls(&urls).await.map(|_| ()),
            ControlMessage::ClearCache => self.clear_cache().await.map(|_| ()),
        };
        match result {
            Ok(()) => ControlAck::ok(command),
            Err(e) => {
                warn!(command, error = %e, "Control command failed");
                ControlAck::failed(command, e)
            }
        }
    }

    /// Store the given URLs in the current generation, all or nothing.
    pub async fn cache_urls(&self, urls: &[String]) -> Result<usize, ServiceWorkerError> {
        let resolved = urls
            .iter()
            .map(|url| self.config.resolve(url))
            .collect::<Result<Vec<_>, _>>()?;
        let stored = lifecycle::precache(
            self.store.as_ref(),
            self.fetcher.as_ref(),
            &self.cache_name,
            &resolved,
            &self.config.precache_policy(),
            Vec::new(),
        )
        .await?;
        info!(cache = %self.cache_name, stored, "Cached requested URLs");
        Ok(stored)
    }

    /// Delete every cache generation.
    pub async fn clear_cache(&self) -> Result<usize, ServiceWorkerError> {
        let removed = lifecycle::clear_all(self.store.as_ref()).await?;
        info!(removed, "Cleared all caches");
        self.emit(WorkerEvent::CachesCleared { removed });
        Ok(removed)
    }

    // ---------- sync / push ----------

    /// Relay a background sync trigger to clients.
    pub async fn handle_sync(&self, tag: &str) -> usize {
        if tag != SYNC_DATA_TAG {
            debug!(tag, "Ignoring sync tag");
            return 0;
        }
        let notified = self
            .clients
            .broadcast(ClientMessage::SyncRequest {
                timestamp: now_millis(),
            })
            .await;
        info!(notified, "Sync requested");
        notified
    }

    /// Show a notification for a push event.
    pub async fn handle_push(&self, payload: Option<&str>) -> Result<Notification, ServiceWorkerError> {
        let notification =
            Notification::for_push(&self.config.app_name, PUSH_NOTIFICATION_TAG, payload);
        self.notifications.show(notification.clone()).await?;
        Ok(notification)
    }

    /// Close the clicked notification and bring the app forward if asked to.
    pub async fn handle_notification_click(&self, tag: &str, action: Option<&str>) -> Option<ClientId> {
        self.notifications.close(tag).await;
        if !opens_app(action) {
            return None;
        }

        let root = match self.config.resolve("/") {
            Ok(root) => root,
            Err(e) => {
                warn!(error = %e, "Cannot resolve application root");
                return None;
            }
        };
        let existing = self
            .clients
            .clients()
            .await
            .into_iter()
            .find(|c| c.client_type == ClientType::Window && c.url == root);

        let result = match existing {
            Some(client) => self.clients.focus(&client.id).await.map(|_| client.id),
            None => self.clients.open_window(&root).await.map(|client| client.id),
        };
        match result {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "Could not open application window");
                None
            }
        }
    }

    // ---------- updates ----------

    /// Run one update check now.
    pub async fn check_for_update(&self) -> UpdateCheck {
        self.checker.check().await
    }

    /// Start the recurring update check if it isn't running.
    pub async fn start_update_polling(&self) {
        let mut poller = self.poller.lock().await;
        if poller.as_ref().is_some_and(UpdatePoller::is_running) {
            return;
        }
        *poller = Some(UpdatePoller::start(
            Arc::clone(&self.checker),
            self.config.update_interval,
        ));
    }

    pub async fn stop_update_polling(&self) {
        if let Some(mut poller) = self.poller.lock().await.take() {
            poller.stop().await;
        }
    }

    pub async fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .await
            .as_ref()
            .is_some_and(UpdatePoller::is_running)
    }

    /// Stop polling and wait for background cache writes. Returns how many
    /// writes failed.
    pub async fn shutdown(&self) -> usize {
        self.stop_update_polling().await;
        let failed = self.interceptor.writer().drain().await;
        info!(failed_writes = failed, "Worker shut down");
        failed
    }

    // ---------- dispatch ----------

    /// Handle one event from the host.
    pub async fn handle_event(&self, event: LifecycleEvent) -> Result<EventOutcome, ServiceWorkerError> {
        match event {
            LifecycleEvent::Install => {
                let report = self.install().await?;
                let activation = if self.skip_waiting_requested().await {
                    Some(self.activate().await?)
                } else {
                    None
                };
                Ok(EventOutcome::Installed { report, activation })
            }
            LifecycleEvent::Activate => self.activate().await.map(EventOutcome::Activated),
            LifecycleEvent::Fetch(fetch) => Ok(self
                .handle_fetch(fetch)
                .await
                .map_or(EventOutcome::Passthrough, EventOutcome::Response)),
            LifecycleEvent::Message { client_id, data } => Ok(EventOutcome::Control(
                self.handle_message(client_id.as_ref(), &data).await,
            )),
            LifecycleEvent::Sync { tag } => {
                let notified = self.handle_sync(&tag).await;
                if tag == SYNC_DATA_TAG {
                    Ok(EventOutcome::SyncRequested { notified })
                } else {
                    Ok(EventOutcome::Ignored)
                }
            }
            LifecycleEvent::Push { payload } => self
                .handle_push(payload.as_deref())
                .await
                .map(EventOutcome::NotificationShown),
            LifecycleEvent::NotificationClick { tag, action } => Ok(EventOutcome::NotificationClicked {
                client: self.handle_notification_click(&tag, action.as_deref()).await,
            }),
        }
    }
}
