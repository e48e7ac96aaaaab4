//! Update polling.
//!
//! A tick fetches the version descriptor and tells every client when it names
//! a version other than the running one. Failures only end the tick.

use std::sync::Arc;
use std::time::Duration;

use harbor_common::with_timeout;
use harbor_net::{Fetcher, Request};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{ClientMessage, ClientRegistry};

/// Externally published version record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub version: String,
}

/// Outcome of a single update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    UpToDate,
    /// A different version is published; clients were told.
    UpdateAvailable { version: String, notified: usize },
    Failed(String),
}

/// Performs one update check.
pub struct UpdateChecker {
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<dyn ClientRegistry>,
    version_url: Url,
    current_version: String,
    timeout: Duration,
}

impl UpdateChecker {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<dyn ClientRegistry>,
        version_url: Url,
        current_version: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            clients,
            version_url,
            current_version: current_version.into(),
            timeout,
        }
    }

    async fn fetch_descriptor(&self) -> Result<VersionDescriptor, String> {
        let request = Request::get(self.version_url.clone()).timeout(self.timeout);
        let response = with_timeout(self.timeout, self.fetcher.fetch(request))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        if !response.ok() {
            return Err(format!("unexpected status {}", response.status));
        }
        response.json().map_err(|e| e.to_string())
    }

    /// Run one check, broadcasting if the published version differs.
    pub async fn check(&self) -> UpdateCheck {
        let descriptor = match self.fetch_descriptor().await {
            Ok(descriptor) => descriptor,
            Err(error) => {
                warn!(url = %self.version_url, error = %error, "Update check failed");
                return UpdateCheck::Failed(error);
            }
        };

        if descriptor.version == self.current_version {
            debug!(version = %descriptor.version, "Up to date");
            return UpdateCheck::UpToDate;
        }

        info!(
            running = %self.current_version,
            published = %descriptor.version,
            "Update available"
        );
        let notified = self
            .clients
            .broadcast(ClientMessage::UpdateAvailable {
                version: descriptor.version.clone(),
            })
            .await;
        UpdateCheck::UpdateAvailable {
            version: descriptor.version,
            notified,
        }
    }
}

/// Owned handle to the recurring update check.
///
/// The first check runs one interval after [`UpdatePoller::start`]. Dropping
/// the handle stops the task.
pub struct UpdatePoller {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl UpdatePoller {
    /// Spawn the polling task.
    pub fn start(checker: Arc<UpdateChecker>, every: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?every, "Update polling started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        checker.check().await;
                    }
                }
            }
            debug!("Update polling stopped");
        });
        Self {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop polling and wait for the task to exit.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Update polling task ended abnormally");
            }
        }
    }
}

impl Drop for UpdatePoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
