//! Background sync and push notification dispatch.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ServiceWorkerError;

/// Sync tag that asks clients to sync their data.
pub const SYNC_DATA_TAG: &str = "sync-data";

/// Action id that opens the application.
pub const OPEN_ACTION: &str = "open";

/// Action id that only dismisses.
pub const DISMISS_ACTION: &str = "dismiss";

/// Body used when a push carries no payload.
pub const DEFAULT_PUSH_BODY: &str = "New update available";

/// A user action attached to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// A notification to display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub tag: String,
    pub title: String,
    pub body: String,
    pub actions: Vec<NotificationAction>,
}

impl Notification {
    /// Build the notification for a push event.
    pub fn for_push(app_name: &str, tag: impl Into<String>, payload: Option<&str>) -> Self {
        let body = payload
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .unwrap_or(DEFAULT_PUSH_BODY);
        Self {
            tag: tag.into(),
            title: app_name.to_string(),
            body: body.to_string(),
            actions: vec![
                NotificationAction {
                    action: OPEN_ACTION.to_string(),
                    title: "Open app".to_string(),
                },
                NotificationAction {
                    action: DISMISS_ACTION.to_string(),
                    title: "Dismiss".to_string(),
                },
            ],
        }
    }
}

/// Whether a click with this action should bring the app forward.
///
/// A click on the notification body carries no action.
pub(crate) fn opens_app(action: Option<&str>) -> bool {
    matches!(action, None | Some(OPEN_ACTION) | Some(""))
}

/// Where notifications are displayed.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn show(&self, notification: Notification) -> Result<(), ServiceWorkerError>;

    async fn close(&self, tag: &str);
}

/// Sink that keeps displayed notifications in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifications {
    shown: Mutex<Vec<Notification>>,
}

impl RecordingNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications currently displayed.
    pub fn visible(&self) -> Vec<Notification> {
        self.shown
            .lock()
            .map(|shown| shown.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifications {
    async fn show(&self, notification: Notification) -> Result<(), ServiceWorkerError> {
        info!(tag = %notification.tag, body = %notification.body, "Showing notification");
        let mut shown = self
            .shown
            .lock()
            .map_err(|e| ServiceWorkerError::NotificationError(e.to_string()))?;
        shown.retain(|n| n.tag != notification.tag);
        shown.push(notification);
        Ok(())
    }

    async fn close(&self, tag: &str) {
        if let Ok(mut shown) = self.shown.lock() {
            shown.retain(|n| n.tag != tag);
        }
        debug!(tag, "Closed notification");
    }
}
