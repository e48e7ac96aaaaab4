//! JSON-lines wire format between the host process and its driver.
//!
//! Every stdin line is one [`HostEvent`], every stdout line one [`HostOutput`].

use bytes::Bytes;
use harbor_core::{HostError, HostResult};
use harbor_net::{Request, Response};
use harbor_sw::{
    ClientId, ClientMessage, ControlAck, EventOutcome, FetchEvent, FetchSource, LifecycleEvent,
    ServiceWorkerState, UpdateCheck, WorkerEvent,
};
use http::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use url::Url;

fn default_method() -> String {
    "GET".to_string()
}

/// One line of input.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HostEvent {
    Install,
    Activate,
    Fetch {
        /// Absolute, or relative to the origin.
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        navigate: bool,
        #[serde(default)]
        client_id: Option<ClientId>,
        #[serde(default)]
        body: Option<String>,
    },
    Message {
        #[serde(default)]
        client_id: Option<ClientId>,
        data: JsonValue,
    },
    Sync {
        tag: String,
    },
    Push {
        #[serde(default)]
        payload: Option<String>,
    },
    NotificationClick {
        tag: String,
        #[serde(default)]
        action: Option<String>,
    },
    /// Register a window client whose messages are echoed to stdout.
    Connect {
        url: String,
    },
    Disconnect {
        client_id: ClientId,
    },
    CheckUpdate,
    Shutdown,
}

impl HostEvent {
    pub fn parse(line: &str) -> HostResult<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// The worker event this line stands for, if it is one.
    pub fn into_lifecycle(self, origin: &Url) -> HostResult<Option<LifecycleEvent>> {
        let event = match self {
            Self::Install => LifecycleEvent::Install,
            Self::Activate => LifecycleEvent::Activate,
            Self::Fetch {
                url,
                method,
                navigate,
                client_id,
                body,
            } => {
                let method = Method::from_bytes(method.as_bytes())
                    .map_err(|e| HostError::event(format!("bad method '{method}': {e}")))?;
                let mut request = Request::new(method, origin.join(&url)?);
                if navigate {
                    let navigation = Request::navigate(request.url.clone());
                    request.mode = navigation.mode;
                    request.destination = navigation.destination;
                }
                request.body = body.map(Bytes::from);
                LifecycleEvent::Fetch(FetchEvent { request, client_id })
            }
            Self::Message { client_id, data } => LifecycleEvent::Message { client_id, data },
            Self::Sync { tag } => LifecycleEvent::Sync { tag },
            Self::Push { payload } => LifecycleEvent::Push { payload },
            Self::NotificationClick { tag, action } => {
                LifecycleEvent::NotificationClick { tag, action }
            }
            Self::Connect { .. } | Self::Disconnect { .. } | Self::CheckUpdate | Self::Shutdown => {
                return Ok(None)
            }
        };
        Ok(Some(event))
    }
}

/// One line of output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HostOutput {
    Installed {
        cache: String,
        entries: usize,
        activated: bool,
    },
    Activated {
        deleted: Vec<String>,
        claimed: usize,
    },
    Response {
        url: String,
        status: u16,
        source: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
        body: String,
    },
    Ack {
        command: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SyncRequested {
        notified: usize,
    },
    Notification {
        tag: String,
        title: String,
        body: String,
    },
    NotificationClicked {
        client_id: Option<ClientId>,
    },
    Connected {
        client_id: ClientId,
    },
    Disconnected {
        client_id: ClientId,
    },
    ClientMessage {
        client_id: ClientId,
        message: ClientMessage,
    },
    UpdateCheck {
        status: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    State {
        state: ServiceWorkerState,
    },
    ControllerChange {
        claimed: usize,
    },
    CachesCleared {
        removed: usize,
    },
    Ignored,
    Error {
        message: String,
    },
}

impl HostOutput {
    pub fn response(response: &Response, source: &'static str) -> Self {
        Self::Response {
            url: response.url.to_string(),
            status: response.status.as_u16(),
            source,
            content_type: response.content_type().map(|mime| mime.to_string()),
            body: String::from_utf8_lossy(response.body()).into_owned(),
        }
    }

    pub fn error(error: impl ToString) -> Self {
        Self::Error {
            message: error.to_string(),
        }
    }

    pub fn to_line(&self) -> HostResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn source_name(source: FetchSource) -> &'static str {
    match source {
        FetchSource::Cache => "cache",
        FetchSource::Network => "network",
        FetchSource::OfflinePage => "offline-page",
        FetchSource::Unavailable => "unavailable",
    }
}

impl From<ControlAck> for HostOutput {
    fn from(ack: ControlAck) -> Self {
        Self::Ack {
            command: ack.command,
            ok: ack.result.is_ok(),
            error: ack.result.err(),
        }
    }
}

impl From<EventOutcome> for HostOutput {
    fn from(outcome: EventOutcome) -> Self {
        match outcome {
            EventOutcome::Installed { report, activation } => Self::Installed {
                cache: report.cache_name,
                entries: report.entries,
                activated: activation.is_some(),
            },
            EventOutcome::Activated(report) => Self::Activated {
                deleted: report.deleted,
                claimed: report.claimed,
            },
            EventOutcome::Response(outcome) => {
                Self::response(&outcome.response, source_name(outcome.source))
            }
            // The host fetches these itself; callers replace this before output.
            EventOutcome::Passthrough => Self::Ignored,
            EventOutcome::Control(ack) => ack.into(),
            EventOutcome::SyncRequested { notified } => Self::SyncRequested { notified },
            EventOutcome::NotificationShown(n) => Self::Notification {
                tag: n.tag,
                title: n.title,
                body: n.body,
            },
            EventOutcome::NotificationClicked { client } => Self::NotificationClicked {
                client_id: client,
            },
            EventOutcome::Ignored => Self::Ignored,
        }
    }
}

impl From<WorkerEvent> for HostOutput {
    fn from(event: WorkerEvent) -> Self {
        match event {
            WorkerEvent::StateChange { state } => Self::State { state },
            WorkerEvent::ControllerChange { claimed } => Self::ControllerChange { claimed },
            WorkerEvent::CachesCleared { removed } => Self::CachesCleared { removed },
        }
    }
}

impl From<UpdateCheck> for HostOutput {
    fn from(check: UpdateCheck) -> Self {
        match check {
            UpdateCheck::UpToDate => Self::UpdateCheck {
                status: "up-to-date",
                version: None,
                error: None,
            },
            UpdateCheck::UpdateAvailable { version, .. } => Self::UpdateCheck {
                status: "update-available",
                version: Some(version),
                error: None,
            },
            UpdateCheck::Failed(error) => Self::UpdateCheck {
                status: "failed",
                version: None,
                error: Some(error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_net::RequestMode;
    use http::StatusCode;
    use serde_json::json;

    fn origin() -> Url {
        Url::parse("https://app.test").unwrap()
    }

    #[test]
    fn test_parse_fetch_defaults() {
        let event = HostEvent::parse(r#"{"event":"fetch","url":"/app.js"}"#).unwrap();
        let lifecycle = event.into_lifecycle(&origin()).unwrap().unwrap();
        match lifecycle {
            LifecycleEvent::Fetch(fetch) => {
                assert_eq!(fetch.request.method, Method::GET);
                assert_eq!(fetch.request.url.as_str(), "https://app.test/app.js");
                assert!(!fetch.request.is_navigation());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_parse_navigation_post_and_message() {
        let nav = HostEvent::parse(r#"{"event":"fetch","url":"/","navigate":true}"#)
            .unwrap()
            .into_lifecycle(&origin())
            .unwrap();
        assert!(matches!(
            nav,
            Some(LifecycleEvent::Fetch(ref f)) if f.request.mode == RequestMode::Navigate
        ));

        let post = HostEvent::parse(r#"{"event":"fetch","url":"/api","method":"POST","body":"{}"}"#)
            .unwrap()
            .into_lifecycle(&origin())
            .unwrap();
        assert!(matches!(
            post,
            Some(LifecycleEvent::Fetch(ref f)) if f.request.method == Method::POST
        ));

        let message = HostEvent::parse(
            r#"{"event":"message","client_id":"client-1","data":{"type":"clear-cache"}}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            HostEvent::Message {
                client_id: Some(ClientId::new("client-1")),
                data: json!({"type": "clear-cache"}),
            }
        );
    }

    #[test]
    fn test_host_only_events() {
        for line in [
            r#"{"event":"connect","url":"/"}"#,
            r#"{"event":"check-update"}"#,
            r#"{"event":"shutdown"}"#,
        ] {
            let event = HostEvent::parse(line).unwrap();
            assert!(event.into_lifecycle(&origin()).unwrap().is_none());
        }
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(HostEvent::parse(r#"{"event":"reboot"}"#).is_err());
        assert!(HostEvent::parse("not json").is_err());
        let bad_method = HostEvent::parse(r#"{"event":"fetch","url":"/","method":"GE T"}"#).unwrap();
        assert!(matches!(
            bad_method.into_lifecycle(&origin()),
            Err(HostError::Event(_))
        ));
    }

    #[test]
    fn test_output_lines() {
        let response = Response::synthesized(
            origin().join("/logo.png").unwrap(),
            StatusCode::SERVICE_UNAVAILABLE,
            "text/plain; charset=utf-8",
            "Offline - resource unavailable",
        );
        let value: JsonValue =
            serde_json::from_str(&HostOutput::response(&response, "unavailable").to_line().unwrap())
                .unwrap();
        assert_eq!(value["kind"], "response");
        assert_eq!(value["status"], 503);
        assert_eq!(value["source"], "unavailable");
        assert_eq!(value["body"], "Offline - resource unavailable");

        let ack: HostOutput = ControlAck::ok("clear-cache").into();
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"kind": "ack", "command": "clear-cache", "ok": true})
        );

        let state: HostOutput = WorkerEvent::StateChange {
            state: ServiceWorkerState::Activated,
        }
        .into();
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({"kind": "state", "state": "activated"})
        );
    }

    #[test]
    fn test_update_check_output() {
        let out: HostOutput = UpdateCheck::UpdateAvailable {
            version: "2.0.0".into(),
            notified: 3,
        }
        .into();
        assert_eq!(
            serde_json::to_value(&out).unwrap(),
            json!({"kind": "update-check", "status": "update-available", "version": "2.0.0"})
        );
    }
}
