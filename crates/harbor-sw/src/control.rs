//! Control channel messages from clients.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::clients::ClientMessage;
use crate::ServiceWorkerError;

/// Commands a client can send to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Activate the installed generation without waiting for old clients.
    SkipWaiting,
    /// Store these URLs in the current generation.
    CacheUrls { urls: Vec<String> },
    /// Delete every generation.
    ClearCache,
}

impl ControlMessage {
    /// Parse a message body.
    pub fn parse(data: &JsonValue) -> Result<Self, ServiceWorkerError> {
        serde_json::from_value(data.clone())
            .map_err(|e| ServiceWorkerError::InvalidMessage(e.to_string()))
    }

    /// Wire name of the command.
    pub fn command(&self) -> &'static str {
        match self {
            Self::SkipWaiting => "skip-waiting",
            Self::CacheUrls { .. } => "cache-urls",
            Self::ClearCache => "clear-cache",
        }
    }
}

/// Acknowledgement sent back to the client that issued a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlAck {
    pub command: String,
    pub result: Result<(), String>,
}

impl ControlAck {
    pub fn ok(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            result: Ok(()),
        }
    }

    pub fn failed(command: impl Into<String>, error: impl ToString) -> Self {
        Self {
            command: command.into(),
            result: Err(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// The ack as a client message.
    pub fn to_message(&self) -> ClientMessage {
        ClientMessage::Ack {
            command: self.command.clone(),
            ok: self.result.is_ok(),
            error: self.result.as_ref().err().cloned(),
        }
    }
}

/// Best-effort command name for a message that failed to parse.
pub(crate) fn command_name(data: &JsonValue) -> String {
    data.get("type")
        .and_then(JsonValue::as_str)
        .unwrap_or("unknown")
        .to_string()
}
