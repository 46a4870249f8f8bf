//! WebSocket message envelope.
//!
//! Every frame is a JSON object tagged by `type`. Validity is per type; a
//! frame whose `type` is not one of the known names is reported as
//! [`ProtocolError::UnknownType`] so the connection can answer with an
//! `error` message and stay open.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::instance::EditorInstance;

/// Every `type` tag the protocol knows.
pub const MESSAGE_TYPES: &[&str] = &[
    "ping",
    "pong",
    "execute_command",
    "command_result",
    "get_instance_info",
    "instance_info",
    "toggle_devtools",
    "devtools_state",
    "error",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Ping,
    Pong {
        timestamp: u64,
    },
    ExecuteCommand {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ExecuteCommandData>,
    },
    CommandResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    GetInstanceInfo,
    InstanceInfo {
        data: EditorInstance,
    },
    ToggleDevtools {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    /// Current panel state. Carries the id of the `toggle_devtools` request
    /// it answers; unsolicited pushes have no id.
    DevtoolsState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        open: bool,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        message: String,
    },
}

/// Payload of an `execute_command` request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecuteCommandData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Failed to process message: missing message type")]
    MissingType,
    #[error("Failed to process message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Message {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => return Err(ProtocolError::UnknownType(other.to_string())),
            None => return Err(ProtocolError::MissingType),
        };
        if !MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The wire `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping => "ping",
            Message::Pong { .. } => "pong",
            Message::ExecuteCommand { .. } => "execute_command",
            Message::CommandResult { .. } => "command_result",
            Message::GetInstanceInfo => "get_instance_info",
            Message::InstanceInfo { .. } => "instance_info",
            Message::ToggleDevtools { .. } => "toggle_devtools",
            Message::DevtoolsState { .. } => "devtools_state",
            Message::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            id: None,
            message: message.into(),
        }
    }

    pub fn command_success(id: Option<u64>, result: Value) -> Self {
        Message::CommandResult {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn command_failure(id: Option<u64>, error: impl Into<String>) -> Self {
        Message::CommandResult {
            id,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}
