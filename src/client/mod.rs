//! Remote client for a running control plane.
//!
//! [`EditorControlClient`] covers the HTTP API with one method per route.
//! [`EditorControlClient::connect`] opens the persistent WebSocket
//! [`Connection`] for correlated calls and pushed state.

pub mod connection;

pub use connection::{Backoff, Connection, ConnectionEvent, ConnectionOptions, ConnectionState};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::ClientConfig;
use crate::instance::EditorInstance;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    /// The server answered with an error body; the message is verbatim.
    #[error("{0}")]
    Api(String),

    #[error("unexpected response status {0}")]
    Status(reqwest::StatusCode),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Http(e)
        }
    }
}

#[derive(Deserialize)]
struct InstanceResponse {
    instance: EditorInstance,
}

#[derive(Deserialize)]
struct CommandsResponse {
    commands: Vec<String>,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct ToggleResponse {
    #[serde(rename = "devToolsOpen")]
    dev_tools_open: bool,
}

#[derive(Deserialize)]
struct ScriptResponse {
    message: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

pub struct EditorControlClient {
    config: ClientConfig,
    base_url: String,
    http: reqwest::Client,
}

impl EditorControlClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            base_url: config.api_base_url(),
            config,
            http,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn instance_info(&self) -> Result<EditorInstance, ClientError> {
        let resp: InstanceResponse = self.get("/instances").await?;
        Ok(resp.instance)
    }

    pub async fn list_commands(&self) -> Result<Vec<String>, ClientError> {
        let resp: CommandsResponse = self.get("/commands").await?;
        Ok(resp.commands)
    }

    pub async fn execute_command(&self, command: &str, args: Vec<Value>) -> Result<Value, ClientError> {
        let resp: ExecuteResponse = self
            .post("/commands/execute", json!({ "command": command, "args": args }))
            .await?;
        Ok(resp.result)
    }

    pub async fn toggle_devtools(&self) -> Result<bool, ClientError> {
        let resp: ToggleResponse = self.post("/devtools/toggle", json!({})).await?;
        Ok(resp.dev_tools_open)
    }

    /// Open the developer tools if needed and start running `script` there.
    pub async fn execute_in_devtools(&self, script: &str) -> Result<String, ClientError> {
        let resp: ScriptResponse = self
            .post("/devtools/execute", json!({ "script": script }))
            .await?;
        Ok(resp.message)
    }

    /// Check the HTTP API is reachable, then open the WebSocket connection.
    pub async fn connect(&self) -> Result<Connection, ClientError> {
        let instance = self.instance_info().await?;
        tracing::debug!(instance = %instance.id, "control plane reachable");
        Ok(Connection::spawn(ConnectionOptions::from(&self.config)))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        decode(resp).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ClientError> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;
        decode(resp).await
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let body = resp.bytes().await?;
    match serde_json::from_slice::<ErrorResponse>(&body) {
        Ok(err) => Err(ClientError::Api(err.error)),
        Err(_) => Err(ClientError::Status(status)),
    }
}
