#![allow(dead_code)]

use async_trait::async_trait;
use editor_control::config::{ClientConfig, ServerConfig};
use editor_control::devtools::DevToolsTracker;
use editor_control::dispatch::Dispatcher;
use editor_control::host::{CommandHost, HostError, OPEN_WEBVIEW_DEVTOOLS, TOGGLE_DEVTOOLS};
use editor_control::instance::{HostMetadata, InstanceRegistry, MemoryIdStore};
use editor_control::server::ServerHandle;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

/// A scripted editor host.
///
/// - `editor.action.selectAll` succeeds with `null`
/// - `fail` fails with "boom"
/// - `slow` answers after 200ms
/// - the devtools toggle flips an internal flag and reports it
/// - anything else echoes its name and arguments
#[derive(Default)]
pub struct MockHost {
    pub devtools_open: Mutex<bool>,
    pub calls: Mutex<Vec<(String, Vec<Value>)>>,
}

impl MockHost {
    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().clone()
    }

    pub fn called(&self, command: &str) -> usize {
        self.calls.lock().iter().filter(|(c, _)| c == command).count()
    }
}

#[async_trait]
impl CommandHost for MockHost {
    async fn execute(&self, command: &str, args: Vec<Value>) -> Result<Value, HostError> {
        self.calls.lock().push((command.to_string(), args.clone()));
        match command {
            "editor.action.selectAll" => Ok(Value::Null),
            "fail" => Err(HostError::Failed("boom".into())),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!("slow done"))
            }
            TOGGLE_DEVTOOLS => {
                let mut open = self.devtools_open.lock();
                *open = !*open;
                Ok(Value::Bool(*open))
            }
            OPEN_WEBVIEW_DEVTOOLS => Ok(Value::Null),
            _ => Ok(json!({ "command": command, "args": args })),
        }
    }

    async fn list_commands(&self) -> Result<Vec<String>, HostError> {
        Ok(vec![
            "editor.action.selectAll".into(),
            "fail".into(),
            TOGGLE_DEVTOOLS.into(),
        ])
    }
}

pub struct TestServer {
    pub handle: ServerHandle,
    pub host: Arc<MockHost>,
}

impl TestServer {
    pub fn api_url(&self, path: &str) -> String {
        format!("http://{}{}", self.handle.api_addr(), path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.handle.ws_addr())
    }

    /// Client settings pointing at this server, with short timings.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".into(),
            api_port: self.handle.api_addr().port(),
            ws_port: self.handle.ws_addr().port(),
            request_timeout_ms: 2_000,
            heartbeat_interval_ms: 50,
            reconnect_interval_ms: 20,
            max_reconnect_attempts: 3,
            ..ClientConfig::default()
        }
    }
}

/// Start a control plane on ephemeral loopback ports.
pub async fn start_server() -> TestServer {
    let host = Arc::new(MockHost::default());
    let registry = InstanceRegistry::create(
        HostMetadata::local("Visual Studio Code", Some("test-machine".into()))
            .with_workspace_folders(vec!["file:///work".into()]),
        &MemoryIdStore::default(),
    );
    let dispatcher = Dispatcher::new(
        host.clone(),
        registry,
        DevToolsTracker::default(),
        Duration::from_millis(10),
    );
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ws_port: 0,
    };
    let handle = ServerHandle::start(&config, dispatcher)
        .await
        .expect("server should start");
    TestServer { handle, host }
}

pub type WsRead = futures::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Receive the next text message as JSON.
pub async fn recv_json(ws: &mut WsRead) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timeout waiting for message")
        .expect("stream ended")
        .expect("ws error");
    match msg {
        Message::Text(text) => serde_json::from_str(text.as_str()).expect("invalid JSON"),
        other => panic!("expected text message, got {:?}", other),
    }
}

/// Receive a JSON message if one arrives within `wait`.
pub async fn try_recv_json(ws: &mut WsRead, wait: Duration) -> Option<Value> {
    match tokio::time::timeout(wait, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str(text.as_str()).ok(),
        _ => None,
    }
}
