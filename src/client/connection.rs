//! Persistent WebSocket connection to a control plane.
//!
//! A single task owns the socket. It connects, sends heartbeats while
//! connected, and on close or error fails every in-flight call before
//! scheduling the next attempt. Callers talk to the task through
//! [`Connection`]; they never touch the socket.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::MaybeTlsStream;

use crate::config::ClientConfig;
use crate::correlation::{CommandError, CommandOutcome, PendingCommands};
use crate::devtools::DevToolsTracker;
use crate::instance::EditorInstance;
use crate::protocol::{ExecuteCommandData, Message};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Notifications for the owner of a [`Connection`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    InstanceInfo(EditorInstance),
    DevToolsChanged(bool),
    /// An `error` message the server sent without a matching call.
    ServerError(String),
    /// Retrying stopped after this many consecutive failed attempts.
    ReconnectFailed { attempts: u32 },
}

/// Delay between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles from `initial` on every attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(interval) => interval,
            Backoff::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    /// Deadline for the TCP connect plus WebSocket handshake.
    pub connect_timeout: Duration,
    pub backoff: Backoff,
    pub max_reconnect_attempts: u32,
}

impl From<&ClientConfig> for ConnectionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            url: config.ws_url(),
            heartbeat_interval: config.heartbeat_interval(),
            request_timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
            backoff: config.backoff(),
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

struct Shared {
    options: ConnectionOptions,
    state: watch::Sender<ConnectionState>,
    pending: PendingCommands,
    devtools: DevToolsTracker,
    attempts: AtomicU32,
    instance: Mutex<Option<EditorInstance>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!(from = ?*current, to = ?state, "connection state");
                *current = state;
                true
            }
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Handle to the connection task.
pub struct Connection {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Start connecting in the background.
    pub fn spawn(options: ConnectionOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            options,
            state,
            pending: PendingCommands::new(),
            devtools: DevToolsTracker::default(),
            attempts: AtomicU32::new(0),
            instance: Mutex::new(None),
            events,
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(connection_loop(shared.clone(), outbound_rx, shutdown_rx));
        Self {
            shared,
            outbound,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Run a host command and wait for its correlated `command_result`.
    pub async fn execute_command(&self, command: &str, args: Vec<Value>) -> CommandOutcome {
        self.call(|id| Message::ExecuteCommand {
            id: Some(id),
            data: Some(ExecuteCommandData {
                command: Some(command.to_string()),
                args,
                id: Some(id),
            }),
        })
        .await
    }

    /// Toggle the developer tools and return the state the host reported.
    pub async fn toggle_devtools(&self) -> Result<bool, CommandError> {
        let value = self.call(|id| Message::ToggleDevtools { id: Some(id) }).await?;
        value
            .as_bool()
            .ok_or_else(|| CommandError::Remote(format!("unexpected devtools state: {}", value)))
    }

    async fn call(&self, build: impl FnOnce(u64) -> Message) -> CommandOutcome {
        if self.state() != ConnectionState::Connected {
            return Err(CommandError::NotConnected);
        }
        let pending = self.shared.pending.begin(self.shared.options.request_timeout);
        let id = pending.id();
        let json = match build(id).to_json() {
            Ok(json) => json,
            Err(e) => {
                let err = CommandError::Remote(format!("failed to encode request: {}", e));
                self.shared.pending.reject(id, err.clone());
                return Err(err);
            }
        };
        // The socket may have dropped between the state check and here; its
        // cancel_all would have run before this entry existed.
        if self.state() != ConnectionState::Connected || self.outbound.send(json).is_err() {
            self.shared.pending.reject(id, CommandError::NotConnected);
        }
        pending.wait().await
    }

    /// The last instance snapshot the server pushed.
    pub fn instance_info(&self) -> Option<EditorInstance> {
        self.shared.instance.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for(&self, state: ConnectionState) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|current| *current == state).await;
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Calls still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn devtools_open(&self) -> bool {
        self.shared.devtools.get_state()
    }

    /// Resolve on the next reported devtools change.
    ///
    /// Only one waiter exists at a time; a newer call replaces an older one.
    pub fn next_devtools_change(&self) -> oneshot::Receiver<bool> {
        self.shared.devtools.listen_once()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Close the socket and stop reconnecting. Safe to call more than once.
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(?e, "connection task panicked");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn connection_loop(
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let url = shared.options.url.clone();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Requests queued for a previous socket were already failed.
        while outbound_rx.try_recv().is_ok() {}

        shared.set_state(ConnectionState::Connecting);
        let handshake = tokio::time::timeout(
            shared.options.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        let connected = tokio::select! {
            result = handshake => result,
            _ = shutdown_rx.changed() => break,
        };
        match connected {
            Ok(Ok((ws_stream, _))) => {
                shared.attempts.store(0, Ordering::SeqCst);
                shared.set_state(ConnectionState::Connected);
                tracing::info!(%url, "connected");
                shared.emit(ConnectionEvent::Connected);

                let reason =
                    run_connection(&shared, ws_stream, &mut outbound_rx, &mut shutdown_rx).await;

                shared.set_state(ConnectionState::Disconnected);
                let cancelled = shared.pending.cancel_all(&reason);
                tracing::info!(%url, %reason, cancelled, "disconnected");
                shared.emit(ConnectionEvent::Disconnected { reason });
            }
            Ok(Err(e)) => {
                shared.set_state(ConnectionState::Disconnected);
                shared.pending.cancel_all("connect failed");
                tracing::debug!(%url, error = %e, "connect failed");
            }
            Err(_) => {
                shared.set_state(ConnectionState::Disconnected);
                shared.pending.cancel_all("connect timed out");
                tracing::debug!(%url, timeout = ?shared.options.connect_timeout, "handshake timed out");
            }
        }

        if *shutdown_rx.borrow() {
            break;
        }

        let attempt = shared.attempts.load(Ordering::SeqCst) + 1;
        if attempt > shared.options.max_reconnect_attempts {
            let attempts = shared.options.max_reconnect_attempts;
            tracing::warn!(%url, attempts, "max reconnect attempts reached");
            shared.emit(ConnectionEvent::ReconnectFailed { attempts });
            break;
        }
        shared.attempts.store(attempt, Ordering::SeqCst);

        let delay = shared.options.backoff.delay(attempt);
        tracing::debug!(%url, attempt, ?delay, "reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    shared.set_state(ConnectionState::Disconnected);
    shared.pending.cancel_all("connection closed");
}

/// Drive one socket until it closes. Returns why it ended.
async fn run_connection(
    shared: &Shared,
    ws_stream: WsStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> String {
    let (mut sink, mut stream) = ws_stream.split();
    let mut heartbeat = tokio::time::interval(shared.options.heartbeat_interval);
    heartbeat.tick().await; // Skip the first immediate tick.

    let ping = match Message::Ping.to_json() {
        Ok(json) => json,
        Err(e) => return format!("failed to encode ping: {}", e),
    };

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => handle_incoming(shared, text.as_str()),
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sink.send(WsMessage::Pong(data)).await.is_err() {
                            return "send failed".to_string();
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        return match frame {
                            Some(frame) if !frame.reason.is_empty() => {
                                format!("closed by server: {}", frame.reason.as_str())
                            }
                            _ => "closed by server".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return format!("socket error: {}", e),
                    None => return "connection lost".to_string(),
                }
            }
            Some(json) = outbound_rx.recv() => {
                if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                    return format!("send failed: {}", e);
                }
            }
            _ = heartbeat.tick() => {
                // A missing pong is not a failure; only the socket closing is.
                if sink.send(WsMessage::Text(ping.clone().into())).await.is_err() {
                    return "send failed".to_string();
                }
            }
            _ = shutdown_rx.changed() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return "disconnect requested".to_string();
            }
        }
    }
}

fn handle_incoming(shared: &Shared, text: &str) {
    let msg = match Message::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable server message");
            return;
        }
    };

    match msg {
        Message::CommandResult {
            id: Some(id),
            success,
            result,
            error,
        } => {
            if success {
                shared.pending.resolve(id, result.unwrap_or(Value::Null));
            } else {
                let message = error.unwrap_or_else(|| "command failed".to_string());
                shared.pending.reject(id, CommandError::Remote(message));
            }
        }
        Message::DevtoolsState { id, open } => {
            if let Some(id) = id {
                shared.pending.resolve(id, Value::Bool(open));
            }
            if shared.devtools.set_state(open) {
                shared.emit(ConnectionEvent::DevToolsChanged(open));
            }
        }
        Message::Error { id, message } => {
            if let Some(id) = id {
                shared.pending.reject(id, CommandError::Remote(message.clone()));
            }
            tracing::debug!(%message, "server reported an error");
            shared.emit(ConnectionEvent::ServerError(message));
        }
        Message::InstanceInfo { data } => {
            *shared.instance.lock() = Some(data.clone());
            shared.emit(ConnectionEvent::InstanceInfo(data));
        }
        Message::Pong { .. } => {}
        other => {
            tracing::debug!(kind = other.kind(), "ignoring unexpected message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    #[derive(Default)]
    struct Stats {
        connections: AtomicUsize,
        pings: AtomicUsize,
    }

    /// Answers like a control plane, except that it never sends `pong`.
    ///
    /// `hang` is never answered, `drop` closes the socket, `fail` fails.
    async fn serve_scripted(stream: TcpStream, stats: Arc<Stats>) {
        let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        let (mut tx, mut rx) = ws.split();
        let mut open = false;
        while let Some(Ok(msg)) = rx.next().await {
            let WsMessage::Text(text) = msg else { continue };
            let v: Value = serde_json::from_str(text.as_str()).unwrap();
            let reply = match v["type"].as_str() {
                Some("ping") => {
                    stats.pings.fetch_add(1, Ordering::SeqCst);
                    None
                }
                Some("execute_command") => match v["data"]["command"].as_str() {
                    Some("hang") => None,
                    Some("drop") => return,
                    Some("fail") => Some(json!({
                        "type": "command_result", "id": v["id"], "success": false, "error": "boom"
                    })),
                    Some("editor.action.selectAll") => Some(json!({
                        "type": "command_result", "id": v["id"], "success": true, "result": null
                    })),
                    Some(cmd) => Some(json!({
                        "type": "command_result", "id": v["id"], "success": true, "result": cmd
                    })),
                    None => None,
                },
                Some("toggle_devtools") => {
                    open = !open;
                    Some(json!({"type": "devtools_state", "id": v["id"], "open": open}))
                }
                _ => None,
            };
            if let Some(reply) = reply {
                if tx.send(WsMessage::Text(reply.to_string().into())).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Spawn a scripted server. The first `drop_first` connections are
    /// closed right after the handshake.
    async fn spawn_server(drop_first: usize) -> (SocketAddr, Arc<Stats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::default());
        let server_stats = stats.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let n = server_stats.connections.fetch_add(1, Ordering::SeqCst);
                let stats = server_stats.clone();
                tokio::spawn(async move {
                    if n < drop_first {
                        let _ = tokio_tungstenite::accept_async(stream).await;
                        return;
                    }
                    serve_scripted(stream, stats).await;
                });
            }
        });
        (addr, stats)
    }

    fn options(addr: SocketAddr) -> ConnectionOptions {
        ConnectionOptions {
            url: format!("ws://{}", addr),
            heartbeat_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            backoff: Backoff::Fixed(Duration::from_millis(20)),
            max_reconnect_attempts: 3,
        }
    }

    async fn connected(options: ConnectionOptions) -> Connection {
        let conn = Connection::spawn(options);
        timeout(Duration::from_secs(5), conn.wait_for(ConnectionState::Connected))
            .await
            .expect("should connect within 5s");
        conn
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed(Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(9), Duration::from_millis(500));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(7), Duration::from_secs(60));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn execute_resolves_with_result() {
        let (addr, _) = spawn_server(0).await;
        let conn = connected(options(addr)).await;

        let result = conn
            .execute_command("editor.action.selectAll", vec![])
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
        assert_eq!(conn.execute_command("other", vec![]).await.unwrap(), json!("other"));
        assert_eq!(conn.in_flight(), 0);

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn remote_failure_is_passed_through() {
        let (addr, _) = spawn_server(0).await;
        let conn = connected(options(addr)).await;

        let err = conn.execute_command("fail", vec![]).await.unwrap_err();
        assert_eq!(err, CommandError::Remote("boom".into()));

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn execute_before_connect_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = Connection::spawn(options(addr));
        let err = conn.execute_command("anything", vec![]).await.unwrap_err();
        assert_eq!(err, CommandError::NotConnected);
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_mid_flight_rejects_pending() {
        let (addr, _) = spawn_server(0).await;
        let conn = connected(options(addr)).await;

        let (hung, dropped) = tokio::join!(
            conn.execute_command("hang", vec![]),
            async {
                // Let `hang` reach the server first.
                tokio::time::sleep(Duration::from_millis(50)).await;
                conn.execute_command("drop", vec![]).await
            }
        );
        assert!(matches!(hung, Err(CommandError::Disconnected(_))));
        assert!(matches!(dropped, Err(CommandError::Disconnected(_))));
        assert_eq!(conn.in_flight(), 0);

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn reconnect_stops_at_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = Connection::spawn(options(addr));
        let mut events = conn.subscribe();

        let attempts = timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::ReconnectFailed { attempts }) => break attempts,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel closed: {}", e),
                }
            }
        })
        .await
        .expect("should give up within 5s");

        assert_eq!(attempts, 3);
        assert_eq!(conn.reconnect_attempts(), 3);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn attempts_reset_after_successful_reconnect() {
        let (addr, stats) = spawn_server(1).await;
        let conn = Connection::spawn(options(addr));

        timeout(Duration::from_secs(5), async {
            while stats.connections.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("should reconnect within 5s");
        timeout(Duration::from_secs(5), conn.wait_for(ConnectionState::Connected))
            .await
            .unwrap();

        assert_eq!(conn.reconnect_attempts(), 0);
        assert_eq!(conn.execute_command("after", vec![]).await.unwrap(), json!("after"));
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn missing_pong_does_not_disconnect() {
        let (addr, stats) = spawn_server(0).await;
        let conn = connected(ConnectionOptions {
            heartbeat_interval: Duration::from_millis(20),
            ..options(addr)
        })
        .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(stats.pings.load(Ordering::SeqCst) >= 2);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(stats.connections.load(Ordering::SeqCst), 1);

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn unanswered_call_times_out_and_leaves_no_entry() {
        let (addr, _) = spawn_server(0).await;
        let conn = connected(ConnectionOptions {
            request_timeout: Duration::from_millis(100),
            ..options(addr)
        })
        .await;

        let err = conn.execute_command("hang", vec![]).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
        assert_eq!(conn.in_flight(), 0);
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn toggle_is_correlated_and_tracks_state() {
        let (addr, _) = spawn_server(0).await;
        let conn = connected(options(addr)).await;

        let next = conn.next_devtools_change();
        assert!(conn.toggle_devtools().await.unwrap());
        assert!(conn.devtools_open());
        assert_eq!(next.await.unwrap(), true);

        assert!(!conn.toggle_devtools().await.unwrap());
        assert!(!conn.devtools_open());

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (addr, _) = spawn_server(0).await;
        let conn = connected(options(addr)).await;

        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(
            conn.execute_command("late", vec![]).await.unwrap_err(),
            CommandError::NotConnected
        );
    }

    /// Accept TCP connections and hold them without ever answering the
    /// handshake.
    async fn spawn_silent_listener() -> (SocketAddr, Arc<Stats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::default());
        let server_stats = stats.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                server_stats.connections.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        (addr, stats)
    }

    #[tokio::test]
    async fn disconnect_returns_while_handshake_is_stalled() {
        let (addr, stats) = spawn_silent_listener().await;
        let conn = Connection::spawn(ConnectionOptions {
            connect_timeout: Duration::from_secs(30),
            ..options(addr)
        });

        timeout(Duration::from_secs(5), async {
            while stats.connections.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener should see the connect");
        assert_eq!(conn.state(), ConnectionState::Connecting);

        timeout(Duration::from_secs(1), conn.disconnect())
            .await
            .expect("disconnect should not wait for the handshake");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn stalled_handshakes_count_as_failed_attempts() {
        let (addr, stats) = spawn_silent_listener().await;
        let conn = Connection::spawn(ConnectionOptions {
            connect_timeout: Duration::from_millis(50),
            max_reconnect_attempts: 2,
            ..options(addr)
        });
        let mut events = conn.subscribe();

        let attempts = timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::ReconnectFailed { attempts }) => break attempts,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel closed: {}", e),
                }
            }
        })
        .await
        .expect("should give up within 5s");

        assert_eq!(attempts, 2);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        // The first try plus one per allowed reconnect.
        assert_eq!(stats.connections.load(Ordering::SeqCst), 3);
        conn.disconnect().await;
    }
}
