//! edctl - editor control plane
//!
//! `edctl serve` runs the control plane: the HTTP API and the WebSocket
//! endpoint, both on loopback, backed by the commands declared in the
//! config file. The other subcommands are clients of a running server.

use anyhow::{bail, Context};
use clap::{Parser as ClapParser, Subcommand};
use editor_control::{
    client::{ConnectionEvent, ConnectionState, EditorControlClient},
    config::{default_config_path, Config},
    devtools::DevToolsTracker,
    dispatch::Dispatcher,
    host::ProcessHost,
    instance::{FileIdStore, HostMetadata, InstanceRegistry},
    server::ServerHandle,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// edctl - drive a code editor from scripts and agents
#[derive(ClapParser, Debug)]
#[command(name = "edctl", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML)
    #[arg(long, global = true, env = "EDCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Host of the control plane (overrides config)
    #[arg(long, global = true)]
    host: Option<String>,

    /// HTTP API port (overrides config)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// WebSocket port (overrides config)
    #[arg(long, global = true)]
    ws_port: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control plane
    Serve {
        /// Workspace folder to report (repeatable). Defaults to the current directory.
        #[arg(long = "workspace")]
        workspaces: Vec<PathBuf>,
    },

    /// Print the instance record
    Instance,

    /// List the commands the host can run
    Commands,

    /// Run a host command
    Exec {
        /// Command name
        command: String,

        /// Arguments, each parsed as JSON (falls back to a plain string)
        args: Vec<String>,

        /// Send over the WebSocket instead of HTTP
        #[arg(long)]
        ws: bool,
    },

    /// Toggle the developer tools
    ToggleDevtools {
        /// Send over the WebSocket instead of HTTP
        #[arg(long)]
        ws: bool,
    },

    /// Run a script in the developer tools console
    DevtoolsExec {
        /// Script source
        script: String,
    },

    /// Stream pushed state changes until interrupted
    Watch,

    /// Write a config file with the current settings
    InitConfig {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    apply_overrides(&cli, &mut config);

    match cli.command {
        Commands::Serve { workspaces } => run_serve(config, workspaces).await,
        Commands::Instance => {
            let client = EditorControlClient::new(config.client)?;
            print_json(&client.instance_info().await?)
        }
        Commands::Commands => {
            let client = EditorControlClient::new(config.client)?;
            for name in client.list_commands().await? {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Exec { command, args, ws } => run_exec(config, command, args, ws).await,
        Commands::ToggleDevtools { ws } => run_toggle(config, ws).await,
        Commands::DevtoolsExec { script } => {
            let client = EditorControlClient::new(config.client)?;
            println!("{}", client.execute_in_devtools(&script).await?);
            Ok(())
        }
        Commands::Watch => run_watch(config).await,
        Commands::InitConfig { force } => {
            config
                .init(&config_path, force)
                .with_context(|| format!("writing {}", config_path.display()))?;
            println!("{}", config_path.display());
            Ok(())
        }
    }
}

/// Tracing goes to stderr; stdout carries command output.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "editor_control=info,edctl=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Command-line flags win over the file for both the server and client
/// sides, so `--port` points `serve` and `exec` at the same place.
fn apply_overrides(cli: &Cli, config: &mut Config) {
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
        config.client.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
        config.client.api_port = port;
    }
    if let Some(ws_port) = cli.ws_port {
        config.server.ws_port = ws_port;
        config.client.ws_port = ws_port;
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse a CLI argument as JSON, keeping it as a string when it isn't.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn file_uri(path: &std::path::Path) -> String {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", path.display())
}

// ── Server ─────────────────────────────────────────────────────────

async fn run_serve(config: Config, workspaces: Vec<PathBuf>) -> anyhow::Result<()> {
    tracing::info!("edctl server starting");

    let workspaces = if workspaces.is_empty() {
        vec![std::env::current_dir().context("reading current directory")?]
    } else {
        workspaces
    };
    let folders = workspaces.iter().map(|p| file_uri(p)).collect();

    let id_store = FileIdStore::new(
        config
            .instance
            .id_file
            .clone()
            .unwrap_or_else(FileIdStore::default_path),
    );
    let metadata = HostMetadata::local(&config.instance.app_name, config.instance.machine_id.clone())
        .with_workspace_folders(folders);
    let host = Arc::new(ProcessHost::new(config.commands.clone()));
    let dispatcher = Dispatcher::new(
        host,
        InstanceRegistry::create(metadata, &id_store),
        DevToolsTracker::default(),
        config.devtools.open_delay(),
    );
    let heartbeat = dispatcher
        .registry()
        .spawn_heartbeat(config.instance.heartbeat_interval());

    let mut server = ServerHandle::start(&config.server, dispatcher)
        .await
        .context("starting control plane")?;
    tracing::info!(
        instance = %server.dispatcher().instance().id,
        api = %server.api_addr(),
        ws = %server.ws_addr(),
        "edctl server ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    tracing::info!("received Ctrl+C");

    heartbeat.stop();
    server.stop().await;
    tracing::info!("edctl server exiting");
    Ok(())
}

// ── Client ─────────────────────────────────────────────────────────

async fn connect_ws(client: &EditorControlClient) -> anyhow::Result<editor_control::client::Connection> {
    let conn = client.connect().await.context("reaching control plane")?;
    let deadline = client.config().connect_timeout();
    if tokio::time::timeout(deadline, conn.wait_for(ConnectionState::Connected))
        .await
        .is_err()
    {
        conn.disconnect().await;
        bail!("websocket connection to {} timed out", client.config().ws_url());
    }
    Ok(conn)
}

async fn run_exec(config: Config, command: String, args: Vec<String>, ws: bool) -> anyhow::Result<()> {
    let client = EditorControlClient::new(config.client)?;
    let args: Vec<Value> = args.iter().map(|a| parse_arg(a)).collect();

    let result = if ws {
        let conn = connect_ws(&client).await?;
        let outcome = conn.execute_command(&command, args).await;
        conn.disconnect().await;
        outcome.with_context(|| format!("running '{}'", command))?
    } else {
        client
            .execute_command(&command, args)
            .await
            .with_context(|| format!("running '{}'", command))?
    };
    print_json(&result)
}

async fn run_toggle(config: Config, ws: bool) -> anyhow::Result<()> {
    let client = EditorControlClient::new(config.client)?;
    let open = if ws {
        let conn = connect_ws(&client).await?;
        let outcome = conn.toggle_devtools().await;
        conn.disconnect().await;
        outcome.context("toggling developer tools")?
    } else {
        client
            .toggle_devtools()
            .await
            .context("toggling developer tools")?
    };
    println!("{}", if open { "open" } else { "closed" });
    Ok(())
}

async fn run_watch(config: Config) -> anyhow::Result<()> {
    let client = EditorControlClient::new(config.client)?;
    let conn = client.connect().await.context("reaching control plane")?;
    let mut events = conn.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(ConnectionEvent::InstanceInfo(instance)) => print_json(&instance)?,
                    Ok(ConnectionEvent::DevToolsChanged(open)) => {
                        println!("devtools {}", if open { "open" } else { "closed" });
                    }
                    Ok(ConnectionEvent::ReconnectFailed { attempts }) => {
                        bail!("gave up after {} reconnect attempts", attempts);
                    }
                    Ok(other) => tracing::info!(event = ?other, "connection event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    conn.disconnect().await;
    Ok(())
}
