use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::client::connection::Backoff;

/// Top-level config, loaded from TOML. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub instance: InstanceConfig,
    pub devtools: DevToolsConfig,
    pub client: ClientConfig,
    /// Host commands backed by external programs.
    pub commands: Vec<CommandSpec>,
}

/// Where the HTTP and WebSocket listeners bind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host. Must resolve to a loopback address.
    pub host: String,
    /// HTTP API port. 0 picks a free port.
    pub port: u16,
    /// WebSocket port. 0 picks a free port.
    pub ws_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            ws_port: 3001,
        }
    }
}

/// Identity of the hosted editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub app_name: String,
    /// Defaults to the system hostname.
    pub machine_id: Option<String>,
    pub heartbeat_interval_secs: u64,
    /// Where the stable instance id is kept.
    pub id_file: Option<std::path::PathBuf>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: "Visual Studio Code".to_string(),
            machine_id: None,
            heartbeat_interval_secs: 30,
            id_file: None,
        }
    }
}

impl InstanceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevToolsConfig {
    /// Settle time after opening the panel before running a script in it.
    pub open_delay_ms: u64,
}

impl Default for DevToolsConfig {
    fn default() -> Self {
        Self {
            open_delay_ms: 1000,
        }
    }
}

impl DevToolsConfig {
    pub fn open_delay(&self) -> Duration {
        Duration::from_millis(self.open_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// How a remote client reaches the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub api_port: u16,
    pub ws_port: u16,
    pub request_timeout_ms: u64,
    /// Deadline for opening the WebSocket, handshake included.
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffKind,
    /// Upper bound on the delay when `backoff = "exponential"`.
    pub max_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            api_port: 3000,
            ws_port: 3001,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 10,
            backoff: BackoffKind::Fixed,
            max_backoff_ms: 60_000,
        }
    }
}

impl ClientConfig {
    pub fn api_base_url(&self) -> String {
        format!("http://{}:{}/api", self.host, self.api_port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.ws_port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn backoff(&self) -> Backoff {
        let interval = Duration::from_millis(self.reconnect_interval_ms);
        match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed(interval),
            BackoffKind::Exponential => Backoff::Exponential {
                initial: interval,
                max: Duration::from_millis(self.max_backoff_ms),
            },
        }
    }
}

/// A host command backed by an external program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load config, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    /// Write this config as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        let write = |path: &Path| -> std::io::Result<()> {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(path, contents.as_bytes())
        };
        write(path).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Write a starter config to `path`. An existing file is left alone
    /// unless `overwrite` is set.
    pub fn init(&self, path: &Path, overwrite: bool) -> Result<(), ConfigError> {
        if path.exists() && !overwrite {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        self.validate()?;
        self.save(path)?;
        tracing::info!(path = %path.display(), "wrote config");
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for spec in &self.commands {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::Invalid("command name must not be empty".into()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "command '{}' is defined more than once",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

/// `$XDG_CONFIG_HOME/editor-control/config.toml`.
pub fn default_config_path() -> std::path::PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("editor-control")
        .join("config.toml")
}

/// Errors that can occur when loading or writing config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(std::path::PathBuf, std::io::Error),
    ParseFailed(std::path::PathBuf, toml::de::Error),
    WriteFailed(std::path::PathBuf, std::io::Error),
    SerializeFailed(toml::ser::Error),
    AlreadyExists(std::path::PathBuf),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::WriteFailed(path, e) => {
                write!(f, "Failed to write config {}: {}", path.display(), e)
            }
            Self::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
            Self::AlreadyExists(path) => {
                write!(f, "Config {} already exists (use --force to replace it)", path.display())
            }
            Self::Invalid(detail) => write!(f, "Invalid config: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.ws_port, 3001);
        assert_eq!(config.client.max_reconnect_attempts, 10);
        assert_eq!(config.client.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.client.connect_timeout(), Duration::from_secs(5));
        assert!(config.commands.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [server]
            host = "127.0.0.1"
            port = 4000
            ws_port = 4001

            [instance]
            app_name = "Cursor"
            machine_id = "box-1"

            [devtools]
            open_delay_ms = 250

            [client]
            host = "127.0.0.1"
            reconnect_interval_ms = 100
            max_reconnect_attempts = 3
            backoff = "exponential"
            max_backoff_ms = 800

            [[commands]]
            name = "files.save"
            program = "true"

            [[commands]]
            name = "say"
            program = "echo"
            args = ["hi"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.instance.app_name, "Cursor");
        assert_eq!(config.instance.machine_id.as_deref(), Some("box-1"));
        assert_eq!(config.devtools.open_delay(), Duration::from_millis(250));
        assert_eq!(config.client.max_reconnect_attempts, 3);
        assert_eq!(
            config.client.backoff(),
            Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_millis(800),
            }
        );
        assert_eq!(config.commands.len(), 2);
        assert_eq!(config.commands[1].args, vec!["hi".to_string()]);
    }

    #[test]
    fn default_backoff_is_fixed() {
        let config = ClientConfig::default();
        assert_eq!(config.backoff(), Backoff::Fixed(Duration::from_secs(5)));
    }

    #[test]
    fn urls_are_built_from_host_and_ports() {
        let config = ClientConfig::default();
        assert_eq!(config.api_base_url(), "http://localhost:3000/api");
        assert_eq!(config.ws_url(), "ws://localhost:3001");
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn init_writes_a_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");
        let mut config = Config::default();
        config.server.port = 4100;
        config.client.connect_timeout_ms = 750;
        config.commands.push(CommandSpec {
            name: "x".into(),
            program: "true".into(),
            args: vec![],
        });
        config.init(&path, false).unwrap();
        let loaded = Config::load(&path).unwrap().unwrap();
        assert_eq!(loaded.server.port, 4100);
        assert_eq!(loaded.client.connect_timeout(), Duration::from_millis(750));
        assert_eq!(loaded.commands, config.commands);
    }

    #[test]
    fn init_keeps_existing_file_unless_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 4200\n").unwrap();

        let err = Config::default().init(&path, false).unwrap_err();
        assert!(matches!(err, ConfigError::AlreadyExists(_)));
        assert_eq!(Config::load(&path).unwrap().unwrap().server.port, 4200);

        Config::default().init(&path, true).unwrap();
        assert_eq!(Config::load(&path).unwrap().unwrap().server.port, 3000);
    }

    #[test]
    fn duplicate_command_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[[commands]]\nname = \"a\"\nprogram = \"true\"\n[[commands]]\nname = \"a\"\nprogram = \"false\"\n",
        )
        .unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
    }
}
