//! The editor host seen from the control plane.
//!
//! Command execution is an opaque, possibly slow, possibly failing call.
//! Nothing here retries.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::CommandSpec;

/// Host command that shows or hides the developer tools panel.
pub const TOGGLE_DEVTOOLS: &str = "workbench.action.toggleDevTools";
/// Host command that opens developer tools for webviews.
pub const OPEN_WEBVIEW_DEVTOOLS: &str = "workbench.action.webview.openDeveloperTools";

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("command '{0}' not found")]
    UnknownCommand(String),
    #[error("{0}")]
    Failed(String),
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

/// Capability supplied by the editor host.
#[async_trait]
pub trait CommandHost: Send + Sync + 'static {
    /// Run a named command with positional arguments.
    async fn execute(&self, command: &str, args: Vec<Value>) -> Result<Value, HostError>;

    /// Names of every command the host can run.
    async fn list_commands(&self) -> Result<Vec<String>, HostError>;
}

/// Host that maps command names to external programs.
///
/// Arguments are appended to the configured program arguments: strings as
/// they are, anything else JSON-encoded. Stdout is parsed as JSON when it
/// can be, otherwise returned as a string. The developer tools commands are
/// always available and succeed as no-ops unless configured.
pub struct ProcessHost {
    commands: BTreeMap<String, CommandSpec>,
}

impl ProcessHost {
    pub fn new(specs: impl IntoIterator<Item = CommandSpec>) -> Self {
        let commands = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();
        Self { commands }
    }

    fn is_builtin(command: &str) -> bool {
        command == TOGGLE_DEVTOOLS || command == OPEN_WEBVIEW_DEVTOOLS
    }
}

#[async_trait]
impl CommandHost for ProcessHost {
    async fn execute(&self, command: &str, args: Vec<Value>) -> Result<Value, HostError> {
        let Some(spec) = self.commands.get(command) else {
            if Self::is_builtin(command) {
                tracing::debug!(command, "builtin command has no program configured");
                return Ok(Value::Null);
            }
            return Err(HostError::UnknownCommand(command.to_string()));
        };

        let extra = args.into_iter().map(|arg| match arg {
            Value::String(s) => s,
            other => other.to_string(),
        });

        tracing::debug!(command, program = %spec.program, "running host command");
        let output = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .args(extra)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| HostError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("'{}' exited with {}", spec.program, output.status)
            } else {
                stderr
            };
            return Err(HostError::Failed(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
    }

    async fn list_commands(&self) -> Result<Vec<String>, HostError> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        for builtin in [TOGGLE_DEVTOOLS, OPEN_WEBVIEW_DEVTOOLS] {
            if !self.commands.contains_key(builtin) {
                names.push(builtin.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
