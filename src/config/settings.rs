//! Bridge configuration
//!
//! Every section and field is optional; anything missing falls back to the
//! defaults below.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::pty::{CommandSpec, TerminalSize};

/// Configuration directory and file name, relative to the working directory
pub const CONFIG_DIR: &str = ".gobox";
pub const CONFIG_FILE: &str = "config.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// WebSocket server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9000,
        }
    }
}

/// Terminal session settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalSettings {
    /// Program to run; `{target}` is replaced by the session target
    pub program: String,
    /// Program arguments; `{target}` is replaced by the session target
    pub args: Vec<String>,
    /// Terminal columns
    pub cols: u16,
    /// Terminal rows
    pub rows: u16,
    /// Working directory for the process
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            args: ["exec", "-it", "{target}", "/bin/sh"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cols: 80,
            rows: 24,
            cwd: None,
            env: HashMap::new(),
        }
    }
}

impl TerminalSettings {
    /// Command template for new sessions
    pub fn command(&self) -> CommandSpec {
        let mut command = CommandSpec::new(&self.program).with_args(self.args.iter().cloned());
        command.cwd = self.cwd.clone();
        command.env = self.env.clone();
        command
    }

    /// Initial terminal size
    pub fn size(&self) -> TerminalSize {
        TerminalSize::new(self.cols, self.rows)
    }
}

/// Repository fetcher settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchSettings {
    /// Base URL of the GitHub REST API
    pub api_base: String,
    /// User-Agent header sent with every request
    pub user_agent: String,
    /// Branch used when none is given
    pub default_branch: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            user_agent: format!("gobox/{}", env!("CARGO_PKG_VERSION")),
            default_branch: "main".to_string(),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerSettings,
    pub terminal: TerminalSettings,
    pub fetch: FetchSettings,
}

impl BridgeConfig {
    /// Default config file location under `base`
    pub fn default_path(base: &Path) -> PathBuf {
        base.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Load configuration from `path`, or defaults when the file is missing
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}
