use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::http::protocol::ProtocolSettings;

/// Environment variable naming a YAML configuration file.
pub const CONFIG_ENV: &str = "WARDEN_CONFIG";
/// Environment variable overriding `server.listen_addr`.
pub const LISTEN_ENV: &str = "LISTEN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Number of event loops, each on its own thread.
    pub io_loops: usize,
    pub keep_alive_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            io_loops: 1,
            keep_alive_timeout_ms: 30_000,
            poll_timeout_ms: 250,
            read_buffer_size: 1536,
        }
    }
}

impl Config {
    /// Loads the file named by `WARDEN_CONFIG`, or the defaults, then applies
    /// the `LISTEN` override.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        if let Ok(listen_addr) = std::env::var(LISTEN_ENV) {
            cfg.server.listen_addr = listen_addr;
        }
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(raw)?;
        anyhow::ensure!(cfg.server.io_loops > 0, "server.io_loops must be at least 1");
        anyhow::ensure!(
            cfg.server.poll_timeout_ms > 0,
            "server.poll_timeout_ms must be at least 1"
        );
        Ok(cfg)
    }
}

impl ServerConfig {
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn protocol_settings(&self) -> ProtocolSettings {
        ProtocolSettings {
            keep_alive_timeout: self.keep_alive_timeout(),
            read_buffer_size: self.read_buffer_size,
        }
    }
}
