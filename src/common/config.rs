//! Configuration schema, defaults, and layered loading.
//!
//! Precedence: defaults < config file < environment < CLI
use anyhow::{ensure, Context, Result};
use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::server::Credentials;
use crate::transfer::ArchiveMethod;

pub const DEFAULT_PORT: u16 = 8080;
const MAX_WORKERS: usize = 1024;

pub fn config_path() -> PathBuf {
    ProjectDirs::from("", "", "oneshot")
        .map(|p| p.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("oneshot.toml"))
}

/// How session events are rendered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
    Quiet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Seconds to wait for the first connection. 0 waits forever.
    pub timeout: u64,
    /// Seconds the whole run may take. 0 disables the deadline.
    pub deadline: u64,
    /// Milliseconds open connections get to finish after the exchange.
    pub drain_timeout: u64,
    /// Request body limit in bytes. 0 is unlimited.
    pub max_body_size: u64,
    pub block_bots: bool,
    pub no_cache: bool,
    /// Expired-mode responders. 0 uses the available parallelism.
    pub workers: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            timeout: 0,
            deadline: 0,
            drain_timeout: 5_000,
            max_body_size: 0,
            block_bots: true,
            no_cache: true,
            workers: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub format: OutputFormat,
    pub compact: bool,
    /// Include received bytes in the JSON report when they went to stdout.
    pub include_body: bool,
    pub no_color: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    pub method: ArchiveMethod,
}

/// Fully resolved application configuration after all layers merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub output: OutputSettings,
    pub auth: AuthSettings,
    pub archive: ArchiveSettings,
}

impl AppConfig {
    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.server.host.trim().is_empty(),
            "Invalid config: server.host must not be empty"
        );
        ensure!(
            self.server.drain_timeout > 0,
            "Invalid config: server.drain_timeout must be > 0"
        );
        ensure!(
            self.server.workers <= MAX_WORKERS,
            "Invalid config: server.workers must be <= {MAX_WORKERS}"
        );
        if let Some(user) = &self.auth.username {
            ensure!(
                !user.contains(':'),
                "Invalid config: auth.username must not contain ':'"
            );
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let host = self.server.host.trim();
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let ip = host
            .parse()
            .with_context(|| format!("Invalid host address '{host}'"))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout)
    }

    pub fn deadline(&self) -> Option<Duration> {
        (self.server.deadline > 0).then(|| Duration::from_secs(self.server.deadline))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.server.drain_timeout)
    }

    /// Basic-auth credentials, if either half is configured.
    pub fn credentials(&self) -> Option<Credentials> {
        let username = self.auth.username.clone().filter(|u| !u.is_empty());
        let password = self.auth.password.clone().filter(|p| !p.is_empty());
        if username.is_none() && password.is_none() {
            return None;
        }
        Some(Credentials { username, password })
    }
}

/// Values supplied on the command line. `None` leaves the loaded value alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compact: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_color: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_method: Option<ArchiveMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_bots: Option<bool>,
}

/// Reads a password from the first line of `path`.
pub fn read_password_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read password file {}", path.display()))?;
    let password = content.lines().next().unwrap_or_default().to_string();
    ensure!(!password.is_empty(), "Password file {} is empty", path.display());
    Ok(password)
}

/// Loads config from defaults/file/env. `path` replaces the platform config file.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    figment_for(&path)
        .extract()
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn figment_for(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(AppConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("ONESHOT_").split("__"))
}

/// Applies runtime overrides to a loaded config.
pub fn apply_overrides(mut config: AppConfig, overrides: &ConfigOverrides) -> AppConfig {
    if let Some(host) = &overrides.host {
        config.server.host = host.clone();
    }
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(timeout) = overrides.timeout {
        config.server.timeout = timeout;
    }
    if let Some(deadline) = overrides.deadline {
        config.server.deadline = deadline;
    }
    if let Some(format) = overrides.format {
        config.output.format = format;
    }
    if let Some(compact) = overrides.compact {
        config.output.compact = compact;
    }
    if let Some(no_color) = overrides.no_color {
        config.output.no_color = no_color;
    }
    if let Some(username) = &overrides.username {
        config.auth.username = Some(username.clone());
    }
    if let Some(password) = &overrides.password {
        config.auth.password = Some(password.clone());
    }
    if let Some(method) = overrides.archive_method {
        config.archive.method = method;
    }
    if overrides.allow_bots == Some(true) {
        config.server.block_bots = false;
    }
    config
}
