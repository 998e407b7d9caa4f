//! Persisted server settings: credential table, sandbox root and bind address.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

use crate::config::{DEFAULT_AUTH_PASS, DEFAULT_AUTH_USER, DEFAULT_INTERFACE, DEFAULT_PORT};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    pub users: HashMap<String, String>,
    pub base_directory: String,
    pub interface: String,
    pub port: u16,
    /// True while the generated default configuration is in effect.
    pub show_notification: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            users: HashMap::new(),
            base_directory: String::new(),
            interface: DEFAULT_INTERFACE.to_string(),
            port: DEFAULT_PORT,
            show_notification: true,
        }
    }
}

impl Settings {
    /// Settings written on first run: one seeded admin login, rooted at the home directory.
    pub fn first_run() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            users: HashMap::from([(DEFAULT_AUTH_USER.to_string(), DEFAULT_AUTH_PASS.to_string())]),
            base_directory: home.to_string_lossy().into_owned(),
            ..Self::default()
        }
    }

    /// Literal, case-sensitive match of a username/password pair.
    pub fn has_credentials(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|expected| expected == password)
    }

    /// `Interface` and `Port` as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = parse_interface(&self.interface)?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Maps the interface setting to an IP; `*`, `+` and empty mean all interfaces.
pub fn parse_interface(interface: &str) -> Result<IpAddr, ConfigError> {
    match interface.trim() {
        "" | "*" | "+" => Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        "localhost" => Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        other => other
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidInterface(other.to_string())),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Json(serde_json::Error),
    InvalidInterface(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "settings io error: {err}"),
            ConfigError::Json(err) => write!(f, "settings parse error: {err}"),
            ConfigError::InvalidInterface(value) => write!(f, "invalid interface: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err)
    }
}

/// File-backed settings, re-read on every call to [`SettingsStore::load`].
#[derive(Clone, Debug)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// A store backed by the JSON file at `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Location of the settings file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the settings file, writing first-run defaults when it does not exist.
    pub async fn load(&self) -> Result<Settings, ConfigError> {
        if fs::metadata(&self.path).await.is_err() {
            warn!(path = %self.path.display(), "config file not found, generating default config");
            self.save(&Settings::first_run()).await?;
        }
        let raw = fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Writes pretty-printed JSON, creating the parent directory.
    pub async fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let pretty = serde_json::to_vec_pretty(settings)?;
        fs::write(&self.path, pretty).await?;
        Ok(())
    }
}
