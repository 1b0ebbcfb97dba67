use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::lock::DPKG_FRONTEND_LOCK;

pub const DEFAULT_PATH: &str = "/etc/pop-transition/transition-system.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Which message bus to use. The session bus is only for testing.
#[derive(Debug, Default, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    #[default]
    System,
    Session,
}

impl Bus {
    pub fn builder(self) -> zbus::Result<zbus::connection::Builder<'static>> {
        match self {
            Bus::System => zbus::connection::Builder::system(),
            Bus::Session => zbus::connection::Builder::session(),
        }
    }

    pub async fn connect(self) -> zbus::Result<zbus::Connection> {
        match self {
            Bus::System => zbus::Connection::system().await,
            Bus::Session => zbus::Connection::session().await,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub lock_path: PathBuf,
    pub enforce_polkit: bool,
    pub authorization_timeout_secs: u64,
    pub refresh_index: bool,
    pub bus: Bus,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from(DPKG_FRONTEND_LOCK),
            enforce_polkit: true,
            authorization_timeout_secs: 600,
            refresh_index: true,
            bus: Bus::System,
        }
    }
}

impl ServiceConfig {
    pub fn authorization_timeout(&self) -> Duration {
        Duration::from_secs(self.authorization_timeout_secs)
    }

    /// `Ok(None)` when the file does not exist.
    pub fn read(path: impl AsRef<Path>) -> Result<Option<Self>, ConfigError> {
        read_toml(path.as_ref())
    }

    /// Reads `path`, falling back to defaults when it is missing or broken.
    pub fn load(path: impl AsRef<Path>) -> Self {
        match Self::read(path) {
            Ok(config) => config.unwrap_or_default(),
            Err(e) => {
                tracing::error!(target: "TransitionSystem::Config", "{e}, using defaults");
                Self::default()
            }
        }
    }
}

/// Shared by the daemon and client configuration files.
pub fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    toml::from_str(&text)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}
