//! Client config load/save for `~/.homelift/config.yaml`.
//! Every field is optional; accessors fall back to the documented defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

pub use crate::error::ConfigError;

/// Environment variable overriding `api.base_url`.
pub const API_URL_ENV: &str = "HOMELIFT_API_URL";

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api";
const DEFAULT_REFRESH_PATH: &str = "/user/token/refresh/";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOGIN_ROUTE: &str = "/login";
const DEFAULT_ADMIN_LOGIN_ROUTE: &str = "/admin/login";
const DEFAULT_NOTIFICATION_PORT: u16 = 8000;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;
const DEFAULT_DEDUP_WINDOW_MS: u64 = 2000;

/// API section (base_url, refresh_path, timeout_secs).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ApiSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Session section (path of the persisted session file).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SessionSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Login surfaces used after a forced logout.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RoutesSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_login: Option<String>,
}

/// Notification channel section (host, port, reconnect and dedup timing).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct NotificationsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_initial_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_max_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_window_ms: Option<u64>,
}

/// Full config file.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub routes: RoutesSection,
    #[serde(default)]
    pub notifications: NotificationsSection,
}

impl Config {
    /// API base origin; all request paths are relative to it.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let raw = self.api.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
            url: raw.to_string(),
            source,
        })
    }

    pub fn refresh_path(&self) -> &str {
        self.api.refresh_path.as_deref().unwrap_or(DEFAULT_REFRESH_PATH)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    pub fn login_route(&self) -> &str {
        self.routes.login.as_deref().unwrap_or(DEFAULT_LOGIN_ROUTE)
    }

    pub fn admin_login_route(&self) -> &str {
        self.routes
            .admin_login
            .as_deref()
            .unwrap_or(DEFAULT_ADMIN_LOGIN_ROUTE)
    }

    /// Session file path: `session.path` or `~/.homelift/session.json`.
    pub fn session_path(&self) -> Option<PathBuf> {
        match &self.session.path {
            Some(p) => Some(PathBuf::from(p)),
            None => Some(home_dir()?.join(".homelift").join("session.json")),
        }
    }

    pub fn notification_port(&self) -> u16 {
        self.notifications.port.unwrap_or(DEFAULT_NOTIFICATION_PORT)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(
            self.notifications
                .reconnect_initial_ms
                .unwrap_or(DEFAULT_RECONNECT_INITIAL_MS),
        )
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(
            self.notifications
                .reconnect_max_ms
                .unwrap_or(DEFAULT_RECONNECT_MAX_MS),
        )
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(
            self.notifications
                .dedup_window_ms
                .unwrap_or(DEFAULT_DEDUP_WINDOW_MS),
        )
    }

    /// Apply `HOMELIFT_API_URL` if set.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api.base_url = Some(url);
            }
        }
        self
    }
}

/// Returns the default config file path: `~/.homelift/config.yaml` (platform-specific).
pub fn default_config_path() -> Option<PathBuf> {
    let home = home_dir()?;
    Some(home.join(".homelift").join("config.yaml"))
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[cfg(not(any(unix, windows)))]
fn home_dir() -> Option<PathBuf> {
    None
}

/// Load config from a YAML file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Load config if the file exists, defaults otherwise.
pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        load(path)
    } else {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        Ok(Config::default())
    }
}

/// Save config to a YAML file. Creates parent directory if missing.
pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}
