//! Settings document and the typed application configuration read from it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use meshkit_core::i18n::DEFAULT_FALLBACK_LANGUAGE;
use meshkit_core::value::{deep_merge, get_path, remove_path, set_path};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::bus::config::QueueConfig;
use crate::network::NetworkConfig;
use crate::remote::ServiceEntry;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config root must be a JSON object")]
    NotObject,
    #[error("invalid value at `{path}`: {source}")]
    Invalid {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// A JSON settings document addressed by dot paths (`queue.main.brokers`).
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    root: Value,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: Value::Object(serde_json::Map::new()),
        }
    }
}

impl Settings {
    /// Wraps a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotObject`] if `root` is not an object.
    pub fn from_value(root: Value) -> Result<Self, ConfigError> {
        if root.is_object() {
            Ok(Self { root })
        } else {
            Err(ConfigError::NotObject)
        }
    }

    /// Reads a JSON settings file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not JSON, or its root
    /// is not an object.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let root = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_value(root)
    }

    /// Deserializes the value at `path`, or `None` if nothing is set there.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the value does not fit `T`.
    pub fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ConfigError> {
        get_path(&self.root, path)
            .map(|value| {
                T::deserialize(value).map_err(|source| ConfigError::Invalid {
                    path: path.to_string(),
                    source,
                })
            })
            .transpose()
    }

    /// Like [`Settings::get`], falling back to `default` when unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a value is set but does not fit `T`.
    pub fn get_or<T: DeserializeOwned>(&self, path: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.get(path)?.unwrap_or(default))
    }

    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        set_path(&mut self.root, path, value.into());
    }

    #[must_use]
    pub fn has(&self, path: &str) -> bool {
        get_path(&self.root, path).is_some()
    }

    /// Removes the value at `path`; `true` if something was removed.
    pub fn delete(&mut self, path: &str) -> bool {
        remove_path(&mut self.root, path).is_some()
    }

    /// Deep-merges `other` over this document.
    #[must_use]
    pub fn merge(mut self, other: Value) -> Self {
        deep_merge(&mut self.root, other);
        self
    }

    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.root
    }
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// Typed application configuration. Every field has a default so an empty
/// settings document yields a runnable service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Identity written into every outbound envelope.
    pub service_id: String,
    /// Environment tag (`local`, `development`, ...) used by the service
    /// directory to resolve hosts and ports.
    pub env: String,
    pub http: NetworkConfig,
    /// Broker clusters by name. `None` runs without a message bus.
    pub queue: Option<QueueConfig>,
    pub services: BTreeMap<String, ServiceEntry>,
    /// Timeout for cross-service calls.
    pub call_timeout_ms: u64,
    pub i18n: I18nConfig,
    pub logging: LoggingConfig,
    /// Upper bound on running shutdown callbacks.
    pub shutdown_timeout_ms: u64,
    /// Grace window between a broker consumer crash and process exit.
    pub crash_exit_delay_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_id: "unknown".to_string(),
            env: "development".to_string(),
            http: NetworkConfig::default(),
            queue: None,
            services: BTreeMap::new(),
            call_timeout_ms: 30_000,
            i18n: I18nConfig::default(),
            logging: LoggingConfig::default(),
            shutdown_timeout_ms: 3_000,
            crash_exit_delay_ms: 1_000,
        }
    }
}

impl AppConfig {
    /// Reads the whole settings document as an [`AppConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any section has the wrong shape.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Self::deserialize(settings.as_value()).map_err(|source| ConfigError::Invalid {
            path: String::new(),
            source,
        })
    }

    /// Name of the health record owned by the HTTP server.
    #[must_use]
    pub fn http_record(&self) -> String {
        format!("{}:http", self.service_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct I18nConfig {
    /// Directory holding `<lng>/translation.json` catalogs.
    pub locales_dir: PathBuf,
    pub fallback_language: String,
    /// HTML-escape interpolated values.
    pub escape_values: bool,
}

impl Default for I18nConfig {
    fn default() -> Self {
        Self {
            locales_dir: PathBuf::from("locales"),
            fallback_language: DEFAULT_FALLBACK_LANGUAGE.to_string(),
            escape_values: true,
        }
    }
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
