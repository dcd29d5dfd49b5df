//! Pipeline configuration loaded from a TOML file.
//!
//! Every field is optional in the file; missing fields take the defaults
//! below. A missing file yields the defaults, a malformed one is an error.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::transfer::{CONNECT_TIMEOUT_SECS, HttpRangeFetcher, READ_TIMEOUT_SECS};

const APP_DIR: &str = "asset-relay";

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML or has unknown keys.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {value}. Expected {expected}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// Rejected value.
        value: String,
        /// Accepted range or shape.
        expected: &'static str,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, value: impl fmt::Display, expected: &'static str) -> Self {
        Self::Invalid {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

/// Runtime configuration for a [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Browser profiles per profile kind.
    pub max_profiles: usize,
    /// Concurrent discovery tasks; defaults to `max_profiles`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chrome_slots: Option<usize>,
    /// Concurrent download+upload tasks.
    pub transfer_slots: usize,
    /// Requeues allowed before a task is ledgered.
    pub retry_ceiling: u32,
    /// Attempts per chunk, including the first.
    pub chunk_retries: u32,
    /// Attempts per browser launch, including the first.
    pub launch_retries: u32,
    /// Fixed delay between launch attempts.
    pub launch_retry_delay_ms: u64,
    /// Hard ceiling on one discovery attempt.
    pub discovery_timeout_secs: u64,
    /// Successful uploads between batch pauses.
    pub upload_batch_size: usize,
    /// Batch pause length; 0 disables batching.
    pub upload_pause_secs: u64,
    /// Root of the per-profile working directories.
    pub profiles_dir: PathBuf,
    /// Where partial downloads are staged.
    pub temp_dir: PathBuf,
    /// Failure ledger file.
    pub ledger_path: PathBuf,
    /// Process event log file.
    pub event_log_path: PathBuf,
    /// HTTP connect timeout for range requests.
    pub connect_timeout_secs: u64,
    /// HTTP read timeout for range requests.
    pub read_timeout_secs: u64,
    /// Size of the throughput probe.
    pub probe_bytes: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let data_dir = resolve_default_data_dir();
        Self {
            max_profiles: 3,
            chrome_slots: None,
            transfer_slots: 3,
            retry_ceiling: crate::queue::DEFAULT_RETRY_CEILING,
            chunk_retries: crate::transfer::DEFAULT_CHUNK_RETRIES,
            launch_retries: crate::browser::DEFAULT_LAUNCH_RETRIES,
            launch_retry_delay_ms: 2000,
            discovery_timeout_secs: 30,
            upload_batch_size: crate::upload::DEFAULT_BATCH_SIZE,
            upload_pause_secs: 0,
            profiles_dir: data_dir.join("profiles"),
            temp_dir: std::env::temp_dir().join(APP_DIR),
            ledger_path: data_dir.join("failed_uploads.json"),
            event_log_path: data_dir.join("events.jsonl"),
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            probe_bytes: crate::transfer::DEFAULT_PROBE_BYTES,
        }
    }
}

impl RelayConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, returning defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// Read, parse and validation failures.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        debug!(path = %path.display(), "loading config file");
        Self::from_toml_str(&raw, path)
    }

    /// Loads the default config path, or defaults when none resolves.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn load_default() -> Result<Self, ConfigError> {
        match resolve_default_config_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Checks every field against its accepted range.
    ///
    /// # Errors
    ///
    /// The first out-of-range field as [`ConfigError::Invalid`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("max_profiles", self.max_profiles, 1, 16, "range 1..=16")?;
        if let Some(slots) = self.chrome_slots {
            check_range("chrome_slots", slots, 1, 16, "range 1..=16")?;
        }
        check_range("transfer_slots", self.transfer_slots, 1, 32, "range 1..=32")?;
        check_range("retry_ceiling", self.retry_ceiling, 0, 10, "range 0..=10")?;
        check_range("chunk_retries", self.chunk_retries, 1, 10, "range 1..=10")?;
        check_range("launch_retries", self.launch_retries, 1, 10, "range 1..=10")?;
        check_range(
            "launch_retry_delay_ms",
            self.launch_retry_delay_ms,
            0,
            60_000,
            "range 0..=60000",
        )?;
        check_range(
            "discovery_timeout_secs",
            self.discovery_timeout_secs,
            1,
            600,
            "range 1..=600",
        )?;
        if self.upload_batch_size == 0 {
            return Err(ConfigError::invalid("upload_batch_size", 0, "a value of at least 1"));
        }
        check_range("upload_pause_secs", self.upload_pause_secs, 0, 3600, "range 0..=3600")?;
        check_range(
            "connect_timeout_secs",
            self.connect_timeout_secs,
            1,
            3600,
            "range 1..=3600",
        )?;
        check_range("read_timeout_secs", self.read_timeout_secs, 1, 3600, "range 1..=3600")?;
        if self.probe_bytes == 0 {
            return Err(ConfigError::invalid("probe_bytes", 0, "a value of at least 1"));
        }
        Ok(())
    }

    /// Effective discovery slot count.
    #[must_use]
    pub fn chrome_slots(&self) -> usize {
        self.chrome_slots.unwrap_or(self.max_profiles)
    }

    /// Delay between launch attempts.
    #[must_use]
    pub fn launch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.launch_retry_delay_ms)
    }

    /// Discovery deadline.
    #[must_use]
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    /// Batch pause length.
    #[must_use]
    pub fn upload_pause(&self) -> Duration {
        Duration::from_secs(self.upload_pause_secs)
    }

    /// HTTP connect timeout for range requests.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Per-request HTTP timeout for range requests.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Builds the reqwest range fetcher with the configured timeouts.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend cannot initialise.
    pub fn http_fetcher(&self) -> Result<HttpRangeFetcher, reqwest::Error> {
        debug!(
            connect_timeout_secs = self.connect_timeout_secs,
            read_timeout_secs = self.read_timeout_secs,
            "building range fetcher"
        );
        HttpRangeFetcher::with_timeouts(self.connect_timeout(), self.read_timeout())
    }

    /// Renders the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Serialization failure.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn check_range<T>(
    field: &'static str,
    value: T,
    min: T,
    max: T,
    expected: &'static str,
) -> Result<(), ConfigError>
where
    T: PartialOrd + fmt::Display,
{
    if value < min || value > max {
        return Err(ConfigError::invalid(field, value, expected));
    }
    Ok(())
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/asset-relay/config.toml`
/// 2. `$HOME/.config/asset-relay/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    config_path_from(env_var_non_empty_os("XDG_CONFIG_HOME"), env_var_non_empty_os("HOME"))
}

fn config_path_from(xdg_config_home: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    if let Some(xdg) = xdg_config_home {
        return Some(PathBuf::from(xdg).join(APP_DIR).join("config.toml"));
    }
    let home = home?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml"),
    )
}

fn resolve_default_data_dir() -> PathBuf {
    if let Some(xdg) = env_var_non_empty_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join(APP_DIR);
    }
    match env_var_non_empty_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local").join("share").join(APP_DIR),
        None => PathBuf::from(".").join(APP_DIR),
    }
}

fn env_var_non_empty_os(name: &str) -> Option<OsString> {
    let value = std::env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chrome_slots(), 3);
        assert_eq!(config.retry_ceiling, 2);
        assert_eq!(config.upload_batch_size, 5);
        assert_eq!(config.upload_pause(), Duration::ZERO);
    }

    #[test]
    fn test_timeouts_feed_the_fetcher() {
        let config = RelayConfig {
            connect_timeout_secs: 5,
            read_timeout_secs: 42,
            ..RelayConfig::default()
        };
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.read_timeout(), Duration::from_secs(42));
        config.http_fetcher().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = RelayConfig::from_toml_str(
            "max_profiles = 4\ntransfer_slots = 8\nupload_pause_secs = 60\n",
            Path::new("config.toml"),
        )
        .unwrap();
        assert_eq!(config.max_profiles, 4);
        assert_eq!(config.chrome_slots(), 4);
        assert_eq!(config.transfer_slots, 8);
        assert_eq!(config.upload_pause(), Duration::from_secs(60));
        assert_eq!(config.launch_retries, 3);
    }

    #[test]
    fn test_out_of_range_value_rejected() {
        let err = RelayConfig::from_toml_str("transfer_slots = 0", Path::new("c.toml")).unwrap_err();
        match err {
            ConfigError::Invalid { field, value, .. } => {
                assert_eq!(field, "transfer_slots");
                assert_eq!(value, "0");
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_key_is_parse_error() {
        let err = RelayConfig::from_toml_str("concurrency = 3", Path::new("c.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.max_profiles, RelayConfig::default().max_profiles);
    }

    #[test]
    fn test_show_output_parses_back() {
        let config = RelayConfig {
            chrome_slots: Some(2),
            ..RelayConfig::default()
        };
        let rendered = config.to_toml_string().unwrap();
        let parsed = RelayConfig::from_toml_str(&rendered, Path::new("c.toml")).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_config_path_priority() {
        assert_eq!(
            config_path_from(Some("/xdg".into()), Some("/home/u".into())),
            Some(PathBuf::from("/xdg/asset-relay/config.toml"))
        );
        assert_eq!(
            config_path_from(None, Some("/home/u".into())),
            Some(PathBuf::from("/home/u/.config/asset-relay/config.toml"))
        );
        assert_eq!(config_path_from(None, None), None);
    }
}
