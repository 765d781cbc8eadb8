//! Process-wide settings.
//!
//! Settings are read once at startup from `settings.toml`. A missing file is
//! created with defaults so the next run sees the same values.
//!
//! # Location
//!
//! `$DOMAINFORGE_SETTINGS` if set, otherwise `settings.toml` in the platform
//! configuration directory (e.g. `~/.config/domainforge/settings.toml`).

use chrono::Duration;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::store::{BincodeCodec, JsonCodec, RecordCodec};

/// Environment variable overriding the settings file location.
pub const SETTINGS_ENV: &str = "DOMAINFORGE_SETTINGS";

/// Largest accepted expiry margin (one day). Tokens never live that long.
pub const MAX_EXPIRY_MARGIN_SECS: u64 = 24 * 60 * 60;

/// Error type for settings operations.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access settings at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value parsed but is outside its accepted range.
    #[error("invalid settings at {path:?}: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("configuration directory not available")]
    ConfigDirUnavailable,
}

/// Encoding of persisted credential records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordEncoding {
    /// Human-readable JSON.
    #[default]
    Json,

    /// Compact bincode.
    Binary,
}

impl RecordEncoding {
    /// The codec implementing this encoding.
    pub fn codec(self) -> Box<dyn RecordCodec> {
        match self {
            Self::Json => Box::new(JsonCodec),
            Self::Binary => Box::new(BincodeCodec),
        }
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Encoding of credential records.
    #[serde(default)]
    pub encoding: RecordEncoding,

    /// Root directory for all persisted state.
    pub storage_root: PathBuf,

    /// Logging level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Tokens expiring within this many seconds are treated as expired.
    #[serde(default = "default_expiry_margin_secs")]
    pub expiry_margin_secs: u64,

    /// Upper bound on waiting for the user to grant consent.
    #[serde(default = "default_consent_timeout_secs")]
    pub consent_timeout_secs: u64,

    /// Loopback port for the consent redirect; 0 picks a free port.
    #[serde(default)]
    pub callback_port: u16,

    /// Path to `client_secrets.json`; defaults to one under `storage_root`.
    #[serde(default)]
    pub client_secrets: Option<PathBuf>,

    /// Path this configuration was loaded from.
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_expiry_margin_secs() -> u64 {
    300
}

fn default_consent_timeout_secs() -> u64 {
    300
}

impl Settings {
    /// Default settings with an explicit storage root.
    pub fn with_root(storage_root: PathBuf) -> Self {
        Self {
            encoding: RecordEncoding::default(),
            storage_root,
            log_level: default_log_level(),
            expiry_margin_secs: default_expiry_margin_secs(),
            consent_timeout_secs: default_consent_timeout_secs(),
            callback_port: 0,
            client_secrets: None,
            path: PathBuf::new(),
        }
    }

    /// Default storage root: the executable's directory, falling back to the
    /// platform data directory.
    pub fn default_storage_root() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .or_else(|| project_dirs().map(|d| d.data_dir().to_path_buf()))
            .unwrap_or_else(|| PathBuf::from(".domainforge"))
    }

    /// Get the default settings path.
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        if let Some(path) = std::env::var_os(SETTINGS_ENV) {
            return Ok(PathBuf::from(path));
        }
        let dirs = project_dirs().ok_or(SettingsError::ConfigDirUnavailable)?;
        Ok(dirs.config_dir().join("settings.toml"))
    }

    /// Load settings from the default location, creating defaults if absent.
    pub fn load() -> Result<Self, SettingsError> {
        let path = Self::default_path()?;
        Self::load_from_path(&path)
    }

    /// Load settings from a specific path, creating defaults if absent.
    pub fn load_from_path(path: &Path) -> Result<Self, SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut settings = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(io_err)?;
            toml::from_str(&contents).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            let settings = Self::with_root(Self::default_storage_root());
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
            std::fs::write(path, toml::to_string_pretty(&settings)?).map_err(io_err)?;
            tracing::info!("Created default settings at {:?}", path);
            settings
        };

        if settings.expiry_margin_secs > MAX_EXPIRY_MARGIN_SECS {
            return Err(SettingsError::Invalid {
                path: path.to_path_buf(),
                message: format!(
                    "expiry_margin_secs must be at most {}, got {}",
                    MAX_EXPIRY_MARGIN_SECS, settings.expiry_margin_secs
                ),
            });
        }

        settings.path = path.to_path_buf();
        Ok(settings)
    }

    /// Expiry safety margin as a duration, capped at
    /// [`MAX_EXPIRY_MARGIN_SECS`].
    pub fn expiry_margin(&self) -> Duration {
        let secs = self.expiry_margin_secs.min(MAX_EXPIRY_MARGIN_SECS);
        i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(Duration::zero)
    }

    /// Consent wait bound as a duration.
    pub fn consent_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.consent_timeout_secs)
    }

    /// Path of the client-secret bundle.
    pub fn client_secrets_path(&self) -> PathBuf {
        self.client_secrets
            .clone()
            .unwrap_or_else(|| self.storage_root.join("client_secrets.json"))
    }

    /// Path of the domain registry file.
    pub fn registry_path(&self) -> PathBuf {
        self.storage_root.join("domains.json")
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "raibid-labs", "domainforge")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_settings_are_created_with_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/settings.toml");

        let settings = Settings::load_from_path(&path).unwrap();

        assert!(path.exists());
        assert_eq!(settings.encoding, RecordEncoding::Json);
        assert_eq!(settings.storage_root, Settings::default_storage_root());
        assert_eq!(settings.path, path);

        let reloaded = Settings::load_from_path(&path).unwrap();
        assert_eq!(reloaded, settings);
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.toml");
        std::fs::write(
            &path,
            "encoding = \"binary\"\nstorage_root = \"/var/lib/domainforge\"\n",
        )
        .unwrap();

        let settings = Settings::load_from_path(&path).unwrap();
        assert_eq!(settings.encoding, RecordEncoding::Binary);
        assert_eq!(settings.storage_root, PathBuf::from("/var/lib/domainforge"));
        assert_eq!(settings.expiry_margin_secs, 300);
        assert_eq!(settings.log_level, "info");
        assert_eq!(
            settings.client_secrets_path(),
            PathBuf::from("/var/lib/domainforge/client_secrets.json")
        );
    }

    #[test]
    fn test_invalid_settings_fail_to_parse() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.toml");
        std::fs::write(&path, "encoding = \"xml\"\nstorage_root = \"/x\"\n").unwrap();

        assert!(matches!(
            Settings::load_from_path(&path),
            Err(SettingsError::Parse { .. })
        ));
    }

    #[test]
    fn test_out_of_range_expiry_margin_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.toml");
        std::fs::write(&path, "storage_root = \"/x\"\nexpiry_margin_secs = 10000000000000000\n")
            .unwrap();

        assert!(matches!(
            Settings::load_from_path(&path),
            Err(SettingsError::Invalid { .. })
        ));
    }

    #[test]
    fn test_expiry_margin_is_capped() {
        let mut settings = Settings::with_root(PathBuf::from("/x"));
        assert_eq!(settings.expiry_margin(), Duration::minutes(5));

        settings.expiry_margin_secs = u64::MAX;
        assert_eq!(settings.expiry_margin(), Duration::days(1));
    }

    #[test]
    fn test_codec_follows_encoding() {
        assert_eq!(RecordEncoding::Json.codec().extension(), "json");
        assert_eq!(RecordEncoding::Binary.codec().extension(), "bin");
    }
}
