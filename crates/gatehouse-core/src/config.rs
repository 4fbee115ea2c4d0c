//! Gateway configuration.
//!
//! A single TOML file plus environment overrides. Only operational knobs
//! live here; per-tenant state is under the state directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The config file is not valid TOML.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Path that failed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// The merged configuration is invalid.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Root of the persisted state tree.
    pub state_dir: PathBuf,
    /// Listen address for the combined WebSocket + HTTP listener.
    pub listen: SocketAddr,
    /// Authentication settings.
    pub auth: AuthConfig,
    /// Control-plane HTTP settings.
    pub control_plane: ControlPlaneConfig,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Backup object-store settings.
    pub backup: BackupConfig,
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Shared secret granting admin scope on the WebSocket and `/v1`
    /// surfaces. Unset means only tenant tokens are accepted.
    pub admin_token: Option<String>,
}

/// Control-plane settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlPlaneConfig {
    /// Shared secret for `X-Control-Plane-Token`. Unset denies all
    /// control-plane requests.
    pub token: Option<String>,
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Whether schedulers start automatically.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Backup object-store settings.
///
/// Endpoint, region, and path-style are pass-through for S3-compatible
/// stores; the in-tree filesystem store only uses `dir` and `prefix`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    /// Directory for the filesystem-backed store. Defaults to
    /// `{state_dir}/backups` when unset.
    pub dir: Option<PathBuf>,
    /// Key prefix for archive objects.
    pub prefix: String,
    /// Remote endpoint URL (pass-through).
    pub endpoint: Option<String>,
    /// Remote region (pass-through).
    pub region: Option<String>,
    /// Bucket name (pass-through).
    pub bucket: Option<String>,
    /// Use path-style addressing (pass-through).
    pub force_path_style: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: None,
            prefix: "backups".to_string(),
            endpoint: None,
            region: None,
            bucket: None,
            force_path_style: false,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/gatehouse"),
            listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
            auth: AuthConfig::default(),
            control_plane: ControlPlaneConfig::default(),
            scheduler: SchedulerConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration: defaults, then the TOML file (if any), then
    /// environment overrides, then validation.
    ///
    /// Recognized environment variables: `GATEHOUSE_STATE_DIR`,
    /// `GATEHOUSE_LISTEN`, `GATEHOUSE_ADMIN_TOKEN`,
    /// `GATEHOUSE_CONTROL_PLANE_TOKEN`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on unreadable or malformed files, an
    /// unparseable `GATEHOUSE_LISTEN`, or a failed validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: p.to_path_buf(),
                    source,
                })?
            },
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(dir) = std::env::var("GATEHOUSE_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Ok(listen) = std::env::var("GATEHOUSE_LISTEN") {
            self.listen = listen.parse().map_err(|_| {
                ConfigError::Invalid(format!("GATEHOUSE_LISTEN is not a socket address: {listen}"))
            })?;
        }
        if let Ok(token) = std::env::var("GATEHOUSE_ADMIN_TOKEN") {
            self.auth.admin_token = Some(token);
        }
        if let Ok(token) = std::env::var("GATEHOUSE_CONTROL_PLANE_TOKEN") {
            self.control_plane.token = Some(token);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("state_dir must not be empty".into()));
        }
        if let Some(token) = &self.auth.admin_token
            && token.len() < 16
        {
            return Err(ConfigError::Invalid(
                "auth.admin_token must be at least 16 characters".into(),
            ));
        }
        if let Some(token) = &self.control_plane.token
            && token.len() < 16
        {
            return Err(ConfigError::Invalid(
                "control_plane.token must be at least 16 characters".into(),
            ));
        }
        Ok(())
    }

    /// Layout rooted at the configured state directory.
    #[must_use]
    pub fn layout(&self) -> crate::paths::StateLayout {
        crate::paths::StateLayout::new(&self.state_dir)
    }

    /// Effective backup directory for the filesystem store.
    #[must_use]
    pub fn backup_dir(&self) -> PathBuf {
        self.backup
            .dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("backups"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert!(config.scheduler.enabled);
        assert_eq!(config.backup.prefix, "backups");
    }

    #[test]
    fn parses_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
state_dir = "/tmp/gh-test"
listen = "127.0.0.1:9000"

[control_plane]
token = "0123456789abcdef"

[backup]
prefix = "snapshots"
"#
        )
        .unwrap();
        let config = GatewayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/gh-test"));
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.backup.prefix, "snapshots");
        assert!(config.scheduler.enabled);
    }

    #[test]
    fn short_admin_token_rejected() {
        let config = GatewayConfig {
            auth: AuthConfig {
                admin_token: Some("short".into()),
            },
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backup_dir_defaults_under_state_dir() {
        let config = GatewayConfig::default();
        assert_eq!(config.backup_dir(), config.state_dir.join("backups"));
    }
}
