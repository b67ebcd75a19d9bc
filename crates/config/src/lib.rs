//! Configuration for fastdbfs.
//!
//! Values are layered with `figment`, later sources winning:
//!
//! 1. built-in defaults,
//! 2. a TOML file (`~/.config/fastdbfs/config.toml` unless `--config` names another),
//! 3. environment variables prefixed `FASTDBFS_`, with `__` separating nested keys
//!    (`FASTDBFS_TRANSFER__CHUNK_SIZE=65536`).
//!
//! ```toml
//! default_profile = "prod"
//!
//! [profiles.prod]
//! kind = "dbfs"
//! host = "https://adb-1234.azuredatabricks.net"
//! token = "dapi..."
//!
//! [profiles.scratch]
//! kind = "local"
//! root = "/tmp/fastdbfs"
//!
//! [transfer]
//! chunk_size = 1048576
//! max_retries = 10
//! ```

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest block the DBFS API accepts in one append.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;
pub const ENV_PREFIX: &str = "FASTDBFS_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_profile: String,
    pub profiles: BTreeMap<String, Profile>,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: "DEFAULT".to_string(),
            profiles: BTreeMap::new(),
            transfer: TransferConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Where a profile's files live.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Profile {
    Dbfs {
        host: String,
        token: String,
        #[serde(default)]
        cluster_id: Option<String>,
    },
    /// A local directory standing in for a remote store.
    Local { root: PathBuf },
}
// Hand-written so the token never ends up in logs.
impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dbfs { host, cluster_id, .. } => f
                .debug_struct("Dbfs")
                .field("host", host)
                .field("token", &"<redacted>")
                .field("cluster_id", cluster_id)
                .finish(),
            Self::Local { root } => f.debug_struct("Local").field("root", root).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Zero disables the limit.
    pub listing_timeout_secs: u64,
}
impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: MAX_CHUNK_SIZE,
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            listing_timeout_secs: 60,
        }
    }
}
impl TransferConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn listing_timeout(&self) -> Option<Duration> {
        (self.listing_timeout_secs > 0).then(|| Duration::from_secs(self.listing_timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub level: String,
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl Config {
    /// `~/.config/fastdbfs/config.toml` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "fastdbfs").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, or from `path` when given. An
    /// explicitly named file must exist; the default one is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()));
        let figment = match path {
            Some(path) => {
                if !path.is_file() {
                    exn::bail!(ErrorKind::Invalid(format!("no configuration file at {}", path.display())));
                }
                figment.merge(Toml::file_exact(path))
            },
            None => match Self::default_path() {
                Some(default) => figment.merge(Toml::file(default)),
                None => figment,
            },
        };
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate from an already-layered figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(profiles = config.profiles.len(), "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let transfer = &self.transfer;
        if transfer.chunk_size == 0 || transfer.chunk_size > MAX_CHUNK_SIZE {
            exn::bail!(ErrorKind::Invalid(format!(
                "transfer.chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {}",
                transfer.chunk_size
            )));
        }
        if transfer.initial_backoff_ms > transfer.max_backoff_ms {
            exn::bail!(ErrorKind::Invalid(
                "transfer.initial_backoff_ms exceeds transfer.max_backoff_ms".to_string()
            ));
        }
        for (name, profile) in &self.profiles {
            match profile {
                Profile::Dbfs { host, token, .. } => {
                    if !(host.starts_with("https://") || host.starts_with("http://")) {
                        exn::bail!(ErrorKind::Invalid(format!("profile `{name}`: host must be an http(s) URL")));
                    }
                    if token.trim().is_empty() {
                        exn::bail!(ErrorKind::Invalid(format!("profile `{name}`: token is empty")));
                    }
                },
                Profile::Local { root } => {
                    if !root.is_absolute() {
                        exn::bail!(ErrorKind::Invalid(format!("profile `{name}`: root must be absolute")));
                    }
                },
            }
        }
        Ok(())
    }

    /// Look up a profile, falling back to `default_profile`.
    ///
    /// Environment variable keys arrive lowercased, so a case-insensitive
    /// match is tried when there is no exact one.
    pub fn profile(&self, name: Option<&str>) -> Result<(&str, &Profile)> {
        let wanted = name.unwrap_or(&self.default_profile);
        self.profiles
            .get_key_value(wanted)
            .or_else(|| self.profiles.iter().find(|(key, _)| key.eq_ignore_ascii_case(wanted)))
            .map(|(key, profile)| (key.as_str(), profile))
            .ok_or_else(|| exn::Exn::from(ErrorKind::UnknownProfile(wanted.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    const SAMPLE: &str = r#"
        default_profile = "prod"

        [profiles.prod]
        kind = "dbfs"
        host = "https://adb-1234.azuredatabricks.net"
        token = "dapi-secret"
        cluster_id = "0101-abc"

        [profiles.scratch]
        kind = "local"
        root = "/tmp/fastdbfs"

        [transfer]
        chunk_size = 65536
    "#;

    #[test]
    fn test_defaults() {
        let config = Config::from_figment(Figment::from(Serialized::defaults(Config::default()))).unwrap();
        assert_eq!(config.default_profile, "DEFAULT");
        assert_eq!(config.transfer, TransferConfig::default());
        assert_eq!(config.transfer.listing_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_file_then_env() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", SAMPLE)?;
            jail.set_env("FASTDBFS_TRANSFER__MAX_RETRIES", "3");
            jail.set_env("FASTDBFS_LOGGING__LEVEL", "debug");
            let config = Config::load(Some(Path::new("config.toml"))).unwrap();

            assert_eq!(config.transfer.chunk_size, 65536);
            assert_eq!(config.transfer.max_retries, 3);
            assert_eq!(config.logging.level, "debug");
            let (name, profile) = config.profile(None).unwrap();
            assert_eq!(name, "prod");
            assert!(matches!(profile, Profile::Dbfs { cluster_id: Some(id), .. } if id == "0101-abc"));
            let (_, scratch) = config.profile(Some("scratch")).unwrap();
            assert_eq!(scratch, &Profile::Local { root: PathBuf::from("/tmp/fastdbfs") });
            Ok(())
        });
    }

    #[test]
    fn test_profile_from_env_is_found_case_insensitively() {
        Jail::expect_with(|jail| {
            jail.create_file("empty.toml", "")?;
            jail.set_env("FASTDBFS_PROFILES__DEFAULT__KIND", "local");
            jail.set_env("FASTDBFS_PROFILES__DEFAULT__ROOT", "/srv/data");
            let config = Config::load(Some(Path::new("empty.toml"))).unwrap();
            let (_, profile) = config.profile(None).unwrap();
            assert_eq!(profile, &Profile::Local { root: PathBuf::from("/srv/data") });
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[test]
    fn test_unknown_profile() {
        let config = Config::default();
        let err = config.profile(Some("staging")).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownProfile(name) if name == "staging"));
    }

    #[rstest]
    #[case("[transfer]\nchunk_size = 0")]
    #[case("[transfer]\nchunk_size = 2097152")]
    #[case("[transfer]\ninitial_backoff_ms = 5000\nmax_backoff_ms = 10")]
    #[case("[profiles.x]\nkind = \"dbfs\"\nhost = \"adb.example.com\"\ntoken = \"t\"")]
    #[case("[profiles.x]\nkind = \"dbfs\"\nhost = \"https://adb.example.com\"\ntoken = \" \"")]
    #[case("[profiles.x]\nkind = \"local\"\nroot = \"relative/dir\"")]
    fn test_invalid(#[case] toml: &str) {
        let figment = Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(toml));
        let err = Config::from_figment(figment).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[rstest]
    #[case("[profiles.x]\nkind = \"s3\"\nbucket = \"b\"")]
    #[case("[transfer]\nchunk_size = \"big\"")]
    fn test_unparseable(#[case] toml: &str) {
        let figment = Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(toml));
        let err = Config::from_figment(figment).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Load));
    }

    #[test]
    fn test_debug_hides_token() {
        let profile = Profile::Dbfs {
            host: "https://h".to_string(),
            token: "dapi-secret".to_string(),
            cluster_id: None,
        };
        assert!(!format!("{profile:?}").contains("dapi-secret"));
    }
}
