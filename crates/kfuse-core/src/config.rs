//! Bridge configuration, loaded from TOML.
//!
//! ```toml
//! mount_options = ["allow_root", "no_syncwrites", "xtimes"]
//! iosize = 65536
//! contract_violation = "report"
//!
//! [daemon]
//! uid = 501
//! gid = 20
//!
//! [log]
//! level = "debug"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use kfuse_logging::LogConfig;
use kfuse_types::{Gid, Uid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{Credential, MountFlags};

/// Largest I/O size accepted; matches the 2 GiB clip of the rounding rule.
pub const IOSIZE_CEILING: u32 = 1 << 31;
/// Smallest I/O size accepted.
pub const IOSIZE_FLOOR: u32 = 512;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What to do when a caller misuses the handle table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractPolicy {
    /// Abort: continuing could double-release a daemon handle.
    #[default]
    Panic,
    /// Return `FuseError::ContractViolation` and keep going.
    Report,
}

/// Mount options as spelled in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountOption {
    AllowOther,
    AllowRoot,
    KeepCache,
    DirectIo,
    NoAttrcache,
    NoSynconclose,
    NoSyncwrites,
    NegativeVncache,
    NoVncache,
    Xtimes,
    Sparse,
    NoAppledouble,
}

impl MountOption {
    pub fn flag(self) -> MountFlags {
        match self {
            MountOption::AllowOther => MountFlags::ALLOW_OTHER,
            MountOption::AllowRoot => MountFlags::ALLOW_ROOT,
            MountOption::KeepCache => MountFlags::KEEP_CACHE,
            MountOption::DirectIo => MountFlags::DIRECT_IO,
            MountOption::NoAttrcache => MountFlags::NO_ATTRCACHE,
            MountOption::NoSynconclose => MountFlags::NO_SYNCONCLOSE,
            MountOption::NoSyncwrites => MountFlags::NO_SYNCWRITES,
            MountOption::NegativeVncache => MountFlags::NEGATIVE_VNCACHE,
            MountOption::NoVncache => MountFlags::NO_VNCACHE,
            MountOption::Xtimes => MountFlags::XTIMES,
            MountOption::Sparse => MountFlags::SPARSE,
            MountOption::NoAppledouble => MountFlags::NO_APPLEDOUBLE,
        }
    }
}

/// Credential of the process that mounted the filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub uid: u32,
    pub gid: u32,
    /// Real ids; default to the effective ones.
    #[serde(default)]
    pub ruid: Option<u32>,
    #[serde(default)]
    pub rgid: Option<u32>,
}

impl CredentialConfig {
    pub fn credential(&self) -> Credential {
        Credential::new(Uid::from(self.uid), Gid::from(self.gid)).with_real(
            Uid::from(self.ruid.unwrap_or(self.uid)),
            Gid::from(self.rgid.unwrap_or(self.gid)),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub mount_options: Vec<MountOption>,

    #[serde(default)]
    pub daemon: CredentialConfig,

    /// Requested I/O size; rounded up to a power of two and clamped into
    /// `[min_iosize, max_iosize]`.
    #[serde(default = "default_iosize")]
    pub iosize: u32,

    #[serde(default = "default_min_iosize")]
    pub min_iosize: u32,

    #[serde(default = "default_max_iosize")]
    pub max_iosize: u32,

    /// Resolution attribute deadlines are truncated to, in nanoseconds.
    #[serde(default = "default_clock_granularity_ns")]
    pub clock_granularity_ns: u64,

    #[serde(default)]
    pub contract_violation: ContractPolicy,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_iosize() -> u32 {
    64 * 1024
}

fn default_min_iosize() -> u32 {
    4096
}

fn default_max_iosize() -> u32 {
    32 * 1024 * 1024
}

fn default_clock_granularity_ns() -> u64 {
    1_000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mount_options: Vec::new(),
            daemon: CredentialConfig::default(),
            iosize: default_iosize(),
            min_iosize: default_min_iosize(),
            max_iosize: default_max_iosize(),
            clock_granularity_ns: default_clock_granularity_ns(),
            contract_violation: ContractPolicy::default(),
            log: LogConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: BridgeConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, v) in [("min_iosize", self.min_iosize), ("max_iosize", self.max_iosize)] {
            if !v.is_power_of_two() || v < IOSIZE_FLOOR || v > IOSIZE_CEILING {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a power of two in [{IOSIZE_FLOOR}, {IOSIZE_CEILING}], got {v}"
                )));
            }
        }
        if self.min_iosize > self.max_iosize {
            return Err(ConfigError::Invalid(format!(
                "min_iosize {} exceeds max_iosize {}",
                self.min_iosize, self.max_iosize
            )));
        }
        if self.clock_granularity_ns == 0 || self.clock_granularity_ns > 1_000_000_000 {
            return Err(ConfigError::Invalid(format!(
                "clock_granularity_ns must be in [1, 1000000000], got {}",
                self.clock_granularity_ns
            )));
        }
        let flags = self.mount_flags();
        if flags.contains(MountFlags::ALLOW_OTHER | MountFlags::ALLOW_ROOT) {
            return Err(ConfigError::Invalid(
                "allow_other and allow_root are mutually exclusive".into(),
            ));
        }
        if flags.contains(MountFlags::NO_VNCACHE | MountFlags::NEGATIVE_VNCACHE) {
            return Err(ConfigError::Invalid(
                "negative_vncache requires the name cache (drop no_vncache)".into(),
            ));
        }
        Ok(())
    }

    pub fn mount_flags(&self) -> MountFlags {
        self.mount_options
            .iter()
            .fold(MountFlags::empty(), |acc, opt| acc | opt.flag())
    }

    pub fn clock_granularity(&self) -> Duration {
        Duration::from_nanos(self.clock_granularity_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = BridgeConfig::from_toml_str("").unwrap();
        assert!(cfg.mount_options.is_empty());
        assert_eq!(cfg.iosize, 64 * 1024);
        assert_eq!(cfg.contract_violation, ContractPolicy::Panic);
        assert_eq!(cfg.daemon.credential(), Credential::new(Uid::ROOT, Gid::from(0)));
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn test_full_config() {
        let cfg = BridgeConfig::from_toml_str(
            r#"
            mount_options = ["allow_root", "no_syncwrites", "xtimes"]
            iosize = 100000
            contract_violation = "report"
            clock_granularity_ns = 1000000

            [daemon]
            uid = 501
            gid = 20
            ruid = 0

            [log]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.mount_flags(),
            MountFlags::ALLOW_ROOT | MountFlags::NO_SYNCWRITES | MountFlags::XTIMES
        );
        assert_eq!(cfg.contract_violation, ContractPolicy::Report);
        assert_eq!(cfg.clock_granularity(), Duration::from_millis(1));
        let cred = cfg.daemon.credential();
        assert_eq!(cred.uid, Uid::from(501));
        assert_eq!(cred.ruid, Uid::ROOT);
        assert_eq!(cred.rgid, Gid::from(20));
        assert_eq!(cfg.log.level, "debug");
    }

    #[test]
    fn test_unknown_mount_option_rejected() {
        let err = BridgeConfig::from_toml_str(r#"mount_options = ["turbo"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_allow_other_and_root_exclusive() {
        let err =
            BridgeConfig::from_toml_str(r#"mount_options = ["allow_other", "allow_root"]"#)
                .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_iosize_bounds_validated() {
        let err = BridgeConfig::from_toml_str("min_iosize = 1000").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = BridgeConfig::from_toml_str("min_iosize = 8192\nmax_iosize = 4096").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_granularity_rejected() {
        let err = BridgeConfig::from_toml_str("clock_granularity_ns = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = BridgeConfig::load("/nonexistent/kfuse.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
