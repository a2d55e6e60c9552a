//! CV-007: Engine configuration.
//!
//! An optional TOML file sets the worker count, signature policy and
//! keystore directories. Command-line flags override file values.

use super::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Trusted-key directories, loaded in this order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeystoreConfig {
    pub system: PathBuf,
    pub user: PathBuf,
    pub local: PathBuf,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            system: PathBuf::from("/usr/share/convergent/trustedkeys"),
            user: home.join(".convergent/trustedkeys"),
            local: PathBuf::from(".convergent/trustedkeys"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Worker pool size for graph walks.
    pub workers: usize,
    /// Require a verified `.sig` companion for every module, local ones included.
    pub verify_modules: bool,
    pub keystore: KeystoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            verify_modules: false,
            keystore: KeystoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read a TOML file. Missing fields take their defaults; a missing file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cv007_defaults() {
        let c = EngineConfig::default();
        assert!(c.workers >= 1);
        assert!(!c.verify_modules);
        assert_eq!(
            c.keystore.system,
            PathBuf::from("/usr/share/convergent/trustedkeys")
        );
        assert!(c.keystore.user.ends_with(".convergent/trustedkeys"));
        assert_eq!(c.keystore.local, PathBuf::from(".convergent/trustedkeys"));
    }

    #[test]
    fn test_cv007_partial_file_keeps_defaults() {
        let c = EngineConfig::parse(
            r#"
workers = 3
[keystore]
local = "keys"
"#,
        )
        .unwrap();
        assert_eq!(c.workers, 3);
        assert_eq!(c.keystore.local, PathBuf::from("keys"));
        assert_eq!(
            c.keystore.system,
            PathBuf::from("/usr/share/convergent/trustedkeys")
        );
    }

    #[test]
    fn test_cv007_rejects_zero_workers_and_unknown_keys() {
        assert!(EngineConfig::parse("workers = 0").is_err());
        let err = EngineConfig::parse("wrokers = 2").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_cv007_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_cv007_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convergent.toml");
        fs::write(&path, "verify_modules = true\n").unwrap();
        assert!(EngineConfig::load(&path).unwrap().verify_modules);
    }
}
