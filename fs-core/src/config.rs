//! Lifecycle configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::handle::CloneFlags;

/// Settings shared by every handle in an arena
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Capacity of an inode attribute cache when one is built
    pub inode_cache_capacity: usize,
    /// Flags used by [`HandleArena::clone_default`](crate::HandleArena::clone_default)
    pub default_clone_flags: CloneFlags,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            inode_cache_capacity: 64,
            default_clone_flags: CloneFlags::all(),
        }
    }
}

impl LifecycleConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        log::debug!("CONFIG: loaded {}", path.display());
        Self::from_json_str(&json)
    }

    /// Serialize as pretty JSON
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.inode_cache_capacity == 0 {
            return Err(Error::Config("inode_cache_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = LifecycleConfig::default();
        assert_eq!(config.inode_cache_capacity, 64);
        assert_eq!(config.default_clone_flags, CloneFlags::all());
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = LifecycleConfig::from_json_str(r#"{ "inode_cache_capacity": 8 }"#).unwrap();
        assert_eq!(config.inode_cache_capacity, 8);
        assert_eq!(config.default_clone_flags, CloneFlags::all());
    }

    #[test]
    fn test_rejects_zero_capacity_and_garbage() {
        assert!(matches!(
            LifecycleConfig::from_json_str(r#"{ "inode_cache_capacity": 0 }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            LifecycleConfig::from_json_str("not json"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let config = LifecycleConfig {
            inode_cache_capacity: 16,
            default_clone_flags: CloneFlags::BLOCK_BITMAP | CloneFlags::INODE_BITMAP,
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_json_pretty().unwrap().as_bytes()).unwrap();

        let loaded = LifecycleConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded, config);

        assert!(matches!(
            LifecycleConfig::from_json_file(file.path().with_extension("missing")),
            Err(Error::Io(_))
        ));
    }
}
