// storage/src/config/mod.rs

use crate::btree::ORDER;
use crate::transaction::IsolationLevel;
use crate::{Result, StorageError};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variables with this prefix override file settings,
/// e.g. `PAGEDB_BTREE_ORDER=64`.
pub const ENV_PREFIX: &str = "PAGEDB";

const XID_FILE: &str = "pagedb.xid";
const TABLE_EXTENSION: &str = "idb";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the xid log and one file per table.
    pub data_dir: PathBuf,
    /// Isolation level for transactions begun without an explicit one.
    pub isolation: IsolationLevel,
    /// Maximum children per index node.
    pub btree_order: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            isolation: IsolationLevel::default(),
            btree_order: ORDER,
        }
    }
}

impl EngineConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Loads defaults, then `file` if given, then `PAGEDB_*` variables.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let engine: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| match file {
                Some(path) => format!("loading engine config from {}", path.display()),
                None => "loading engine config from the environment".to_string(),
            })?;
        engine.validate()?;
        Ok(engine)
    }

    pub fn validate(&self) -> Result<()> {
        if !(3..=ORDER).contains(&self.btree_order) {
            return Err(StorageError::InvalidConfig(format!(
                "btree_order must be within 3..={}, got {}",
                ORDER, self.btree_order
            )));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(StorageError::InvalidConfig("data_dir is empty".to_string()));
        }
        Ok(())
    }

    pub fn xid_path(&self) -> PathBuf {
        self.data_dir.join(XID_FILE)
    }

    pub fn table_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.{}", name, TABLE_EXTENSION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.btree_order, 400);
        assert_eq!(config.isolation, IsolationLevel::ReadCommitted);
        config.validate().unwrap();
    }

    #[test]
    fn test_paths() {
        let config = EngineConfig::with_data_dir("/var/pagedb");
        assert_eq!(config.xid_path(), PathBuf::from("/var/pagedb/pagedb.xid"));
        assert_eq!(config.table_path("users"), PathBuf::from("/var/pagedb/users.idb"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            "data_dir = \"/tmp/pagedb\"\nisolation = \"repeatable_read\"\nbtree_order = 16\n",
        )
        .unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(
            config,
            EngineConfig {
                data_dir: PathBuf::from("/tmp/pagedb"),
                isolation: IsolationLevel::RepeatableRead,
                btree_order: 16,
            }
        );
    }

    #[test]
    fn test_load_rejects_bad_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "btree_order = 2\n").unwrap();
        assert!(EngineConfig::load(Some(&path)).is_err());
    }
}
