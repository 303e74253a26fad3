//! Node-facing configuration.
//!
//! The consensus application itself is configured entirely by the genesis
//! document; this file covers the host process around it (data locations,
//! identity key, genesis path), loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub identity_key_path: PathBuf,
    pub genesis_path: PathBuf,
    /// Committed state versions to retain for past-height queries.
    #[serde(default = "default_state_history")]
    pub state_history: usize,
}

fn default_state_history() -> usize {
    64
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            identity_key_path: PathBuf::from("./keys/identity.toml"),
            genesis_path: PathBuf::from("./genesis.json"),
            state_history: default_state_history(),
        }
    }
}
