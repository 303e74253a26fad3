//! The genesis document.
//!
//! A single canonical object that seeds every subsystem. The document's
//! *chain context* is the hash of its canonical encoding; it domain-separates
//! every signature made on this chain. Descriptors embedded in the document
//! itself are signed with the unbound base contexts, since they predate the
//! chain context by construction.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::encoding;
use crate::epochtime::EpochTime;
use crate::errors::{ChainError, ChainResult};
use crate::mkvs::{KeyValueRead, Tree};
use crate::registry;
use crate::roothash;
use crate::scheduler;
use crate::staking;

const CHAIN_CONTEXT_KEY: &[u8] = b"c/chain_context";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpochTimeGenesis {
    /// Consensus blocks per epoch.
    pub interval: u64,
}

impl Default for EpochTimeGenesis {
    fn default() -> Self {
        Self { interval: 100 }
    }
}

/// Parameters for the external BFT engine; opaque to the application beyond
/// schema validation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusGenesis {
    pub backend: String,
    pub timeout_commit_ms: u64,
}

impl Default for ConsensusGenesis {
    fn default() -> Self {
        Self {
            backend: "tendermint".to_string(),
            timeout_commit_ms: 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyManagerStatus {
    pub id: registry::Namespace,
    pub is_initialized: bool,
    pub checksum: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyManagerGenesis {
    pub statuses: Vec<KeyManagerStatus>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoothashGenesis {
    pub params: roothash::ConsensusParameters,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerGenesis {
    pub params: scheduler::ConsensusParameters,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub chain_id: String,
    /// Genesis time, seconds since the epoch.
    pub time: u64,
    pub height: u64,
    /// Epoch at which the network deterministically halts.
    pub halt_epoch: EpochTime,
    pub epoch_time: EpochTimeGenesis,
    pub consensus: ConsensusGenesis,
    pub registry: registry::state::Genesis,
    pub roothash: RoothashGenesis,
    pub staking: staking::state::Genesis,
    pub keymanager: KeyManagerGenesis,
    pub scheduler: SchedulerGenesis,
}

impl Document {
    /// The chain context: hash of the canonical encoding of the document.
    pub fn chain_context(&self) -> ChainResult<String> {
        Ok(encoding::hash_of(self)?.to_string())
    }

    pub fn sanity_check(&self) -> ChainResult<()> {
        if self.chain_id.is_empty() {
            return Err(ChainError::Config("genesis: empty chain id".into()));
        }
        if self.epoch_time.interval == 0 {
            return Err(ChainError::Config("genesis: zero epoch interval".into()));
        }
        let epoch = self.height / self.epoch_time.interval;
        if self.halt_epoch < epoch {
            return Err(ChainError::Config(
                "genesis: halt epoch before genesis epoch".into(),
            ));
        }

        self.staking.sanity_check(epoch)?;

        for signed in &self.registry.entities {
            signed.verify(registry::sigctx::REGISTER_ENTITY)?;
        }
        let entity_registered = |id| {
            self.registry
                .entities
                .iter()
                .any(|signed| signed.entity.id == id)
        };
        for signed in &self.registry.nodes {
            signed.verify(registry::sigctx::REGISTER_NODE)?;
            if !entity_registered(signed.node.entity_id) {
                return Err(ChainError::Config(format!(
                    "genesis: node {} references unknown entity",
                    signed.node.id
                )));
            }
        }
        for signed in &self.registry.runtimes {
            signed.verify(registry::sigctx::REGISTER_RUNTIME)?;
            if !entity_registered(signed.runtime.entity_id) {
                return Err(ChainError::Config(format!(
                    "genesis: runtime {} references unknown entity",
                    signed.runtime.id
                )));
            }
        }
        for suspended in &self.registry.suspended_runtimes {
            if !self
                .registry
                .runtimes
                .iter()
                .any(|signed| signed.runtime.id == *suspended)
            {
                return Err(ChainError::Config(format!(
                    "genesis: suspended runtime {suspended} not in registry"
                )));
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|err| ChainError::Config(format!("genesis: unable to parse document: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = serde_json::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("genesis: unable to encode document: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }
}

pub fn chain_context(store: &impl KeyValueRead) -> ChainResult<String> {
    let raw = store
        .get(CHAIN_CONTEXT_KEY)
        .ok_or_else(|| ChainError::Fatal("consensus: chain context missing".into()))?;
    encoding::from_slice(&raw)
}

pub fn set_chain_context(tree: &mut Tree, context: &str) -> ChainResult<()> {
    tree.insert(CHAIN_CONTEXT_KEY, encoding::to_vec(&context.to_string())?);
    Ok(())
}
