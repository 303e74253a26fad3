//! Roothash protocol: runtime blocks, committee commitments, discrepancy
//! detection and round finalization.

pub mod commitment;
pub mod round;

use serde::{Deserialize, Serialize};

use crate::crypto::{ContextSignature, Hash};
use crate::encoding;
use crate::errors::ChainResult;
use crate::gas::GasCosts;
use crate::registry::{Namespace, Runtime};

pub const MODULE: &str = "roothash";

pub mod method {
    pub const MERGE_COMMIT: &str = "roothash.MergeCommit";
}

pub mod op {
    pub const MERGE_COMMIT: &str = "merge_commit";
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HeaderType {
    Normal,
    EpochTransition,
    RoundFailed,
    Suspended,
}

/// A message from a runtime to the consensus layer, carried in a block
/// header. Currently required to be empty on every committed header.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeMessage {
    pub method: String,
    pub body: Vec<u8>,
}

/// A runtime block header. `previous_hash` of each non-genesis block is the
/// encoded hash of the prior block's header; rounds are strictly monotone
/// within a namespace.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub namespace: Namespace,
    pub round: u64,
    pub timestamp: u64,
    pub header_type: HeaderType,
    pub previous_hash: Hash,
    pub io_root: Hash,
    pub state_root: Hash,
    pub storage_signatures: Vec<ContextSignature>,
    pub messages: Vec<RuntimeMessage>,
}

impl Header {
    pub fn encoded_hash(&self) -> ChainResult<Hash> {
        encoding::hash_of(self)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
}

impl Block {
    /// The genesis block of a newly registered runtime.
    pub fn new_genesis_block(runtime: &Runtime, timestamp: u64) -> Block {
        Block {
            header: Header {
                version: 0,
                namespace: runtime.id,
                round: runtime.genesis.round,
                timestamp,
                header_type: HeaderType::Normal,
                previous_hash: Hash::default(),
                io_root: Hash::empty(),
                state_root: runtime.genesis.state_root,
                storage_signatures: runtime.genesis.storage_receipts.clone(),
                messages: Vec::new(),
            },
        }
    }

    /// A protocol-generated successor block carrying no compute results:
    /// epoch transitions and failed rounds. The state root is preserved.
    pub fn new_empty_block(child_of: &Block, timestamp: u64, header_type: HeaderType) -> ChainResult<Block> {
        Ok(Block {
            header: Header {
                version: 0,
                namespace: child_of.header.namespace,
                round: child_of.header.round + 1,
                timestamp,
                header_type,
                previous_hash: child_of.header.encoded_hash()?,
                io_root: Hash::empty(),
                state_root: child_of.header.state_root,
                storage_signatures: Vec::new(),
                messages: Vec::new(),
            },
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusParameters {
    pub gas_costs: GasCosts,
}

impl Default for ConsensusParameters {
    fn default() -> Self {
        Self {
            gas_costs: GasCosts::new(),
        }
    }
}

// Events.

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinalizedEvent {
    pub runtime_id: Namespace,
    pub round: u64,
}

/// Signals backup workers that a computation must be re-executed: the
/// disputed input root and the block header the backup computation is based
/// on.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscrepancyDetectedEvent {
    pub runtime_id: Namespace,
    pub io_root: Hash,
    pub block_header: Header,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeDiscrepancyEvent {
    pub runtime_id: Namespace,
    pub round: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundFailedEvent {
    pub runtime_id: Namespace,
    pub round: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEvent {
    pub runtime_id: Namespace,
    pub round: u64,
    pub message: RuntimeMessage,
}

pub mod event_kind {
    pub const FINALIZED: &str = "finalized";
    pub const DISCREPANCY_DETECTED: &str = "discrepancy_detected";
    pub const MERGE_DISCREPANCY: &str = "merge_discrepancy";
    pub const ROUND_FAILED: &str = "round_failed";
    pub const MESSAGE: &str = "message";
}
