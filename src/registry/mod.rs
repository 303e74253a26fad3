//! Registry state machine: entity, node and runtime descriptors.

pub mod state;
pub mod transactions;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{ContextSignature, Hash, PublicKey};
use crate::encoding;
use crate::epochtime::EpochTime;
use crate::errors::{ChainError, ChainResult};
use crate::gas::GasCosts;
use crate::quantity::Quantity;

pub const MODULE: &str = "registry";

pub mod method {
    pub const REGISTER_ENTITY: &str = "registry.RegisterEntity";
    pub const DEREGISTER_ENTITY: &str = "registry.DeregisterEntity";
    pub const REGISTER_NODE: &str = "registry.RegisterNode";
    pub const UNFREEZE_NODE: &str = "registry.UnfreezeNode";
    pub const REGISTER_RUNTIME: &str = "registry.RegisterRuntime";
}

pub mod op {
    pub const REGISTER_ENTITY: &str = "register_entity";
    pub const DEREGISTER_ENTITY: &str = "deregister_entity";
    pub const REGISTER_NODE: &str = "register_node";
    pub const UNFREEZE_NODE: &str = "unfreeze_node";
    pub const REGISTER_RUNTIME: &str = "register_runtime";
}

/// Signature contexts for registry descriptors. The registry rejects any
/// descriptor whose context does not exactly match the expected one.
pub mod sigctx {
    pub const REGISTER_ENTITY: &str = "tessera/registry: register entity";
    pub const REGISTER_NODE: &str = "tessera/registry: register node";
    pub const REGISTER_RUNTIME: &str = "tessera/registry: register runtime";
}

/// A 32-byte runtime identifier. The first 8 bytes are reserved for flag
/// bits; the top bit marks a test runtime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Namespace(pub [u8; 32]);

const FLAG_TEST: u8 = 0x80;

impl Namespace {
    pub fn is_test(&self) -> bool {
        self.0[0] & FLAG_TEST != 0
    }

    pub fn from_hex(data: &str) -> ChainResult<Self> {
        let bytes = hex::decode(data)
            .map_err(|err| ChainError::Crypto(format!("invalid namespace encoding: {err}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChainError::Crypto("invalid namespace length".into()))?;
        Ok(Namespace(bytes))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({})", hex::encode(self.0))
    }
}

impl Serialize for Namespace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Namespace::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// Node role bitmask.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolesMask(pub u32);

pub const ROLE_VALIDATOR: u32 = 1 << 0;
pub const ROLE_COMPUTE_WORKER: u32 = 1 << 1;
pub const ROLE_STORAGE_WORKER: u32 = 1 << 2;
pub const ROLE_KEY_MANAGER: u32 = 1 << 3;
pub const ROLE_MERGE_WORKER: u32 = 1 << 4;
pub const ROLE_TXN_SCHEDULER: u32 = 1 << 5;
const ROLES_RESERVED: u32 = !(ROLE_VALIDATOR
    | ROLE_COMPUTE_WORKER
    | ROLE_STORAGE_WORKER
    | ROLE_KEY_MANAGER
    | ROLE_MERGE_WORKER
    | ROLE_TXN_SCHEDULER);

impl RolesMask {
    pub fn contains(&self, role: u32) -> bool {
        self.0 & role != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn validate(&self) -> ChainResult<()> {
        if self.is_empty() {
            return Err(ChainError::InvalidArgument(
                "registry: empty node role mask".into(),
            ));
        }
        if self.0 & ROLES_RESERVED != 0 {
            return Err(ChainError::InvalidArgument(
                "registry: reserved node role bits set".into(),
            ));
        }
        Ok(())
    }

    /// True for roles that perform per-runtime compute work.
    pub fn has_compute_roles(&self) -> bool {
        self.contains(ROLE_COMPUTE_WORKER)
            || self.contains(ROLE_MERGE_WORKER)
            || self.contains(ROLE_TXN_SCHEDULER)
            || self.contains(ROLE_STORAGE_WORKER)
    }
}

/// An entity: the control domain owning nodes and runtimes.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    pub id: PublicKey,
    pub nodes: Vec<PublicKey>,
    pub allow_entity_signed_nodes: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedEntity {
    pub entity: Entity,
    pub signature: ContextSignature,
}

impl SignedEntity {
    pub fn sign(keypair: &ed25519_dalek::Keypair, context: &str, entity: Entity) -> ChainResult<Self> {
        let bytes = encoding::to_vec(&entity)?;
        Ok(SignedEntity {
            signature: ContextSignature::sign(keypair, context, &bytes),
            entity,
        })
    }

    pub fn verify(&self, expected_context: &str) -> ChainResult<()> {
        if self.signature.public_key != self.entity.id {
            return Err(ChainError::InvalidArgument(
                "registry: entity descriptor not signed by entity key".into(),
            ));
        }
        let bytes = encoding::to_vec(&self.entity)?;
        self.signature.verify(expected_context, &bytes)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsInfo {
    pub pub_key: PublicKey,
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct P2pInfo {
    pub id: PublicKey,
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusInfo {
    pub id: PublicKey,
    pub addresses: Vec<String>,
}

/// A TEE capability advertised for a served runtime.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityTee {
    pub hardware: String,
    pub rak: PublicKey,
    pub attestation: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRuntime {
    pub id: Namespace,
    pub capability_tee: Option<CapabilityTee>,
}

/// Supported node descriptor versions.
pub const NODE_DESCRIPTOR_VERSION_MIN: u16 = 0;
pub const NODE_DESCRIPTOR_VERSION_MAX: u16 = 1;

/// A node descriptor. Signed by every private key it enumerates to prove
/// possession.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub version: u16,
    pub id: PublicKey,
    pub entity_id: PublicKey,
    pub expiration: EpochTime,
    pub tls: TlsInfo,
    pub p2p: P2pInfo,
    pub consensus: ConsensusInfo,
    pub runtimes: Vec<NodeRuntime>,
    pub roles: RolesMask,
}

impl Node {
    pub fn has_runtime(&self, id: &Namespace) -> bool {
        self.runtimes.iter().any(|rt| rt.id == *id)
    }

    fn enumerated_keys(&self) -> [PublicKey; 4] {
        [self.id, self.p2p.id, self.tls.pub_key, self.consensus.id]
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MultiSignedNode {
    pub node: Node,
    pub signatures: Vec<ContextSignature>,
}

impl MultiSignedNode {
    pub fn sign(
        keypairs: &[&ed25519_dalek::Keypair],
        context: &str,
        node: Node,
    ) -> ChainResult<Self> {
        let bytes = encoding::to_vec(&node)?;
        Ok(MultiSignedNode {
            signatures: keypairs
                .iter()
                .map(|kp| ContextSignature::sign(kp, context, &bytes))
                .collect(),
            node,
        })
    }

    /// Verifies every signature and checks proof of possession for all four
    /// enumerated keys. Returns whether the entity key co-signed.
    pub fn verify(&self, expected_context: &str) -> ChainResult<bool> {
        let bytes = encoding::to_vec(&self.node)?;
        let mut signers = BTreeSet::new();
        for signature in &self.signatures {
            signature.verify(expected_context, &bytes)?;
            signers.insert(signature.public_key);
        }
        for key in self.node.enumerated_keys() {
            if !signers.contains(&key) {
                return Err(ChainError::InvalidArgument(format!(
                    "registry: node descriptor missing signature by {key}"
                )));
            }
        }
        Ok(signers.contains(&self.node.entity_id) && self.node.entity_id != self.node.id)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    Compute,
    KeyManager,
}

impl Default for RuntimeKind {
    fn default() -> Self {
        RuntimeKind::Compute
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorParameters {
    pub group_size: u64,
    pub group_backup_size: u64,
    pub allowed_stragglers: u64,
    /// Round timeout in consensus blocks.
    pub round_timeout: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeParameters {
    pub group_size: u64,
    pub group_backup_size: u64,
    pub allowed_stragglers: u64,
    pub round_timeout: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxnSchedulerParameters {
    pub group_size: u64,
    pub algorithm: String,
    pub max_batch_size: u64,
    pub max_batch_size_bytes: u64,
    pub batch_flush_timeout: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageParameters {
    pub group_size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeAdmissionPolicy {
    AnyNode,
    EntityWhitelist { entities: BTreeSet<PublicKey> },
}

impl Default for RuntimeAdmissionPolicy {
    fn default() -> Self {
        RuntimeAdmissionPolicy::AnyNode
    }
}

impl RuntimeAdmissionPolicy {
    pub fn admits(&self, entity: &PublicKey) -> bool {
        match self {
            RuntimeAdmissionPolicy::AnyNode => true,
            RuntimeAdmissionPolicy::EntityWhitelist { entities } => entities.contains(entity),
        }
    }
}

/// The runtime's registry genesis: the round and state root its chain starts
/// from, plus storage receipts over those roots. Receipts may be empty (and
/// are not checked) at network launch.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeGenesis {
    pub round: u64,
    pub state_root: Hash,
    pub storage_receipts: Vec<ContextSignature>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Runtime {
    pub id: Namespace,
    pub entity_id: PublicKey,
    pub kind: RuntimeKind,
    pub executor: ExecutorParameters,
    pub merge: MergeParameters,
    pub txn_scheduler: TxnSchedulerParameters,
    pub storage: StorageParameters,
    pub admission_policy: RuntimeAdmissionPolicy,
    pub key_manager: Option<Namespace>,
    pub genesis: RuntimeGenesis,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedRuntime {
    pub runtime: Runtime,
    pub signature: ContextSignature,
}

impl SignedRuntime {
    pub fn sign(
        keypair: &ed25519_dalek::Keypair,
        context: &str,
        runtime: Runtime,
    ) -> ChainResult<Self> {
        let bytes = encoding::to_vec(&runtime)?;
        Ok(SignedRuntime {
            signature: ContextSignature::sign(keypair, context, &bytes),
            runtime,
        })
    }

    pub fn verify(&self, expected_context: &str) -> ChainResult<()> {
        if self.signature.public_key != self.runtime.entity_id {
            return Err(ChainError::InvalidArgument(
                "registry: runtime descriptor not signed by entity key".into(),
            ));
        }
        let bytes = encoding::to_vec(&self.runtime)?;
        self.signature.verify(expected_context, &bytes)
    }
}

/// Sentinel for a permanent freeze.
pub const FREEZE_FOREVER: EpochTime = crate::epochtime::EPOCH_INVALID;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeStatus {
    pub frozen_until: Option<EpochTime>,
}

impl NodeStatus {
    pub fn is_frozen(&self, now: EpochTime) -> bool {
        matches!(self.frozen_until, Some(end) if now < end)
    }
}

/// Per-node prepaid runtime maintenance coverage.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenancePrepay {
    pub epochs_remaining: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusParameters {
    pub max_node_expiration: u64,
    pub gas_costs: GasCosts,
    /// Runtime identifiers without the test flag are only accepted when this
    /// debug flag is set.
    pub debug_allow_non_test_runtimes: bool,
    pub runtime_maintenance_fee_per_epoch: Quantity,
}

impl Default for ConsensusParameters {
    fn default() -> Self {
        Self {
            max_node_expiration: 5,
            gas_costs: GasCosts::new(),
            debug_allow_non_test_runtimes: false,
            runtime_maintenance_fee_per_epoch: Quantity::zero(),
        }
    }
}

// Transaction bodies without a descriptor payload.

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeregisterEntity {}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnfreezeNode {
    pub node_id: PublicKey,
}

// Events.

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityEvent {
    pub id: PublicKey,
    pub is_registration: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeEvent {
    pub id: PublicKey,
    pub is_registration: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeUnfrozenEvent {
    pub node_id: PublicKey,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub id: Namespace,
    pub suspended: bool,
}

pub mod event_kind {
    pub const ENTITY: &str = "entity";
    pub const NODE: &str = "node";
    pub const NODE_UNFROZEN: &str = "node_unfrozen";
    pub const RUNTIME: &str = "runtime";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_flags() {
        let mut test_id = [0u8; 32];
        test_id[0] = FLAG_TEST;
        assert!(Namespace(test_id).is_test());
        assert!(!Namespace([0u8; 32]).is_test());
    }

    #[test]
    fn roles_mask_validation() {
        assert!(RolesMask(0).validate().is_err());
        assert!(RolesMask(1 << 30).validate().is_err());
        RolesMask(ROLE_VALIDATOR).validate().unwrap();
        RolesMask(ROLE_COMPUTE_WORKER | ROLE_STORAGE_WORKER)
            .validate()
            .unwrap();
        assert!(RolesMask(ROLE_MERGE_WORKER).has_compute_roles());
        assert!(!RolesMask(ROLE_VALIDATOR).has_compute_roles());
    }

    #[test]
    fn admission_policy() {
        let any = RuntimeAdmissionPolicy::AnyNode;
        assert!(any.admits(&PublicKey([1; 32])));
        let whitelist = RuntimeAdmissionPolicy::EntityWhitelist {
            entities: [PublicKey([1; 32])].into(),
        };
        assert!(whitelist.admits(&PublicKey([1; 32])));
        assert!(!whitelist.admits(&PublicKey([2; 32])));
    }

    #[test]
    fn node_status_freeze_window() {
        let status = NodeStatus {
            frozen_until: Some(10),
        };
        assert!(status.is_frozen(9));
        assert!(!status.is_frozen(10));
        assert!(NodeStatus::default().frozen_until.is_none());
        let forever = NodeStatus {
            frozen_until: Some(FREEZE_FOREVER),
        };
        assert!(forever.is_frozen(u64::MAX - 1));
    }
}
