//! Registry keyspace over the authenticated store.

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::encoding;
use crate::epochtime::EpochTime;
use crate::errors::{ChainError, ChainResult};
use crate::mkvs::{KeyValueRead, Tree};

use super::{
    ConsensusParameters, Entity, MaintenancePrepay, MultiSignedNode, Namespace, Node, NodeStatus,
    Runtime, SignedEntity, SignedRuntime,
};

const PARAMS_KEY: &[u8] = b"r/params";
const ENTITY_PREFIX: &[u8] = b"r/entity/";
const NODE_PREFIX: &[u8] = b"r/node/";
const NODE_STATUS_PREFIX: &[u8] = b"r/nodestat/";
const RUNTIME_PREFIX: &[u8] = b"r/runtime/";
const SUSPENDED_PREFIX: &[u8] = b"r/suspended/";
const MAINTENANCE_PREFIX: &[u8] = b"r/maint/";
const MAINTENANCE_LAST_PREFIX: &[u8] = b"r/maintlast/";
const EXPIRY_QUEUE_PREFIX: &[u8] = b"r/expq/";

fn pk_key(prefix: &[u8], pk: &PublicKey) -> Vec<u8> {
    [prefix, &pk.0[..]].concat()
}

fn ns_key(prefix: &[u8], ns: &Namespace) -> Vec<u8> {
    [prefix, &ns.0[..]].concat()
}

pub fn params(store: &impl KeyValueRead) -> ChainResult<ConsensusParameters> {
    let raw = store
        .get(PARAMS_KEY)
        .ok_or_else(|| ChainError::Fatal("registry: consensus parameters missing".into()))?;
    encoding::from_slice(&raw)
}

pub fn set_params(tree: &mut Tree, params: &ConsensusParameters) -> ChainResult<()> {
    tree.insert(PARAMS_KEY, encoding::to_vec(params)?);
    Ok(())
}

pub fn entity(store: &impl KeyValueRead, id: &PublicKey) -> ChainResult<Option<Entity>> {
    store
        .get(&pk_key(ENTITY_PREFIX, id))
        .map(|raw| encoding::from_slice(&raw))
        .transpose()
}

pub fn set_entity(tree: &mut Tree, entity: &Entity) -> ChainResult<()> {
    tree.insert(&pk_key(ENTITY_PREFIX, &entity.id), encoding::to_vec(entity)?);
    Ok(())
}

pub fn remove_entity(tree: &mut Tree, id: &PublicKey) {
    tree.remove(&pk_key(ENTITY_PREFIX, id));
}

pub fn entities(store: &impl KeyValueRead) -> ChainResult<Vec<Entity>> {
    store
        .iterate_prefix(ENTITY_PREFIX)
        .into_iter()
        .map(|(_, raw)| encoding::from_slice(&raw))
        .collect()
}

pub fn node(store: &impl KeyValueRead, id: &PublicKey) -> ChainResult<Option<Node>> {
    store
        .get(&pk_key(NODE_PREFIX, id))
        .map(|raw| encoding::from_slice(&raw))
        .transpose()
}

pub fn set_node(tree: &mut Tree, node: &Node) -> ChainResult<()> {
    tree.insert(&pk_key(NODE_PREFIX, &node.id), encoding::to_vec(node)?);
    Ok(())
}

pub fn remove_node(tree: &mut Tree, id: &PublicKey) {
    tree.remove(&pk_key(NODE_PREFIX, id));
    tree.remove(&pk_key(NODE_STATUS_PREFIX, id));
}

pub fn nodes(store: &impl KeyValueRead) -> ChainResult<Vec<Node>> {
    store
        .iterate_prefix(NODE_PREFIX)
        .into_iter()
        .map(|(_, raw)| encoding::from_slice(&raw))
        .collect()
}

pub fn node_status(store: &impl KeyValueRead, id: &PublicKey) -> ChainResult<NodeStatus> {
    match store.get(&pk_key(NODE_STATUS_PREFIX, id)) {
        Some(raw) => encoding::from_slice(&raw),
        None => Ok(NodeStatus::default()),
    }
}

pub fn set_node_status(tree: &mut Tree, id: &PublicKey, status: &NodeStatus) -> ChainResult<()> {
    tree.insert(&pk_key(NODE_STATUS_PREFIX, id), encoding::to_vec(status)?);
    Ok(())
}

/// Resolves a node by its consensus key, for proposer and vote attribution.
pub fn node_by_consensus_key(
    store: &impl KeyValueRead,
    consensus_key: &PublicKey,
) -> ChainResult<Option<Node>> {
    Ok(nodes(store)?
        .into_iter()
        .find(|node| node.consensus.id == *consensus_key))
}

pub fn runtime(store: &impl KeyValueRead, id: &Namespace) -> ChainResult<Option<Runtime>> {
    store
        .get(&ns_key(RUNTIME_PREFIX, id))
        .map(|raw| encoding::from_slice(&raw))
        .transpose()
}

pub fn set_runtime(tree: &mut Tree, runtime: &Runtime) -> ChainResult<()> {
    tree.insert(&ns_key(RUNTIME_PREFIX, &runtime.id), encoding::to_vec(runtime)?);
    Ok(())
}

pub fn runtimes(store: &impl KeyValueRead) -> ChainResult<Vec<Runtime>> {
    store
        .iterate_prefix(RUNTIME_PREFIX)
        .into_iter()
        .map(|(_, raw)| encoding::from_slice(&raw))
        .collect()
}

pub fn is_suspended(store: &impl KeyValueRead, id: &Namespace) -> bool {
    store.get(&ns_key(SUSPENDED_PREFIX, id)).is_some()
}

pub fn set_suspended(tree: &mut Tree, id: &Namespace, suspended: bool) {
    let key = ns_key(SUSPENDED_PREFIX, id);
    if suspended {
        tree.insert(&key, vec![1]);
    } else {
        tree.remove(&key);
    }
}

fn maintenance_key(runtime: &Namespace, node: &PublicKey) -> Vec<u8> {
    [MAINTENANCE_PREFIX, &runtime.0[..], &node.0[..]].concat()
}

pub fn maintenance_prepay(
    store: &impl KeyValueRead,
    runtime: &Namespace,
    node: &PublicKey,
) -> ChainResult<MaintenancePrepay> {
    match store.get(&maintenance_key(runtime, node)) {
        Some(raw) => encoding::from_slice(&raw),
        None => Ok(MaintenancePrepay::default()),
    }
}

pub fn set_maintenance_prepay(
    tree: &mut Tree,
    runtime: &Namespace,
    node: &PublicKey,
    prepay: &MaintenancePrepay,
) -> ChainResult<()> {
    let key = maintenance_key(runtime, node);
    if prepay.epochs_remaining == 0 {
        tree.remove(&key);
    } else {
        tree.insert(&key, encoding::to_vec(prepay)?);
    }
    Ok(())
}

/// Round-robin pointer: the node whose prepaid coverage was debited last.
pub fn last_maintenance_payer(
    store: &impl KeyValueRead,
    runtime: &Namespace,
) -> ChainResult<Option<PublicKey>> {
    store
        .get(&ns_key(MAINTENANCE_LAST_PREFIX, runtime))
        .map(|raw| encoding::from_slice(&raw))
        .transpose()
}

pub fn set_last_maintenance_payer(
    tree: &mut Tree,
    runtime: &Namespace,
    node: &PublicKey,
) -> ChainResult<()> {
    tree.insert(&ns_key(MAINTENANCE_LAST_PREFIX, runtime), encoding::to_vec(node)?);
    Ok(())
}

/// A stake-accumulator claim pending release after node expiry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingClaimRelease {
    pub node_id: PublicKey,
    pub entity_id: PublicKey,
}

fn expiry_queue_key(release_epoch: EpochTime, node: &PublicKey) -> Vec<u8> {
    [EXPIRY_QUEUE_PREFIX, &release_epoch.to_be_bytes()[..], &node.0[..]].concat()
}

pub fn push_claim_release(
    tree: &mut Tree,
    release_epoch: EpochTime,
    release: &PendingClaimRelease,
) -> ChainResult<()> {
    tree.insert(
        &expiry_queue_key(release_epoch, &release.node_id),
        encoding::to_vec(release)?,
    );
    Ok(())
}

/// Pops all queued claim releases due at or before `epoch`.
pub fn take_due_claim_releases(
    tree: &mut Tree,
    epoch: EpochTime,
) -> ChainResult<Vec<PendingClaimRelease>> {
    let mut due = Vec::new();
    for (key, raw) in tree.iterate_prefix(EXPIRY_QUEUE_PREFIX) {
        let at = key
            .get(EXPIRY_QUEUE_PREFIX.len()..EXPIRY_QUEUE_PREFIX.len() + 8)
            .and_then(|s| <[u8; 8]>::try_from(s).ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| ChainError::Fatal("registry: malformed expiry queue key".into()))?;
        if at > epoch {
            break;
        }
        due.push((key, encoding::from_slice::<PendingClaimRelease>(&raw)?));
    }
    for (key, _) in &due {
        tree.remove(key);
    }
    Ok(due.into_iter().map(|(_, release)| release).collect())
}

/// Registry genesis state.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Genesis {
    pub params: ConsensusParameters,
    pub entities: Vec<SignedEntity>,
    pub nodes: Vec<MultiSignedNode>,
    pub runtimes: Vec<SignedRuntime>,
    pub suspended_runtimes: Vec<Namespace>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_release_queue_pops_in_epoch_order() {
        let mut tree = Tree::new(1);
        let mk = |tag: u8| PendingClaimRelease {
            node_id: PublicKey([tag; 32]),
            entity_id: PublicKey([0xee; 32]),
        };
        push_claim_release(&mut tree, 5, &mk(1)).unwrap();
        push_claim_release(&mut tree, 7, &mk(2)).unwrap();
        push_claim_release(&mut tree, 9, &mk(3)).unwrap();

        let due = take_due_claim_releases(&mut tree, 7).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].node_id, PublicKey([1; 32]));
        assert_eq!(due[1].node_id, PublicKey([2; 32]));
        // Remaining entry still queued.
        let due = take_due_claim_releases(&mut tree, 20).unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn suspension_flag_roundtrip() {
        let mut tree = Tree::new(1);
        let ns = Namespace([3; 32]);
        assert!(!is_suspended(&tree, &ns));
        set_suspended(&mut tree, &ns, true);
        assert!(is_suspended(&tree, &ns));
        set_suspended(&mut tree, &ns, false);
        assert!(!is_suspended(&tree, &ns));
    }

    #[test]
    fn zero_prepay_is_deleted() {
        let mut tree = Tree::new(1);
        let ns = Namespace([1; 32]);
        let node = PublicKey([2; 32]);
        set_maintenance_prepay(
            &mut tree,
            &ns,
            &node,
            &MaintenancePrepay { epochs_remaining: 2 },
        )
        .unwrap();
        assert_eq!(
            maintenance_prepay(&tree, &ns, &node).unwrap().epochs_remaining,
            2
        );
        set_maintenance_prepay(
            &mut tree,
            &ns,
            &node,
            &MaintenancePrepay { epochs_remaining: 0 },
        )
        .unwrap();
        assert_eq!(
            maintenance_prepay(&tree, &ns, &node).unwrap().epochs_remaining,
            0
        );
    }
}
