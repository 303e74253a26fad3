//! Per-epoch committee election.
//!
//! On every epoch transition, for every non-suspended runtime and committee
//! kind, the scheduler filters the registered nodes down to the eligible set,
//! shuffles it with a deterministically seeded generator and slices the
//! result into workers, a leader (for leader-bearing kinds) and backups.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::{Hash, PublicKey};
use crate::encoding;
use crate::epochtime::EpochTime;
use crate::errors::{ChainError, ChainResult};
use crate::mkvs::{KeyValueRead, Tree};
use crate::registry::{
    Namespace, Node, Runtime, ROLE_COMPUTE_WORKER, ROLE_MERGE_WORKER, ROLE_STORAGE_WORKER,
    ROLE_TXN_SCHEDULER,
};
use crate::staking::ThresholdKind;

pub const MODULE: &str = "scheduler";

/// Domain-separation context for election seeds.
pub const COMMITTEE_SEED_CONTEXT: &str = "tessera/scheduler: committee seed";

const PARAMS_KEY: &[u8] = b"sch/params";
const COMMITTEE_PREFIX: &[u8] = b"sch/committee/";
const UNSCHEDULABLE_PREFIX: &[u8] = b"sch/unschedulable/";

#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "kebab-case")]
pub enum CommitteeKind {
    TransactionScheduler,
    Executor,
    Merge,
    Storage,
}

impl CommitteeKind {
    pub const ALL: [CommitteeKind; 4] = [
        CommitteeKind::TransactionScheduler,
        CommitteeKind::Executor,
        CommitteeKind::Merge,
        CommitteeKind::Storage,
    ];

    fn tag(&self) -> u8 {
        match self {
            CommitteeKind::TransactionScheduler => 0,
            CommitteeKind::Executor => 1,
            CommitteeKind::Merge => 2,
            CommitteeKind::Storage => 3,
        }
    }

    /// Whether the first elected member acts as the committee leader.
    pub fn needs_leader(&self) -> bool {
        matches!(self, CommitteeKind::TransactionScheduler)
    }

    fn required_role(&self) -> u32 {
        match self {
            CommitteeKind::TransactionScheduler => ROLE_TXN_SCHEDULER,
            CommitteeKind::Executor => ROLE_COMPUTE_WORKER,
            CommitteeKind::Merge => ROLE_MERGE_WORKER,
            CommitteeKind::Storage => ROLE_STORAGE_WORKER,
        }
    }

    fn stake_threshold(&self) -> ThresholdKind {
        match self {
            CommitteeKind::Storage => ThresholdKind::StorageWorker,
            _ => ThresholdKind::ComputeWorker,
        }
    }

    fn group_sizes(&self, runtime: &Runtime) -> (u64, u64) {
        match self {
            CommitteeKind::TransactionScheduler => (runtime.txn_scheduler.group_size, 0),
            CommitteeKind::Executor => {
                (runtime.executor.group_size, runtime.executor.group_backup_size)
            }
            CommitteeKind::Merge => (runtime.merge.group_size, runtime.merge.group_backup_size),
            CommitteeKind::Storage => (runtime.storage.group_size, 0),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Worker,
    BackupWorker,
    Leader,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitteeNode {
    pub role: Role,
    pub public_key: PublicKey,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Committee {
    pub kind: CommitteeKind,
    pub runtime_id: Namespace,
    pub members: Vec<CommitteeNode>,
    pub valid_for: EpochTime,
}

impl Committee {
    /// The committee identifier cited by commitments.
    pub fn encoded_hash(&self) -> ChainResult<Hash> {
        encoding::hash_of(self)
    }

    pub fn workers(&self) -> impl Iterator<Item = &CommitteeNode> {
        self.members
            .iter()
            .filter(|member| member.role == Role::Worker || member.role == Role::Leader)
    }

    pub fn backup_workers(&self) -> impl Iterator<Item = &CommitteeNode> {
        self.members
            .iter()
            .filter(|member| member.role == Role::BackupWorker)
    }

    pub fn leader(&self) -> Option<&CommitteeNode> {
        self.members.iter().find(|member| member.role == Role::Leader)
    }

    pub fn is_member(&self, key: &PublicKey) -> bool {
        self.members.iter().any(|member| member.public_key == *key)
    }

    pub fn is_worker(&self, key: &PublicKey) -> bool {
        self.workers().any(|member| member.public_key == *key)
    }

    pub fn is_backup_worker(&self, key: &PublicKey) -> bool {
        self.backup_workers().any(|member| member.public_key == *key)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusParameters {
    /// Skips the per-kind stake check during election; debug only.
    pub debug_bypass_stake: bool,
}

pub fn params(store: &impl KeyValueRead) -> ChainResult<ConsensusParameters> {
    let raw = store
        .get(PARAMS_KEY)
        .ok_or_else(|| ChainError::Fatal("scheduler: consensus parameters missing".into()))?;
    encoding::from_slice(&raw)
}

pub fn set_params(tree: &mut Tree, params: &ConsensusParameters) -> ChainResult<()> {
    tree.insert(PARAMS_KEY, encoding::to_vec(params)?);
    Ok(())
}

pub fn election_seed(epoch: EpochTime, runtime_id: &Namespace, kind: CommitteeKind) -> [u8; 32] {
    Hash::digest_parts(&[
        COMMITTEE_SEED_CONTEXT.as_bytes(),
        &epoch.to_be_bytes(),
        &runtime_id.0,
        &[kind.tag()],
    ])
    .0
}

/// Elects one committee. `candidates` is the set of registered, non-expired,
/// non-frozen nodes; `stake_ok` reports whether a node's entity currently
/// covers the given threshold. Returns `None` when the committee cannot be
/// populated at the required cardinality.
pub fn elect_committee(
    epoch: EpochTime,
    runtime: &Runtime,
    kind: CommitteeKind,
    candidates: &[Node],
    params: &ConsensusParameters,
    stake_ok: &dyn Fn(&PublicKey, ThresholdKind) -> bool,
) -> ChainResult<Option<Committee>> {
    let (group_size, backup_size) = kind.group_sizes(runtime);
    if group_size == 0 {
        return Err(ChainError::Fatal(format!(
            "scheduler: zero group size for {kind:?}"
        )));
    }

    let mut eligible: Vec<&Node> = candidates
        .iter()
        .filter(|node| node.roles.contains(kind.required_role()))
        .filter(|node| node.has_runtime(&runtime.id))
        .filter(|node| runtime.admission_policy.admits(&node.entity_id))
        .filter(|node| {
            params.debug_bypass_stake || stake_ok(&node.entity_id, kind.stake_threshold())
        })
        .collect();
    eligible.sort_by(|a, b| a.id.cmp(&b.id));

    let wanted = (group_size + backup_size) as usize;
    if eligible.len() < wanted {
        debug!(
            runtime = %runtime.id,
            ?kind,
            eligible = eligible.len(),
            wanted,
            "insufficient nodes for committee"
        );
        return Ok(None);
    }

    let mut rng = StdRng::from_seed(election_seed(epoch, &runtime.id, kind));
    eligible.shuffle(&mut rng);

    let mut members = Vec::with_capacity(wanted);
    for (i, node) in eligible.iter().take(wanted).enumerate() {
        let role = if (i as u64) < group_size {
            if i == 0 && kind.needs_leader() {
                Role::Leader
            } else {
                Role::Worker
            }
        } else {
            Role::BackupWorker
        };
        members.push(CommitteeNode {
            role,
            public_key: node.id,
        });
    }

    let committee = Committee {
        kind,
        runtime_id: runtime.id,
        members,
        valid_for: epoch,
    };

    // The sliced committee must have the exact expected cardinalities.
    let workers = committee.workers().count() as u64;
    let backups = committee.backup_workers().count() as u64;
    let leaders = committee.members.iter().filter(|m| m.role == Role::Leader).count();
    if workers != group_size
        || backups != backup_size
        || leaders != usize::from(kind.needs_leader())
    {
        return Err(ChainError::Fatal(format!(
            "scheduler: elected committee for {kind:?} has wrong cardinality"
        )));
    }
    Ok(Some(committee))
}

// Committee state for the current epoch.

fn committee_key(runtime_id: &Namespace, kind: CommitteeKind) -> Vec<u8> {
    [COMMITTEE_PREFIX, &runtime_id.0[..], &[kind.tag()]].concat()
}

pub fn committee(
    store: &impl KeyValueRead,
    runtime_id: &Namespace,
    kind: CommitteeKind,
) -> ChainResult<Option<Committee>> {
    store
        .get(&committee_key(runtime_id, kind))
        .map(|raw| encoding::from_slice(&raw))
        .transpose()
}

pub fn set_committee(tree: &mut Tree, committee: &Committee) -> ChainResult<()> {
    tree.insert(
        &committee_key(&committee.runtime_id, committee.kind),
        encoding::to_vec(committee)?,
    );
    Ok(())
}

pub fn clear_runtime_committees(tree: &mut Tree, runtime_id: &Namespace) {
    for kind in CommitteeKind::ALL {
        tree.remove(&committee_key(runtime_id, kind));
    }
}

pub fn is_unschedulable(store: &impl KeyValueRead, runtime_id: &Namespace) -> bool {
    store
        .get(&[UNSCHEDULABLE_PREFIX, &runtime_id.0[..]].concat())
        .is_some()
}

pub fn set_unschedulable(tree: &mut Tree, runtime_id: &Namespace, flag: bool) {
    let key = [UNSCHEDULABLE_PREFIX, &runtime_id.0[..]].concat();
    if flag {
        warn!(runtime = %runtime_id, "runtime unschedulable this epoch");
        tree.insert(&key, vec![1]);
    } else {
        tree.remove(&key);
    }
}
