//! Per-runtime round state: commitment pools, discrepancy detection,
//! finalization, timeouts and epoch maintenance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::crypto::{context_with_chain, Address, Hash, PublicKey};
use crate::encoding;
use crate::errors::{ChainError, ChainResult};
use crate::genesis;
use crate::mkvs::{KeyValueRead, Tree};
use crate::registry::{self, MaintenancePrepay, Namespace, Runtime, RuntimeEvent};
use crate::scheduler::{self, Committee, CommitteeKind};
use crate::staking::{self, ThresholdKind};

use super::commitment::{
    sigctx, BatchDispatch, ComputeResultsHeader, MergeCommit, MergeCommitment,
    verify_storage_receipts,
};
use super::{
    event_kind, method, op, Block, ConsensusParameters, DiscrepancyDetectedEvent, FinalizedEvent,
    HeaderType, MergeDiscrepancyEvent, RoundFailedEvent, MODULE,
};

const PARAMS_KEY: &[u8] = b"rh/params";
const RUNTIME_STATE_PREFIX: &[u8] = b"rh/rt/";
const BLOCK_PREFIX: &[u8] = b"rh/blk/";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RoundPhase {
    Primary,
    Backup,
}

/// Consensus-tracked round state of one runtime.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeState {
    pub runtime_id: Namespace,
    pub current_block: Block,
    pub round_started_height: u64,
    pub phase: RoundPhase,
    /// The input root under dispute, set while backup workers re-execute.
    pub disputed_input_root: Option<Hash>,
    pub merge_pool: BTreeMap<PublicKey, MergeCommitment>,
    pub merge_discrepancy_emitted: bool,
}

impl RuntimeState {
    fn reset_round(&mut self, height: u64) {
        self.round_started_height = height;
        self.phase = RoundPhase::Primary;
        self.disputed_input_root = None;
        self.merge_pool.clear();
        self.merge_discrepancy_emitted = false;
    }

    fn round_in_progress(&self) -> bool {
        !self.merge_pool.is_empty() || self.phase == RoundPhase::Backup
    }
}

pub fn params(store: &impl KeyValueRead) -> ChainResult<ConsensusParameters> {
    let raw = store
        .get(PARAMS_KEY)
        .ok_or_else(|| ChainError::Fatal("roothash: consensus parameters missing".into()))?;
    encoding::from_slice(&raw)
}

pub fn set_params(tree: &mut Tree, params: &ConsensusParameters) -> ChainResult<()> {
    tree.insert(PARAMS_KEY, encoding::to_vec(params)?);
    Ok(())
}

pub fn runtime_state(
    store: &impl KeyValueRead,
    id: &Namespace,
) -> ChainResult<Option<RuntimeState>> {
    store
        .get(&[RUNTIME_STATE_PREFIX, &id.0[..]].concat())
        .map(|raw| encoding::from_slice(&raw))
        .transpose()
}

pub fn set_runtime_state(tree: &mut Tree, state: &RuntimeState) -> ChainResult<()> {
    tree.insert(
        &[RUNTIME_STATE_PREFIX, &state.runtime_id.0[..]].concat(),
        encoding::to_vec(state)?,
    );
    Ok(())
}

pub fn runtime_states(store: &impl KeyValueRead) -> ChainResult<Vec<RuntimeState>> {
    store
        .iterate_prefix(RUNTIME_STATE_PREFIX)
        .into_iter()
        .map(|(_, raw)| encoding::from_slice(&raw))
        .collect()
}

fn block_key(id: &Namespace, round: u64) -> Vec<u8> {
    [BLOCK_PREFIX, &id.0[..], &round.to_be_bytes()[..]].concat()
}

pub fn block_at(store: &impl KeyValueRead, id: &Namespace, round: u64) -> ChainResult<Option<Block>> {
    store
        .get(&block_key(id, round))
        .map(|raw| encoding::from_slice(&raw))
        .transpose()
}

fn store_block(tree: &mut Tree, block: &Block) -> ChainResult<()> {
    tree.insert(
        &block_key(&block.header.namespace, block.header.round),
        encoding::to_vec(block)?,
    );
    Ok(())
}

/// Prunes stored blocks below `keep_from_round`. Retention is caller policy;
/// the in-state current block is never pruned.
pub fn prune_blocks(tree: &mut Tree, id: &Namespace, keep_from_round: u64) {
    let prefix = [BLOCK_PREFIX, &id.0[..]].concat();
    let doomed: Vec<Vec<u8>> = tree
        .iterate_prefix(&prefix)
        .into_iter()
        .map(|(key, _)| key)
        .filter(|key| {
            key.get(prefix.len()..prefix.len() + 8)
                .and_then(|s| <[u8; 8]>::try_from(s).ok())
                .map(u64::from_be_bytes)
                .is_some_and(|round| round < keep_from_round)
        })
        .collect();
    for key in doomed {
        tree.remove(&key);
    }
}

/// Creates the runtime's genesis block on first registration. Storage
/// receipts over the genesis state root are verified against registered
/// storage nodes except at network launch, where the descriptor may carry
/// none.
pub fn ensure_genesis_block(
    ctx: &mut Context,
    tree: &mut Tree,
    runtime: &Runtime,
    verify_receipts: bool,
) -> ChainResult<()> {
    if runtime_state(tree, &runtime.id)?.is_some() {
        return Ok(());
    }

    let block = Block::new_genesis_block(runtime, ctx.time);
    if verify_receipts && !runtime.genesis.state_root.is_empty() {
        let chain = genesis::chain_context(tree)?;
        let receipt_ctx = context_with_chain(sigctx::STORAGE_RECEIPT, &chain);
        if runtime.genesis.storage_receipts.is_empty() {
            return Err(ChainError::InvalidArgument(
                "roothash: runtime genesis missing storage receipts".into(),
            ));
        }
        let body_roots = vec![block.header.io_root, block.header.state_root];
        let receipt_body = super::commitment::StorageReceiptBody {
            version: 1,
            namespace: runtime.id,
            round: runtime.genesis.round,
            roots: body_roots,
        };
        let bytes = encoding::to_vec(&receipt_body)?;
        for receipt in &runtime.genesis.storage_receipts {
            receipt.verify(&receipt_ctx, &bytes)?;
            let node = registry::state::node(tree, &receipt.public_key)?.ok_or_else(|| {
                ChainError::InvalidArgument(
                    "roothash: genesis storage receipt from unregistered node".into(),
                )
            })?;
            if !node.roles.contains(registry::ROLE_STORAGE_WORKER) {
                return Err(ChainError::InvalidArgument(
                    "roothash: genesis storage receipt from non-storage node".into(),
                ));
            }
        }
    }

    store_block(tree, &block)?;
    let state = RuntimeState {
        runtime_id: runtime.id,
        current_block: block,
        round_started_height: ctx.height,
        phase: RoundPhase::Primary,
        disputed_input_root: None,
        merge_pool: BTreeMap::new(),
        merge_discrepancy_emitted: false,
    };
    set_runtime_state(tree, &state)?;
    info!(runtime = %runtime.id, round = runtime.genesis.round, "created runtime genesis block");
    Ok(())
}

pub fn dispatch(ctx: &mut Context, tree: &mut Tree, method: &str, body: &[u8]) -> ChainResult<()> {
    match method {
        method::MERGE_COMMIT => merge_commit(ctx, tree, &encoding::from_slice(body)?),
        other => Err(ChainError::InvalidArgument(format!(
            "roothash: unknown method {other}"
        ))),
    }
}

struct RoundCommittees {
    executor: Committee,
    executor_id: Hash,
    merge: Committee,
    storage: Committee,
    txn_scheduler: Committee,
}

fn round_committees(store: &impl KeyValueRead, id: &Namespace) -> ChainResult<RoundCommittees> {
    let fetch = |kind: CommitteeKind| -> ChainResult<Committee> {
        scheduler::committee(store, id, kind)?.ok_or_else(|| {
            ChainError::NotFound(format!("roothash: no {kind:?} committee for runtime"))
        })
    };
    let executor = fetch(CommitteeKind::Executor)?;
    let executor_id = executor.encoded_hash()?;
    Ok(RoundCommittees {
        executor_id,
        executor,
        merge: fetch(CommitteeKind::Merge)?,
        storage: fetch(CommitteeKind::Storage)?,
        txn_scheduler: fetch(CommitteeKind::TransactionScheduler)?,
    })
}

pub fn merge_commit(ctx: &mut Context, tree: &mut Tree, commit: &MergeCommit) -> ChainResult<()> {
    let roothash_params = params(tree)?;
    ctx.gas
        .use_gas(1, op::MERGE_COMMIT, &roothash_params.gas_costs)?;

    let mut state = runtime_state(tree, &commit.runtime_id)?
        .ok_or_else(|| ChainError::NotFound("roothash: no such runtime".into()))?;
    if registry::state::is_suspended(tree, &commit.runtime_id) {
        return Err(ChainError::Forbidden("roothash: runtime suspended".into()));
    }
    let runtime = registry::state::runtime(tree, &commit.runtime_id)?
        .ok_or_else(|| ChainError::NotFound("roothash: no such runtime".into()))?;
    let committees = round_committees(tree, &commit.runtime_id)?;

    let chain = genesis::chain_context(tree)?;
    let merge_ctx = context_with_chain(sigctx::MERGE_COMMITMENT, &chain);
    let executor_ctx = context_with_chain(sigctx::EXECUTOR_COMMITMENT, &chain);
    let storage_ctx = context_with_chain(sigctx::STORAGE_RECEIPT, &chain);
    let dispatch_ctx = context_with_chain(sigctx::BATCH_DISPATCH, &chain);

    let next_round = state.current_block.header.round + 1;
    let current_hash = state.current_block.header.encoded_hash()?;

    for merge_commitment in &commit.commits {
        let signer = merge_commitment.open(&merge_ctx)?;
        if !committees.merge.is_worker(&signer) {
            return Err(ChainError::Forbidden(
                "roothash: merge commitment from non-member".into(),
            ));
        }

        let header = &merge_commitment.body.header;
        if header.namespace != commit.runtime_id {
            return Err(ChainError::InvalidArgument(
                "roothash: commitment for foreign namespace".into(),
            ));
        }
        if header.round != next_round {
            // Commitments for finalized or failed rounds are stale.
            return Err(ChainError::InvalidArgument(format!(
                "roothash: commitment for stale round {} (expected {next_round})",
                header.round
            )));
        }
        if header.previous_hash != current_hash {
            return Err(ChainError::InvalidArgument(
                "roothash: commitment does not extend current block".into(),
            ));
        }
        if header.header_type != HeaderType::Normal {
            return Err(ChainError::InvalidArgument(
                "roothash: proposed header must be normal".into(),
            ));
        }
        if !header.messages.is_empty() {
            return Err(ChainError::InvalidArgument(
                "roothash: header messages must be empty".into(),
            ));
        }

        let agreed = process_executor_commitments(
            ctx,
            &mut state,
            &runtime,
            &committees,
            merge_commitment,
            &executor_ctx,
            &storage_ctx,
            &dispatch_ctx,
            current_hash,
            next_round,
        )?;
        let Some(results) = agreed else {
            // Discrepancy was signalled; nothing to pool.
            continue;
        };

        if header.io_root != results.io_root || header.state_root != results.state_root {
            return Err(ChainError::InvalidArgument(
                "roothash: proposed header does not match executor results".into(),
            ));
        }
        verify_storage_receipts(
            &header.storage_signatures,
            &storage_ctx,
            &commit.runtime_id,
            next_round,
            &[header.io_root, header.state_root],
            &committees.storage,
        )?;

        state.merge_pool.insert(signer, merge_commitment.clone());
    }

    try_finalize(ctx, tree, &mut state, &runtime)?;
    set_runtime_state(tree, &state)
}

#[allow(clippy::too_many_arguments)]
fn process_executor_commitments(
    ctx: &mut Context,
    state: &mut RuntimeState,
    runtime: &Runtime,
    committees: &RoundCommittees,
    merge_commitment: &MergeCommitment,
    executor_ctx: &str,
    storage_ctx: &str,
    dispatch_ctx: &str,
    current_hash: Hash,
    next_round: u64,
) -> ChainResult<Option<ComputeResultsHeader>> {
    let commits = &merge_commitment.body.executor_commits;
    if commits.is_empty() {
        return Err(ChainError::InvalidArgument(
            "roothash: merge commitment carries no executor commitments".into(),
        ));
    }

    let leader = committees
        .txn_scheduler
        .leader()
        .ok_or_else(|| ChainError::Fatal("roothash: scheduler committee without leader".into()))?;

    let mut input_root: Option<Hash> = None;
    let mut tally: BTreeMap<Hash, (ComputeResultsHeader, u64)> = BTreeMap::new();
    let mut seen = std::collections::BTreeSet::new();

    for executor_commitment in commits {
        let node = executor_commitment.open(executor_ctx)?;
        let member_ok = match state.phase {
            RoundPhase::Primary => committees.executor.is_worker(&node),
            RoundPhase::Backup => committees.executor.is_backup_worker(&node),
        };
        if !member_ok {
            return Err(ChainError::Forbidden(format!(
                "roothash: executor commitment from unexpected node {node}"
            )));
        }
        if !seen.insert(node) {
            return Err(ChainError::InvalidArgument(
                "roothash: duplicate executor commitment".into(),
            ));
        }

        let body = &executor_commitment.body;
        if body.committee_id != committees.executor_id {
            return Err(ChainError::InvalidArgument(
                "roothash: commitment cites wrong committee".into(),
            ));
        }
        if body.header.previous_hash != current_hash {
            return Err(ChainError::InvalidArgument(
                "roothash: executor results do not extend current block".into(),
            ));
        }
        if !body.header.messages.is_empty() {
            return Err(ChainError::InvalidArgument(
                "roothash: runtime messages must be empty".into(),
            ));
        }

        // Input batch identity, dispatched by the scheduler leader.
        if body.txn_scheduler_signature.public_key != leader.public_key {
            return Err(ChainError::Forbidden(
                "roothash: batch not dispatched by scheduler leader".into(),
            ));
        }
        let dispatch_body = BatchDispatch {
            committee_id: body.committee_id,
            input_root: body.input_root,
        };
        body.txn_scheduler_signature
            .verify(dispatch_ctx, &encoding::to_vec(&dispatch_body)?)?;

        match input_root {
            None => input_root = Some(body.input_root),
            Some(root) if root == body.input_root => {}
            Some(_) => {
                return Err(ChainError::InvalidArgument(
                    "roothash: executor commitments disagree on input root".into(),
                ))
            }
        }
        if state.phase == RoundPhase::Backup {
            if Some(body.input_root) != state.disputed_input_root {
                return Err(ChainError::InvalidArgument(
                    "roothash: backup commitment for undisputed input root".into(),
                ));
            }
        }

        verify_storage_receipts(
            &body.storage_signatures,
            storage_ctx,
            &runtime.id,
            next_round,
            &[body.header.io_root, body.header.state_root],
            &committees.storage,
        )?;

        let key = body.header.encoded_hash()?;
        let entry = tally.entry(key).or_insert_with(|| (body.header.clone(), 0));
        entry.1 += 1;
    }

    let threshold = match state.phase {
        RoundPhase::Primary => runtime
            .executor
            .group_size
            .saturating_sub(runtime.executor.allowed_stragglers),
        RoundPhase::Backup => runtime
            .executor
            .group_backup_size
            .saturating_sub(runtime.executor.allowed_stragglers),
    }
    .max(1);

    if tally.len() > 1 {
        match state.phase {
            RoundPhase::Primary => {
                let disputed = input_root.expect("non-empty commitments have an input root");
                warn!(
                    runtime = %runtime.id,
                    round = next_round,
                    io_root = %disputed,
                    "executor discrepancy detected"
                );
                state.phase = RoundPhase::Backup;
                state.disputed_input_root = Some(disputed);
                state.merge_pool.clear();
                ctx.emit(
                    MODULE,
                    event_kind::DISCREPANCY_DETECTED,
                    &DiscrepancyDetectedEvent {
                        runtime_id: runtime.id,
                        io_root: disputed,
                        block_header: state.current_block.header.clone(),
                    },
                )?;
                return Ok(None);
            }
            RoundPhase::Backup => {
                // Backup workers disagreeing leaves the round to fail on
                // timeout.
                return Ok(None);
            }
        }
    }

    let (results, votes) = tally.into_values().next().expect("tally is non-empty");
    if votes < threshold {
        return Err(ChainError::InvalidArgument(format!(
            "roothash: insufficient executor commitments ({votes} < {threshold})"
        )));
    }
    Ok(Some(results))
}

fn try_finalize(
    ctx: &mut Context,
    tree: &mut Tree,
    state: &mut RuntimeState,
    runtime: &Runtime,
) -> ChainResult<()> {
    if state.merge_pool.is_empty() {
        return Ok(());
    }
    let quorum = runtime
        .merge
        .group_size
        .saturating_sub(runtime.merge.allowed_stragglers)
        .max(1);

    let mut tally: BTreeMap<Hash, (Block, u64)> = BTreeMap::new();
    for commitment in state.merge_pool.values() {
        let header = &commitment.body.header;
        let key = header.encoded_hash()?;
        let entry = tally
            .entry(key)
            .or_insert_with(|| (Block { header: header.clone() }, 0));
        entry.1 += 1;
    }

    if tally.len() > 1 && !state.merge_discrepancy_emitted {
        state.merge_discrepancy_emitted = true;
        warn!(runtime = %runtime.id, "merge commitments disagree on parent header");
        ctx.emit(
            MODULE,
            event_kind::MERGE_DISCREPANCY,
            &MergeDiscrepancyEvent {
                runtime_id: runtime.id,
                round: state.current_block.header.round + 1,
            },
        )?;
    }

    let Some((block, _)) = tally.into_values().find(|(_, votes)| *votes >= quorum) else {
        return Ok(());
    };

    store_block(tree, &block)?;
    state.current_block = block;
    state.reset_round(ctx.height);
    info!(
        runtime = %runtime.id,
        round = state.current_block.header.round,
        "finalized runtime round"
    );
    ctx.emit(
        MODULE,
        event_kind::FINALIZED,
        &FinalizedEvent {
            runtime_id: runtime.id,
            round: state.current_block.header.round,
        },
    )
}

/// Per-block timeout processing: a round that exceeds its budget in consensus
/// blocks deterministically fails, preserving the state root.
pub fn on_block(ctx: &mut Context, tree: &mut Tree) -> ChainResult<()> {
    for mut state in runtime_states(tree)? {
        if !state.round_in_progress() {
            continue;
        }
        if registry::state::is_suspended(tree, &state.runtime_id) {
            continue;
        }
        let Some(runtime) = registry::state::runtime(tree, &state.runtime_id)? else {
            continue;
        };
        let deadline = state
            .round_started_height
            .saturating_add(runtime.executor.round_timeout);
        if ctx.height < deadline {
            continue;
        }

        let failed_round = state.current_block.header.round + 1;
        let block = Block::new_empty_block(&state.current_block, ctx.time, HeaderType::RoundFailed)?;
        store_block(tree, &block)?;
        state.current_block = block;
        state.reset_round(ctx.height);
        set_runtime_state(tree, &state)?;
        warn!(runtime = %state.runtime_id, round = failed_round, "round failed on timeout");
        ctx.emit(
            MODULE,
            event_kind::ROUND_FAILED,
            &RoundFailedEvent {
                runtime_id: state.runtime_id,
                round: failed_round,
            },
        )?;
    }
    Ok(())
}

/// Epoch maintenance: debit one epoch of prepaid coverage per non-suspended
/// runtime, round-robin over its serving nodes; suspend runtimes with no
/// coverage for the upcoming epoch.
pub fn maintenance(ctx: &mut Context, tree: &mut Tree) -> ChainResult<()> {
    for runtime in registry::state::runtimes(tree)? {
        if registry::state::is_suspended(tree, &runtime.id) {
            continue;
        }

        let mut serving: Vec<(PublicKey, MaintenancePrepay)> = Vec::new();
        for node in registry::state::nodes(tree)? {
            if !node.has_runtime(&runtime.id) {
                continue;
            }
            let prepay = registry::state::maintenance_prepay(tree, &runtime.id, &node.id)?;
            if prepay.epochs_remaining > 0 {
                serving.push((node.id, prepay));
            }
        }

        if serving.is_empty() {
            registry::state::set_suspended(tree, &runtime.id, true);
            scheduler::clear_runtime_committees(tree, &runtime.id);
            warn!(runtime = %runtime.id, epoch = ctx.epoch, "suspending runtime: no maintenance coverage");
            ctx.emit(
                registry::MODULE,
                registry::event_kind::RUNTIME,
                &RuntimeEvent {
                    id: runtime.id,
                    suspended: true,
                },
            )?;
            continue;
        }

        // Round-robin over serving nodes, continuing after the last payer.
        serving.sort_by(|a, b| a.0.cmp(&b.0));
        let last = registry::state::last_maintenance_payer(tree, &runtime.id)?;
        let index = match last {
            Some(last) => serving
                .iter()
                .position(|(id, _)| *id > last)
                .unwrap_or(0),
            None => 0,
        };
        let (payer, mut prepay) = serving[index].clone();
        prepay.epochs_remaining -= 1;
        registry::state::set_maintenance_prepay(tree, &runtime.id, &payer, &prepay)?;
        registry::state::set_last_maintenance_payer(tree, &runtime.id, &payer)?;
        debug!(runtime = %runtime.id, node = %payer, remaining = prepay.epochs_remaining, "debited runtime maintenance");
    }
    Ok(())
}

/// End-of-block epoch transition: elect fresh committees for every
/// non-suspended runtime and emit its epoch-transition block. Suspended
/// runtimes get neither committees nor a block; unschedulable runtimes get
/// the block but no committees.
pub fn elect_and_transition(ctx: &mut Context, tree: &mut Tree) -> ChainResult<()> {
    let scheduler_params = scheduler::params(tree)?;
    let staking_params = staking::state::params(tree)?;

    // Candidates: registered, non-expired, non-frozen nodes.
    let mut candidates = Vec::new();
    for node in registry::state::nodes(tree)? {
        let status = registry::state::node_status(tree, &node.id)?;
        if status.is_frozen(ctx.epoch) {
            continue;
        }
        candidates.push(node);
    }

    // Precompute the stake filter for every candidate entity.
    let mut stake: BTreeMap<(PublicKey, ThresholdKind), bool> = BTreeMap::new();
    for node in &candidates {
        for kind in [ThresholdKind::ComputeWorker, ThresholdKind::StorageWorker] {
            let key = (node.entity_id, kind);
            if stake.contains_key(&key) {
                continue;
            }
            let addr = Address::from_public_key(&node.entity_id);
            let account = staking::state::account(tree, &addr)?;
            let threshold = staking_params.thresholds.get(&kind).ok_or_else(|| {
                ChainError::Fatal(format!("staking: threshold for {kind:?} not configured"))
            })?;
            stake.insert(key, account.escrow.active.balance >= *threshold);
        }
    }
    let stake_ok = |entity: &PublicKey, kind: ThresholdKind| -> bool {
        stake.get(&(*entity, kind)).copied().unwrap_or(false)
    };

    for runtime in registry::state::runtimes(tree)? {
        if registry::state::is_suspended(tree, &runtime.id) {
            scheduler::clear_runtime_committees(tree, &runtime.id);
            continue;
        }

        let mut elected = Vec::new();
        let mut complete = true;
        for kind in CommitteeKind::ALL {
            match scheduler::elect_committee(
                ctx.epoch,
                &runtime,
                kind,
                &candidates,
                &scheduler_params,
                &stake_ok,
            )? {
                Some(committee) => elected.push(committee),
                None => {
                    complete = false;
                    break;
                }
            }
        }

        scheduler::clear_runtime_committees(tree, &runtime.id);
        if complete {
            for committee in &elected {
                scheduler::set_committee(tree, committee)?;
            }
            scheduler::set_unschedulable(tree, &runtime.id, false);
        } else {
            scheduler::set_unschedulable(tree, &runtime.id, true);
        }

        // The epoch-transition block is emitted either way; normal rounds
        // only run for schedulable runtimes.
        if let Some(mut state) = runtime_state(tree, &runtime.id)? {
            let block =
                Block::new_empty_block(&state.current_block, ctx.time, HeaderType::EpochTransition)?;
            store_block(tree, &block)?;
            state.current_block = block;
            state.reset_round(ctx.height);
            set_runtime_state(tree, &state)?;
            debug!(
                runtime = %runtime.id,
                round = state.current_block.header.round,
                epoch = ctx.epoch,
                "epoch transition block"
            );
        }
    }
    Ok(())
}
