//! Registry transaction handlers and epoch-transition work.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::context::Context;
use crate::crypto::{context_with_chain, Address, PublicKey};
use crate::encoding;
use crate::epochtime::EpochTime;
use crate::errors::{ChainError, ChainResult};
use crate::genesis;
use crate::mkvs::Tree;
use crate::quantity::Quantity;
use crate::staking::{self, ThresholdKind};

use super::state::{self, PendingClaimRelease};
use super::{
    event_kind, method, op, sigctx, DeregisterEntity, EntityEvent, MaintenancePrepay,
    MultiSignedNode, Node, NodeEvent, NodeUnfrozenEvent, RolesMask, RuntimeEvent, RuntimeKind,
    SignedEntity, SignedRuntime, UnfreezeNode, MODULE, NODE_DESCRIPTOR_VERSION_MAX,
    NODE_DESCRIPTOR_VERSION_MIN, ROLE_KEY_MANAGER, ROLE_VALIDATOR,
};

pub fn dispatch(ctx: &mut Context, tree: &mut Tree, method: &str, body: &[u8]) -> ChainResult<()> {
    match method {
        method::REGISTER_ENTITY => register_entity(ctx, tree, &encoding::from_slice(body)?),
        method::DEREGISTER_ENTITY => {
            let _body: DeregisterEntity = encoding::from_slice(body)?;
            deregister_entity(ctx, tree)
        }
        method::REGISTER_NODE => register_node(ctx, tree, &encoding::from_slice(body)?),
        method::UNFREEZE_NODE => unfreeze_node(ctx, tree, &encoding::from_slice(body)?),
        method::REGISTER_RUNTIME => register_runtime(ctx, tree, &encoding::from_slice(body)?),
        other => Err(ChainError::InvalidArgument(format!(
            "registry: unknown method {other}"
        ))),
    }
}

/// Claim identifier for the per-entity registration claim.
fn entity_claim() -> String {
    "registry.entity".to_string()
}

fn node_claim(id: &PublicKey) -> String {
    format!("registry.node.{id}")
}

fn runtime_claim(id: &super::Namespace) -> String {
    format!("registry.runtime.{id}")
}

fn threshold_kinds(roles: RolesMask) -> BTreeSet<ThresholdKind> {
    let mut kinds = BTreeSet::new();
    if roles.contains(ROLE_VALIDATOR) {
        kinds.insert(ThresholdKind::Validator);
    }
    if roles.contains(super::ROLE_COMPUTE_WORKER)
        || roles.contains(super::ROLE_MERGE_WORKER)
        || roles.contains(super::ROLE_TXN_SCHEDULER)
    {
        kinds.insert(ThresholdKind::ComputeWorker);
    }
    if roles.contains(super::ROLE_STORAGE_WORKER) {
        kinds.insert(ThresholdKind::StorageWorker);
    }
    if roles.contains(ROLE_KEY_MANAGER) {
        kinds.insert(ThresholdKind::KeyManager);
    }
    kinds
}

fn add_entity_claim(
    tree: &mut Tree,
    entity_id: &PublicKey,
    claim: String,
    kinds: BTreeSet<ThresholdKind>,
) -> ChainResult<()> {
    let thresholds = staking::state::params(tree)?.thresholds;
    let addr = Address::from_public_key(entity_id);
    let mut account = staking::state::account(tree, &addr)?;
    account
        .escrow
        .stake_accumulator
        .add_claim(claim, kinds, &thresholds, &account.escrow.active.balance)
        .map_err(|err| match err {
            ChainError::InsufficientStake(_) => {
                ChainError::InsufficientStake("registry: insufficient stake for claim".into())
            }
            other => other,
        })?;
    staking::state::set_account(tree, &addr, &account)
}

fn remove_entity_claim(tree: &mut Tree, entity_id: &PublicKey, claim: &str) -> ChainResult<()> {
    let addr = Address::from_public_key(entity_id);
    let mut account = staking::state::account(tree, &addr)?;
    account.escrow.stake_accumulator.remove_claim(claim)?;
    staking::state::set_account(tree, &addr, &account)
}

pub fn register_entity(ctx: &mut Context, tree: &mut Tree, signed: &SignedEntity) -> ChainResult<()> {
    let params = state::params(tree)?;
    ctx.gas.use_gas(1, op::REGISTER_ENTITY, &params.gas_costs)?;

    let chain = genesis::chain_context(tree)?;
    signed.verify(&context_with_chain(sigctx::REGISTER_ENTITY, &chain))?;
    let entity = &signed.entity;

    if ctx.signer()? != entity.id {
        return Err(ChainError::Forbidden(
            "registry: entity registration not submitted by entity".into(),
        ));
    }

    // Re-registration fully replaces the descriptor, but live nodes may only
    // be dropped from the list when entity-signed nodes were and remain
    // disallowed.
    if let Some(existing) = state::entity(tree, &entity.id)? {
        let keeps_disallowing =
            !existing.allow_entity_signed_nodes && !entity.allow_entity_signed_nodes;
        if !keeps_disallowing {
            for node_id in &existing.nodes {
                if entity.nodes.contains(node_id) {
                    continue;
                }
                if let Some(node) = state::node(tree, node_id)? {
                    if node.expiration >= ctx.epoch {
                        return Err(ChainError::Forbidden(format!(
                            "registry: cannot drop node {node_id} within its validity window"
                        )));
                    }
                }
            }
        }
    }

    add_entity_claim(tree, &entity.id, entity_claim(), [ThresholdKind::Entity].into())?;
    state::set_entity(tree, entity)?;

    info!(id = %entity.id, "registered entity");
    ctx.emit(
        MODULE,
        event_kind::ENTITY,
        &EntityEvent {
            id: entity.id,
            is_registration: true,
        },
    )
}

pub fn deregister_entity(ctx: &mut Context, tree: &mut Tree) -> ChainResult<()> {
    let params = state::params(tree)?;
    ctx.gas.use_gas(1, op::DEREGISTER_ENTITY, &params.gas_costs)?;

    let id = ctx.signer()?;
    let entity = state::entity(tree, &id)?
        .ok_or_else(|| ChainError::NotFound("registry: no such entity".into()))?;

    for node in state::nodes(tree)? {
        if node.entity_id == id {
            return Err(ChainError::Forbidden(
                "registry: entity still controls nodes".into(),
            ));
        }
    }

    // Bound stake beyond the entity's own registration claim blocks
    // deregistration: node claims pending release, runtime deposits.
    let addr = Address::from_public_key(&id);
    let account = staking::state::account(tree, &addr)?;
    let foreign_claims = account
        .escrow
        .stake_accumulator
        .claims
        .keys()
        .any(|claim| claim != &entity_claim());
    if foreign_claims {
        return Err(ChainError::Forbidden(
            "registry: entity still has bound stake".into(),
        ));
    }

    remove_entity_claim(tree, &id, &entity_claim())?;
    state::remove_entity(tree, &id);

    info!(id = %entity.id, "deregistered entity");
    ctx.emit(
        MODULE,
        event_kind::ENTITY,
        &EntityEvent {
            id,
            is_registration: false,
        },
    )
}

pub fn register_node(ctx: &mut Context, tree: &mut Tree, signed: &MultiSignedNode) -> ChainResult<()> {
    let params = state::params(tree)?;
    ctx.gas.use_gas(1, op::REGISTER_NODE, &params.gas_costs)?;

    let chain = genesis::chain_context(tree)?;
    let entity_cosigned = signed.verify(&context_with_chain(sigctx::REGISTER_NODE, &chain))?;
    let node = &signed.node;

    if node.version < NODE_DESCRIPTOR_VERSION_MIN || node.version > NODE_DESCRIPTOR_VERSION_MAX {
        return Err(ChainError::InvalidArgument(format!(
            "registry: unsupported node descriptor version {}",
            node.version
        )));
    }
    node.roles.validate()?;

    let entity = state::entity(tree, &node.entity_id)?
        .ok_or_else(|| ChainError::NotFound("registry: unknown entity in node registration".into()))?;
    let listed = entity.nodes.contains(&node.id);
    if entity_cosigned && !entity.allow_entity_signed_nodes {
        return Err(ChainError::Forbidden(
            "registry: entity-signed node descriptors not allowed".into(),
        ));
    }
    if !listed && !entity_cosigned {
        return Err(ChainError::Forbidden(
            "registry: node neither listed by entity nor entity-signed".into(),
        ));
    }

    let submitter = ctx.signer()?;
    if submitter != node.id && submitter != node.entity_id {
        return Err(ChainError::Forbidden(
            "registry: node registration not submitted by node or entity".into(),
        ));
    }

    if node.expiration < ctx.epoch {
        return Err(ChainError::InvalidArgument(
            "registry: node descriptor already expired".into(),
        ));
    }
    if node.expiration > ctx.epoch.saturating_add(params.max_node_expiration) {
        return Err(ChainError::InvalidArgument(format!(
            "registry: node expiration {} exceeds maximum {}",
            node.expiration,
            ctx.epoch.saturating_add(params.max_node_expiration)
        )));
    }

    validate_role_runtime_consistency(tree, node)?;

    if let Some(existing) = state::node(tree, &node.id)? {
        if existing.entity_id != node.entity_id {
            return Err(ChainError::Forbidden(
                "registry: node cannot change controlling entity".into(),
            ));
        }
    }

    // Admission, suspension and maintenance prepayment, per listed runtime.
    let coverage = node.expiration - ctx.epoch;
    let mut fee_total = Quantity::zero();
    let mut resumed = Vec::new();
    for node_runtime in &node.runtimes {
        let runtime = state::runtime(tree, &node_runtime.id)?.ok_or_else(|| {
            ChainError::NotFound(format!("registry: no such runtime {}", node_runtime.id))
        })?;
        if !runtime.admission_policy.admits(&node.entity_id) {
            return Err(ChainError::Forbidden(format!(
                "registry: admission policy of {} rejects entity",
                runtime.id
            )));
        }
        if state::is_suspended(tree, &runtime.id) {
            if coverage == 0 {
                return Err(ChainError::Forbidden(format!(
                    "registry: runtime {} is suspended and registration pays no maintenance",
                    runtime.id
                )));
            }
            resumed.push(runtime.id);
        }
        let mut fee = params.runtime_maintenance_fee_per_epoch.clone();
        fee.mul(&Quantity::from_u64(coverage));
        fee_total.add(&fee);
    }

    if !fee_total.is_zero() {
        let payer = ctx.signer_address()?;
        let mut account = staking::state::account(tree, &payer)?;
        account.general.balance.sub(&fee_total).map_err(|_| {
            ChainError::InsufficientBalance("registry: cannot pay maintenance fees".into())
        })?;
        staking::state::set_account(tree, &payer, &account)?;
        let mut pool = staking::state::common_pool(tree)?;
        pool.add(&fee_total);
        staking::state::set_common_pool(tree, &pool)?;
    }
    for node_runtime in &node.runtimes {
        state::set_maintenance_prepay(
            tree,
            &node_runtime.id,
            &node.id,
            &MaintenancePrepay {
                epochs_remaining: coverage,
            },
        )?;
    }
    for id in resumed {
        state::set_suspended(tree, &id, false);
        info!(runtime = %id, "runtime resumed by node registration");
        ctx.emit(
            MODULE,
            event_kind::RUNTIME,
            &RuntimeEvent {
                id,
                suspended: false,
            },
        )?;
    }

    add_entity_claim(
        tree,
        &node.entity_id,
        node_claim(&node.id),
        threshold_kinds(node.roles),
    )?;
    state::set_node(tree, node)?;

    debug!(id = %node.id, entity = %node.entity_id, expiration = node.expiration, "registered node");
    ctx.emit(
        MODULE,
        event_kind::NODE,
        &NodeEvent {
            id: node.id,
            is_registration: true,
        },
    )
}

fn validate_role_runtime_consistency(tree: &Tree, node: &Node) -> ChainResult<()> {
    let mut has_non_km_runtime = false;
    for node_runtime in &node.runtimes {
        match state::runtime(tree, &node_runtime.id)? {
            Some(runtime) if runtime.kind == RuntimeKind::KeyManager => {}
            Some(_) => has_non_km_runtime = true,
            None => {
                return Err(ChainError::NotFound(format!(
                    "registry: no such runtime {}",
                    node_runtime.id
                )))
            }
        }
    }

    if node.roles.contains(ROLE_KEY_MANAGER) {
        if node.runtimes.is_empty() || has_non_km_runtime {
            return Err(ChainError::InvalidArgument(
                "registry: key manager node must list only key manager runtimes".into(),
            ));
        }
    } else if node.roles.has_compute_roles() {
        if !has_non_km_runtime {
            return Err(ChainError::InvalidArgument(
                "registry: compute node must list at least one compute runtime".into(),
            ));
        }
    } else if !node.runtimes.is_empty() {
        // Validator-only nodes list no runtimes.
        return Err(ChainError::InvalidArgument(
            "registry: validator node must not list runtimes".into(),
        ));
    }
    Ok(())
}

pub fn unfreeze_node(ctx: &mut Context, tree: &mut Tree, body: &UnfreezeNode) -> ChainResult<()> {
    let params = state::params(tree)?;
    ctx.gas.use_gas(1, op::UNFREEZE_NODE, &params.gas_costs)?;

    let node = state::node(tree, &body.node_id)?
        .ok_or_else(|| ChainError::NotFound("registry: no such node".into()))?;
    if ctx.signer()? != node.entity_id {
        return Err(ChainError::Forbidden(
            "registry: unfreeze not signed by node's entity".into(),
        ));
    }

    let mut status = state::node_status(tree, &body.node_id)?;
    match status.frozen_until {
        None => Ok(()),
        Some(end) if ctx.epoch < end => Err(ChainError::Forbidden(format!(
            "registry: node frozen until epoch {end}"
        ))),
        Some(_) => {
            status.frozen_until = None;
            state::set_node_status(tree, &body.node_id, &status)?;
            info!(id = %body.node_id, "node unfrozen");
            ctx.emit(
                MODULE,
                event_kind::NODE_UNFROZEN,
                &NodeUnfrozenEvent {
                    node_id: body.node_id,
                },
            )
        }
    }
}

/// Internally invoked when consensus-layer evidence condemns a node.
pub fn freeze_node(tree: &mut Tree, node_id: &PublicKey, until: EpochTime) -> ChainResult<()> {
    let mut status = state::node_status(tree, node_id)?;
    status.frozen_until = Some(until);
    state::set_node_status(tree, node_id, &status)?;
    warn!(id = %node_id, until, "froze node");
    Ok(())
}

pub fn register_runtime(ctx: &mut Context, tree: &mut Tree, signed: &SignedRuntime) -> ChainResult<()> {
    let params = state::params(tree)?;
    ctx.gas.use_gas(1, op::REGISTER_RUNTIME, &params.gas_costs)?;

    let chain = genesis::chain_context(tree)?;
    signed.verify(&context_with_chain(sigctx::REGISTER_RUNTIME, &chain))?;
    let runtime = &signed.runtime;

    if ctx.signer()? != runtime.entity_id {
        return Err(ChainError::Forbidden(
            "registry: runtime registration not submitted by entity".into(),
        ));
    }
    state::entity(tree, &runtime.entity_id)?
        .ok_or_else(|| ChainError::NotFound("registry: unknown entity in runtime registration".into()))?;

    if !runtime.id.is_test() && !params.debug_allow_non_test_runtimes {
        return Err(ChainError::Forbidden(
            "registry: non-test runtime identifiers not allowed".into(),
        ));
    }

    if let Some(km) = &runtime.key_manager {
        match state::runtime(tree, km)? {
            Some(manager) if manager.kind == RuntimeKind::KeyManager => {}
            Some(_) => {
                return Err(ChainError::InvalidArgument(
                    "registry: key manager reference is not a key manager runtime".into(),
                ))
            }
            None => {
                return Err(ChainError::NotFound(
                    "registry: referenced key manager runtime not registered".into(),
                ))
            }
        }
    }

    if let Some(existing) = state::runtime(tree, &runtime.id)? {
        if existing.entity_id != runtime.entity_id {
            return Err(ChainError::Forbidden(
                "registry: runtime cannot change controlling entity".into(),
            ));
        }
    }

    // Refundable deposit, held as a stake-accumulator claim.
    add_entity_claim(
        tree,
        &runtime.entity_id,
        runtime_claim(&runtime.id),
        [ThresholdKind::Runtime].into(),
    )?;
    state::set_runtime(tree, runtime)?;
    crate::roothash::round::ensure_genesis_block(ctx, tree, runtime, true)?;

    info!(id = %runtime.id, kind = ?runtime.kind, "registered runtime");
    ctx.emit(
        MODULE,
        event_kind::RUNTIME,
        &RuntimeEvent {
            id: runtime.id,
            suspended: false,
        },
    )
}

/// Epoch-transition work: drop expired nodes and release stake claims whose
/// debonding window has elapsed.
pub fn on_epoch_transition(ctx: &mut Context, tree: &mut Tree) -> ChainResult<()> {
    let debonding_interval = staking::state::params(tree)?.debonding_interval;

    for node in state::nodes(tree)? {
        if node.expiration >= ctx.epoch {
            continue;
        }
        state::remove_node(tree, &node.id);
        for node_runtime in &node.runtimes {
            state::set_maintenance_prepay(
                tree,
                &node_runtime.id,
                &node.id,
                &MaintenancePrepay { epochs_remaining: 0 },
            )?;
        }
        state::push_claim_release(
            tree,
            ctx.epoch.saturating_add(debonding_interval),
            &PendingClaimRelease {
                node_id: node.id,
                entity_id: node.entity_id,
            },
        )?;
        debug!(id = %node.id, expiration = node.expiration, "expired node");
        ctx.emit(
            MODULE,
            event_kind::NODE,
            &NodeEvent {
                id: node.id,
                is_registration: false,
            },
        )?;
    }

    for release in state::take_due_claim_releases(tree, ctx.epoch)? {
        // The node may have re-registered since; its claim is live again.
        if state::node(tree, &release.node_id)?.is_some() {
            continue;
        }
        match remove_entity_claim(tree, &release.entity_id, &node_claim(&release.node_id)) {
            Ok(()) | Err(ChainError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Default freeze window applied on consensus equivocation, when the slashing
/// parameters do not specify one.
pub fn equivocation_freeze_end(ctx: &Context, interval: EpochTime) -> EpochTime {
    if interval == 0 {
        super::FREEZE_FOREVER
    } else {
        ctx.epoch.saturating_add(interval)
    }
}

/// Seeds the registry from the genesis document. Descriptors were verified
/// during the document sanity check with the unbound base contexts; this
/// installs them, their stake claims and their maintenance coverage without
/// charging registration fees (genesis balances already account for them).
pub fn init_genesis(
    ctx: &mut Context,
    tree: &mut Tree,
    genesis: &super::state::Genesis,
) -> ChainResult<()> {
    state::set_params(tree, &genesis.params)?;

    for signed in &genesis.entities {
        signed.verify(sigctx::REGISTER_ENTITY)?;
        add_entity_claim(
            tree,
            &signed.entity.id,
            entity_claim(),
            [ThresholdKind::Entity].into(),
        )?;
        state::set_entity(tree, &signed.entity)?;
    }

    for signed in &genesis.runtimes {
        signed.verify(sigctx::REGISTER_RUNTIME)?;
        add_entity_claim(
            tree,
            &signed.runtime.entity_id,
            runtime_claim(&signed.runtime.id),
            [ThresholdKind::Runtime].into(),
        )?;
        state::set_runtime(tree, &signed.runtime)?;
        crate::roothash::round::ensure_genesis_block(ctx, tree, &signed.runtime, false)?;
    }

    for signed in &genesis.nodes {
        signed.verify(sigctx::REGISTER_NODE)?;
        let node = &signed.node;
        node.roles.validate()?;
        if node.expiration < ctx.epoch {
            return Err(ChainError::Config(format!(
                "registry: genesis node {} already expired",
                node.id
            )));
        }
        add_entity_claim(
            tree,
            &node.entity_id,
            node_claim(&node.id),
            threshold_kinds(node.roles),
        )?;
        let coverage = node.expiration - ctx.epoch;
        for node_runtime in &node.runtimes {
            state::set_maintenance_prepay(
                tree,
                &node_runtime.id,
                &node.id,
                &MaintenancePrepay {
                    epochs_remaining: coverage,
                },
            )?;
        }
        state::set_node(tree, node)?;
    }

    for suspended in &genesis.suspended_runtimes {
        state::set_suspended(tree, suspended, true);
    }
    Ok(())
}
