//! Staking transaction handlers.
//!
//! Every handler charges gas from the consensus parameter table before any
//! state change. Handlers mutate the tree directly; the dispatcher wraps each
//! transaction in a store checkpoint, so a returned error rolls back all of a
//! handler's writes.

use tracing::debug;

use crate::context::Context;
use crate::encoding;
use crate::errors::{ChainError, ChainResult};
use crate::mkvs::Tree;
use crate::quantity::{move_tokens, Quantity};

use super::state;
use super::{
    event_kind, method, op, AddEscrowEvent, AmendCommissionSchedule, Burn, BurnEvent,
    ConsensusParameters, DebondingDelegation, Escrow, ReclaimEscrow, Transfer, TransferEvent,
    MODULE,
};

pub fn dispatch(ctx: &mut Context, tree: &mut Tree, method: &str, body: &[u8]) -> ChainResult<()> {
    match method {
        method::TRANSFER => transfer(ctx, tree, &encoding::from_slice(body)?),
        method::BURN => burn(ctx, tree, &encoding::from_slice(body)?),
        method::ADD_ESCROW => add_escrow(ctx, tree, &encoding::from_slice(body)?),
        method::RECLAIM_ESCROW => reclaim_escrow(ctx, tree, &encoding::from_slice(body)?),
        method::AMEND_COMMISSION_SCHEDULE => {
            amend_commission_schedule(ctx, tree, &encoding::from_slice(body)?)
        }
        other => Err(ChainError::InvalidArgument(format!(
            "staking: unknown method {other}"
        ))),
    }
}

fn transfer_permitted(params: &ConsensusParameters, from: &crate::crypto::Address) -> bool {
    !params.disable_transfers || params.undisable_transfers_from.contains(from)
}

pub fn transfer(ctx: &mut Context, tree: &mut Tree, xfer: &Transfer) -> ChainResult<()> {
    let params = state::params(tree)?;
    ctx.gas.use_gas(1, op::TRANSFER, &params.gas_costs)?;

    let from_addr = ctx.signer_address()?;
    if !transfer_permitted(&params, &from_addr) {
        return Err(ChainError::Forbidden("staking: transfers disabled".into()));
    }
    if xfer.to.is_reserved() {
        return Err(ChainError::Forbidden(
            "staking: transfer to reserved address".into(),
        ));
    }

    let mut from = state::account(tree, &from_addr)?;
    if from_addr == xfer.to {
        // Self-transfer is a balance check only.
        if from.general.balance < xfer.tokens {
            return Err(ChainError::InsufficientBalance(
                "staking: insufficient balance".into(),
            ));
        }
    } else {
        let mut to = state::account(tree, &xfer.to)?;
        move_tokens(&mut to.general.balance, &mut from.general.balance, &xfer.tokens).map_err(
            |_| ChainError::InsufficientBalance("staking: insufficient balance".into()),
        )?;
        state::set_account(tree, &xfer.to, &to)?;
    }
    state::set_account(tree, &from_addr, &from)?;

    debug!(from = %from_addr, to = %xfer.to, amount = %xfer.tokens, "executed transfer");
    ctx.emit(
        MODULE,
        event_kind::TRANSFER,
        &TransferEvent {
            from: from_addr,
            to: xfer.to,
            tokens: xfer.tokens.clone(),
        },
    )
}

pub fn burn(ctx: &mut Context, tree: &mut Tree, burn: &Burn) -> ChainResult<()> {
    let params = state::params(tree)?;
    ctx.gas.use_gas(1, op::BURN, &params.gas_costs)?;

    let from_addr = ctx.signer_address()?;
    let mut from = state::account(tree, &from_addr)?;
    from.general
        .balance
        .sub(&burn.tokens)
        .map_err(|_| ChainError::InsufficientBalance("staking: insufficient balance".into()))?;

    let mut supply = state::total_supply(tree)?;
    supply
        .sub(&burn.tokens)
        .map_err(|_| ChainError::Fatal("staking: total supply underflow".into()))?;

    state::set_account(tree, &from_addr, &from)?;
    state::set_total_supply(tree, &supply)?;

    debug!(from = %from_addr, amount = %burn.tokens, "burnt tokens");
    ctx.emit(
        MODULE,
        event_kind::BURN,
        &BurnEvent {
            owner: from_addr,
            tokens: burn.tokens.clone(),
        },
    )
}

pub fn add_escrow(ctx: &mut Context, tree: &mut Tree, escrow: &Escrow) -> ChainResult<()> {
    let params = state::params(tree)?;
    ctx.gas.use_gas(1, op::ADD_ESCROW, &params.gas_costs)?;

    if escrow.tokens < params.min_delegation_amount {
        return Err(ChainError::InvalidArgument(
            "staking: escrow below minimum delegation amount".into(),
        ));
    }
    if escrow.account.is_reserved() {
        return Err(ChainError::Forbidden(
            "staking: escrow to reserved address".into(),
        ));
    }

    let from_addr = ctx.signer_address()?;
    let mut delegation = state::delegation(tree, &from_addr, &escrow.account)?;

    if from_addr == escrow.account {
        // Self-escrow is always allowed; account aliasing handled through
        // disjoint field borrows.
        let mut account = state::account(tree, &from_addr)?;
        let super::Account { general, escrow: esc } = &mut account;
        esc.active
            .deposit(&mut delegation.shares, &mut general.balance, &escrow.tokens)
            .map_err(insufficient_balance)?;
        state::set_account(tree, &from_addr, &account)?;
    } else {
        if params.disable_delegation {
            return Err(ChainError::Forbidden("staking: delegation disabled".into()));
        }
        let mut from = state::account(tree, &from_addr)?;
        let mut to = state::account(tree, &escrow.account)?;
        to.escrow
            .active
            .deposit(&mut delegation.shares, &mut from.general.balance, &escrow.tokens)
            .map_err(insufficient_balance)?;
        state::set_account(tree, &from_addr, &from)?;
        state::set_account(tree, &escrow.account, &to)?;
    }
    state::set_delegation(tree, &from_addr, &escrow.account, &delegation)?;

    debug!(from = %from_addr, escrow = %escrow.account, amount = %escrow.tokens, "escrowed tokens");
    ctx.emit(
        MODULE,
        event_kind::ADD_ESCROW,
        &AddEscrowEvent {
            owner: from_addr,
            escrow: escrow.account,
            tokens: escrow.tokens.clone(),
        },
    )
}

pub fn reclaim_escrow(ctx: &mut Context, tree: &mut Tree, reclaim: &ReclaimEscrow) -> ChainResult<()> {
    // No sense if there is nothing to reclaim.
    if reclaim.shares.is_zero() {
        return Err(ChainError::InvalidArgument(
            "staking: reclaim of zero shares".into(),
        ));
    }

    let params = state::params(tree)?;
    ctx.gas.use_gas(1, op::RECLAIM_ESCROW, &params.gas_costs)?;

    let to_addr = ctx.signer_address()?;
    let to = state::account(tree, &to_addr)?;
    let mut delegation = state::delegation(tree, &to_addr, &reclaim.account)?;

    let mut deb = DebondingDelegation {
        shares: Quantity::zero(),
        debond_end: ctx.epoch.saturating_add(params.debonding_interval),
    };

    let reclaim_one = |from: &mut super::Account,
                       delegation: &mut super::Delegation,
                       deb: &mut DebondingDelegation|
     -> ChainResult<()> {
        let mut tokens = Quantity::zero();
        from.escrow
            .active
            .withdraw(&mut tokens, &mut delegation.shares, &reclaim.shares)?;
        let amount = tokens.clone();
        from.escrow
            .debonding
            .deposit(&mut deb.shares, &mut tokens, &amount)?;
        if !tokens.is_zero() {
            return Err(ChainError::Fatal(
                "staking: residue moving tokens from active to debonding".into(),
            ));
        }
        // The escrow's remaining active stake must still cover its claims.
        from.escrow
            .stake_accumulator
            .check_balance(&params.thresholds, &from.escrow.active.balance)
            .map_err(|_| {
                ChainError::InsufficientStake(
                    "staking: reclaim under accumulated stake claims".into(),
                )
            })?;
        Ok(())
    };

    if to_addr == reclaim.account {
        let mut account = state::account(tree, &to_addr)?;
        reclaim_one(&mut account, &mut delegation, &mut deb)?;
        state::set_account(tree, &to_addr, &account)?;
    } else {
        if params.disable_delegation {
            return Err(ChainError::Forbidden("staking: delegation disabled".into()));
        }
        let mut from = state::account(tree, &reclaim.account)?;
        reclaim_one(&mut from, &mut delegation, &mut deb)?;
        state::set_account(tree, &reclaim.account, &from)?;
    }

    // The current account nonce is the final disambiguator, preventing
    // overwrites when the same pair reclaims repeatedly.
    state::set_debonding_delegation(tree, &to_addr, &reclaim.account, to.general.nonce, &deb)?;
    state::set_delegation(tree, &to_addr, &reclaim.account, &delegation)?;

    debug!(
        owner = %to_addr,
        escrow = %reclaim.account,
        shares = %reclaim.shares,
        end = deb.debond_end,
        "began debonding"
    );
    Ok(())
}

pub fn amend_commission_schedule(
    ctx: &mut Context,
    tree: &mut Tree,
    amend: &AmendCommissionSchedule,
) -> ChainResult<()> {
    let params = state::params(tree)?;
    ctx.gas
        .use_gas(1, op::AMEND_COMMISSION_SCHEDULE, &params.gas_costs)?;

    let from_addr = ctx.signer_address()?;
    let mut from = state::account(tree, &from_addr)?;

    // Work on a copy; a failing amendment must leave the schedule unchanged.
    let mut schedule = from.escrow.commission_schedule.clone();
    schedule.amend_and_prune_and_validate(
        &amend.amendment,
        &params.commission_schedule_rules,
        ctx.epoch,
    )?;
    from.escrow.commission_schedule = schedule;
    state::set_account(tree, &from_addr, &from)?;
    Ok(())
}

fn insufficient_balance(err: ChainError) -> ChainError {
    match err {
        ChainError::InsufficientBalance(_) => {
            ChainError::InsufficientBalance("staking: insufficient balance".into())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::super::{state as staking_state, ThresholdKind};
    use super::*;
    use crate::crypto::{Address, Hash, PublicKey, COMMON_POOL_ADDRESS};
    use crate::gas::GasMeter;

    fn signer(tag: u8) -> PublicKey {
        PublicKey([tag; 32])
    }

    fn setup(params: ConsensusParameters) -> Tree {
        let mut tree = Tree::new(4);
        staking_state::set_params(&mut tree, &params).unwrap();
        tree
    }

    fn tx_ctx(epoch: u64, pk: PublicKey) -> Context {
        Context::for_block(1, 0, epoch, false).for_tx(pk, Hash::digest(b"tx"), GasMeter::unlimited())
    }

    fn fund(tree: &mut Tree, addr: &Address, amount: u64) {
        let mut account = staking_state::account(tree, addr).unwrap();
        account.general.balance = Quantity::from_u64(amount);
        staking_state::set_account(tree, addr, &account).unwrap();
    }

    fn zero_thresholds() -> BTreeMap<ThresholdKind, Quantity> {
        ThresholdKind::ALL
            .into_iter()
            .map(|kind| (kind, Quantity::zero()))
            .collect()
    }

    #[test]
    fn escrow_and_reclaim_follow_share_math() {
        let params = ConsensusParameters {
            thresholds: zero_thresholds(),
            debonding_interval: 3,
            ..Default::default()
        };
        let mut tree = setup(params);
        let pk = signer(1);
        let addr = Address::from_public_key(&pk);
        fund(&mut tree, &addr, 1_000);

        let mut ctx = tx_ctx(10, pk);
        add_escrow(
            &mut ctx,
            &mut tree,
            &Escrow {
                account: addr,
                tokens: Quantity::from_u64(300),
            },
        )
        .unwrap();

        let account = staking_state::account(&tree, &addr).unwrap();
        assert_eq!(account.general.balance, Quantity::from_u64(700));
        assert_eq!(account.escrow.active.balance, Quantity::from_u64(300));
        assert_eq!(account.escrow.active.total_shares, Quantity::from_u64(300));
        let delegation = staking_state::delegation(&tree, &addr, &addr).unwrap();
        assert_eq!(delegation.shares, Quantity::from_u64(300));

        reclaim_escrow(
            &mut ctx,
            &mut tree,
            &ReclaimEscrow {
                account: addr,
                shares: Quantity::from_u64(150),
            },
        )
        .unwrap();

        let account = staking_state::account(&tree, &addr).unwrap();
        assert_eq!(account.escrow.active.balance, Quantity::from_u64(150));
        assert_eq!(account.escrow.active.total_shares, Quantity::from_u64(150));
        assert_eq!(account.escrow.debonding.balance, Quantity::from_u64(150));
        assert_eq!(account.escrow.debonding.total_shares, Quantity::from_u64(150));
        let debs = staking_state::debonding_delegations_for(&tree, &addr).unwrap();
        assert_eq!(debs.len(), 1);
        let (escrow, _nonce, deb) = &debs[0];
        assert_eq!(*escrow, addr);
        assert_eq!(deb.shares, Quantity::from_u64(150));
        assert_eq!(deb.debond_end, 13);
    }

    #[test]
    fn zero_share_reclaim_is_rejected() {
        let mut tree = setup(ConsensusParameters::default());
        let pk = signer(1);
        let mut ctx = tx_ctx(0, pk);
        let err = reclaim_escrow(
            &mut ctx,
            &mut tree,
            &ReclaimEscrow {
                account: Address::from_public_key(&pk),
                shares: Quantity::zero(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ChainError::InvalidArgument(_)));
    }

    #[test]
    fn transfer_moves_balances_and_emits() {
        let mut tree = setup(ConsensusParameters::default());
        let pk = signer(1);
        let from = Address::from_public_key(&pk);
        let to = Address([9; 20]);
        fund(&mut tree, &from, 100);

        let mut ctx = tx_ctx(0, pk);
        transfer(
            &mut ctx,
            &mut tree,
            &Transfer {
                to,
                tokens: Quantity::from_u64(40),
            },
        )
        .unwrap();
        assert_eq!(
            staking_state::account(&tree, &from).unwrap().general.balance,
            Quantity::from_u64(60)
        );
        assert_eq!(
            staking_state::account(&tree, &to).unwrap().general.balance,
            Quantity::from_u64(40)
        );
        let events = ctx.take_events();
        assert_eq!(events.len(), 1);
        let event: TransferEvent = events[0].decode().unwrap();
        assert_eq!(event.tokens, Quantity::from_u64(40));

        let err = transfer(
            &mut ctx,
            &mut tree,
            &Transfer {
                to,
                tokens: Quantity::from_u64(61),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ChainError::InsufficientBalance(_)));
    }

    #[test]
    fn disabled_transfers_respect_whitelist() {
        let pk = signer(1);
        let from = Address::from_public_key(&pk);
        let mut params = ConsensusParameters {
            disable_transfers: true,
            ..Default::default()
        };
        params.undisable_transfers_from.insert(from);
        let mut tree = setup(params);
        fund(&mut tree, &from, 10);

        let mut ctx = tx_ctx(0, pk);
        transfer(
            &mut ctx,
            &mut tree,
            &Transfer {
                to: Address([2; 20]),
                tokens: Quantity::from_u64(1),
            },
        )
        .unwrap();

        let other = signer(3);
        fund(&mut tree, &Address::from_public_key(&other), 10);
        let mut ctx = tx_ctx(0, other);
        let err = transfer(
            &mut ctx,
            &mut tree,
            &Transfer {
                to: Address([2; 20]),
                tokens: Quantity::from_u64(1),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ChainError::Forbidden(_)));
    }

    #[test]
    fn transfer_to_reserved_address_is_forbidden() {
        let mut tree = setup(ConsensusParameters::default());
        let pk = signer(1);
        fund(&mut tree, &Address::from_public_key(&pk), 10);
        let mut ctx = tx_ctx(0, pk);
        let err = transfer(
            &mut ctx,
            &mut tree,
            &Transfer {
                to: COMMON_POOL_ADDRESS,
                tokens: Quantity::from_u64(1),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ChainError::Forbidden(_)));
    }

    #[test]
    fn burn_reduces_total_supply() {
        let mut tree = setup(ConsensusParameters::default());
        let pk = signer(1);
        let addr = Address::from_public_key(&pk);
        fund(&mut tree, &addr, 100);
        staking_state::set_total_supply(&mut tree, &Quantity::from_u64(100)).unwrap();

        let mut ctx = tx_ctx(0, pk);
        burn(
            &mut ctx,
            &mut tree,
            &Burn {
                tokens: Quantity::from_u64(30),
            },
        )
        .unwrap();
        assert_eq!(
            staking_state::total_supply(&tree).unwrap(),
            Quantity::from_u64(70)
        );
        assert_eq!(
            staking_state::account(&tree, &addr).unwrap().general.balance,
            Quantity::from_u64(70)
        );
    }

    #[test]
    fn repeated_reclaims_use_distinct_nonces() {
        let params = ConsensusParameters {
            thresholds: zero_thresholds(),
            debonding_interval: 5,
            ..Default::default()
        };
        let mut tree = setup(params);
        let pk = signer(1);
        let addr = Address::from_public_key(&pk);
        fund(&mut tree, &addr, 1_000);

        let mut ctx = tx_ctx(0, pk);
        add_escrow(
            &mut ctx,
            &mut tree,
            &Escrow {
                account: addr,
                tokens: Quantity::from_u64(400),
            },
        )
        .unwrap();

        for nonce in 0..2u64 {
            // The envelope layer bumps the account nonce between reclaims.
            let mut account = staking_state::account(&tree, &addr).unwrap();
            account.general.nonce = nonce;
            staking_state::set_account(&mut tree, &addr, &account).unwrap();
            reclaim_escrow(
                &mut ctx,
                &mut tree,
                &ReclaimEscrow {
                    account: addr,
                    shares: Quantity::from_u64(100),
                },
            )
            .unwrap();
        }
        let debs = staking_state::debonding_delegations_for(&tree, &addr).unwrap();
        assert_eq!(debs.len(), 2);
        assert_ne!(debs[0].1, debs[1].1);
    }

    #[test]
    fn reclaim_under_stake_claims_fails() {
        let mut params = ConsensusParameters {
            thresholds: zero_thresholds(),
            debonding_interval: 1,
            ..Default::default()
        };
        params
            .thresholds
            .insert(ThresholdKind::Entity, Quantity::from_u64(250));
        let mut tree = setup(params.clone());
        let pk = signer(1);
        let addr = Address::from_public_key(&pk);
        fund(&mut tree, &addr, 1_000);

        let mut ctx = tx_ctx(0, pk);
        add_escrow(
            &mut ctx,
            &mut tree,
            &Escrow {
                account: addr,
                tokens: Quantity::from_u64(300),
            },
        )
        .unwrap();
        let mut account = staking_state::account(&tree, &addr).unwrap();
        account
            .escrow
            .stake_accumulator
            .add_claim(
                "registry.entity".into(),
                [ThresholdKind::Entity].into(),
                &params.thresholds,
                &account.escrow.active.balance,
            )
            .unwrap();
        staking_state::set_account(&mut tree, &addr, &account).unwrap();

        let err = reclaim_escrow(
            &mut ctx,
            &mut tree,
            &ReclaimEscrow {
                account: addr,
                shares: Quantity::from_u64(100),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ChainError::InsufficientStake(_)));
    }
}
