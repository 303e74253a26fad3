//! Epoch rewards, slashing, fee disbursement and debonding maturation.
//!
//! All of these run at block boundaries, outside user transactions: rewards
//! and maturation at epoch transitions, fee disbursement at the start of
//! every block.

use tracing::{debug, warn};

use crate::context::Context;
use crate::crypto::{Address, COMMON_POOL_ADDRESS, FEE_ACCUMULATOR_ADDRESS};
use crate::errors::{ChainError, ChainResult};
use crate::mkvs::Tree;
use crate::quantity::Quantity;

use super::state;
use super::{
    event_kind, EscrowTakeEvent, ReclaimEscrowEvent, RewardStep, TransferEvent, MODULE,
    REWARD_AMOUNT_DENOMINATOR,
};

/// Epoch-transition work: liquidate matured debonding delegations.
pub fn on_epoch_transition(ctx: &mut Context, tree: &mut Tree) -> ChainResult<()> {
    for (delegator, escrow, nonce, deb) in state::all_debonding_delegations(tree)? {
        if deb.debond_end > ctx.epoch {
            continue;
        }
        let mut tokens = Quantity::zero();
        let mut shares = deb.shares.clone();
        if delegator == escrow {
            let mut account = state::account(tree, &escrow)?;
            account
                .escrow
                .debonding
                .withdraw(&mut tokens, &mut shares, &deb.shares)?;
            account.general.balance.add(&tokens);
            state::set_account(tree, &escrow, &account)?;
        } else {
            let mut escrow_account = state::account(tree, &escrow)?;
            escrow_account
                .escrow
                .debonding
                .withdraw(&mut tokens, &mut shares, &deb.shares)?;
            state::set_account(tree, &escrow, &escrow_account)?;
            let mut delegator_account = state::account(tree, &delegator)?;
            delegator_account.general.balance.add(&tokens);
            state::set_account(tree, &delegator, &delegator_account)?;
        }
        state::remove_debonding_delegation(tree, &delegator, &escrow, nonce);
        debug!(%delegator, %escrow, end = deb.debond_end, "matured debonding delegation");
        ctx.emit(
            MODULE,
            event_kind::RECLAIM_ESCROW,
            &ReclaimEscrowEvent {
                owner: delegator,
                escrow,
                tokens,
            },
        )?;
    }
    Ok(())
}

fn active_step(schedule: &[RewardStep], epoch: u64) -> Option<&RewardStep> {
    schedule.iter().find(|step| epoch <= step.until)
}

/// Disburses the epoch reward to the given escrow accounts.
///
/// The commission portion is re-deposited as active shares held by the escrow
/// account itself; the remainder raises every delegator's pro-rata balance
/// without minting shares. Rewards are drawn from (and capped by) the common
/// pool.
pub fn add_rewards(ctx: &mut Context, tree: &mut Tree, addresses: &[Address]) -> ChainResult<()> {
    let params = state::params(tree)?;
    let Some(step) = active_step(&params.reward_schedule, ctx.epoch) else {
        return Ok(());
    };
    let denominator = Quantity::from_u64(REWARD_AMOUNT_DENOMINATOR);
    let rate_denominator = params.commission_schedule_rules.rate_denominator.clone();

    let mut seen = std::collections::BTreeSet::new();
    for addr in addresses {
        if !seen.insert(*addr) {
            continue;
        }
        let mut account = state::account(tree, addr)?;
        let mut reward = account
            .escrow
            .active
            .balance
            .mul_div_floor(&step.scale, &denominator)?;
        let mut common_pool = state::common_pool(tree)?;
        reward = Quantity::min(&reward, &common_pool);
        if reward.is_zero() {
            continue;
        }
        common_pool.sub(&reward)?;

        let commission = match account.escrow.commission_schedule.current_rate(ctx.epoch) {
            Some(rate) => reward.mul_div_floor(rate, &rate_denominator)?,
            None => Quantity::zero(),
        };
        let mut rest = reward.clone();
        rest.sub(&commission)?;

        // Non-commission portion: raise the pool balance, no new shares.
        account.escrow.active.balance.add(&rest);

        // Commission portion: a fresh self-delegation deposit at the updated
        // pool ratio.
        if !commission.is_zero() {
            let mut source = commission.clone();
            let mut delegation = state::delegation(tree, addr, addr)?;
            account
                .escrow
                .active
                .deposit(&mut delegation.shares, &mut source, &commission)?;
            state::set_delegation(tree, addr, addr, &delegation)?;
        }

        state::set_account(tree, addr, &account)?;
        state::set_common_pool(tree, &common_pool)?;
        debug!(%addr, %reward, %commission, epoch = ctx.epoch, "disbursed epoch reward");
    }
    Ok(())
}

/// Single-account reward scaled by an extra factor; used for the block
/// proposer reward at the start of each block.
pub fn add_reward_single(
    ctx: &mut Context,
    tree: &mut Tree,
    addr: &Address,
    factor: &Quantity,
) -> ChainResult<()> {
    if factor.is_zero() {
        return Ok(());
    }
    let params = state::params(tree)?;
    let Some(step) = active_step(&params.reward_schedule, ctx.epoch) else {
        return Ok(());
    };
    let denominator = Quantity::from_u64(REWARD_AMOUNT_DENOMINATOR);

    let mut account = state::account(tree, addr)?;
    let reward = account
        .escrow
        .active
        .balance
        .mul_div_floor(&step.scale, &denominator)?
        .mul_div_floor(factor, &denominator)?;
    let mut common_pool = state::common_pool(tree)?;
    let reward = Quantity::min(&reward, &common_pool);
    if reward.is_zero() {
        return Ok(());
    }
    common_pool.sub(&reward)?;
    account.escrow.active.balance.add(&reward);
    state::set_account(tree, addr, &account)?;
    state::set_common_pool(tree, &common_pool)
}

/// Moves up to `amount` proportionally out of the account's active and
/// debonding pools into the common pool. Share totals stay put; the per-share
/// value falls. Returns whether any non-zero amount was slashed.
pub fn slash(ctx: &mut Context, tree: &mut Tree, addr: &Address, amount: &Quantity) -> ChainResult<bool> {
    let mut account = state::account(tree, addr)?;
    let mut total = account.escrow.active.balance.clone();
    total.add(&account.escrow.debonding.balance);
    if total.is_zero() {
        return Ok(false);
    }
    let slashed = Quantity::min(amount, &total);
    if slashed.is_zero() {
        return Ok(false);
    }
    let from_active = slashed.mul_div_floor(&account.escrow.active.balance, &total)?;
    let mut from_debonding = slashed.clone();
    from_debonding.sub(&from_active)?;

    account
        .escrow
        .active
        .balance
        .sub(&from_active)
        .map_err(|_| ChainError::Fatal("staking: slash active underflow".into()))?;
    account
        .escrow
        .debonding
        .balance
        .sub(&from_debonding)
        .map_err(|_| ChainError::Fatal("staking: slash debonding underflow".into()))?;

    let mut common_pool = state::common_pool(tree)?;
    common_pool.add(&slashed);
    state::set_common_pool(tree, &common_pool)?;
    state::set_account(tree, addr, &account)?;

    warn!(%addr, amount = %slashed, "slashed stake into the common pool");
    ctx.emit(
        MODULE,
        event_kind::ESCROW_TAKE,
        &EscrowTakeEvent {
            owner: *addr,
            tokens: slashed,
        },
    )?;
    Ok(true)
}

/// Per-block fee disbursement.
///
/// The previous block's fees split by the configured weights between the
/// current proposer, a share reserved for the next proposer, and the
/// entities whose signatures made it into the previous commit (one share per
/// entity, not by power). Rounding remainders fall into the common pool.
/// The next-proposer reservation is bookkeeping only; its tokens rest in the
/// common pool until the next block's proposer collects them.
pub fn distribute_fees(
    ctx: &mut Context,
    tree: &mut Tree,
    proposer: Option<&Address>,
    voters: &[Address],
) -> ChainResult<()> {
    let params = state::params(tree)?;
    let mut fees = state::last_block_fees(tree)?;
    state::set_last_block_fees(tree, &Quantity::zero())?;
    let reserved = state::next_proposer_fees(tree)?;
    state::set_next_proposer_fees(tree, &Quantity::zero())?;

    let mut weight_total = params.fee_split_weight_propose.clone();
    weight_total.add(&params.fee_split_weight_next_propose);
    weight_total.add(&params.fee_split_weight_vote);

    let mut to_common = Quantity::zero();

    // Collect the share the previous block reserved for this proposer; its
    // tokens are sitting in the common pool.
    let mut proposer_payout = Quantity::zero();
    if !reserved.is_zero() && proposer.is_some() {
        let mut pool = state::common_pool(tree)?;
        let collect = Quantity::min(&reserved, &pool);
        pool.sub(&collect)?;
        state::set_common_pool(tree, &pool)?;
        proposer_payout.add(&collect);
    }

    if weight_total.is_zero() || fees.is_zero() {
        to_common.add(&fees);
        if let Some(addr) = proposer {
            pay_fee(ctx, tree, addr, &proposer_payout)?;
        }
        return credit_common(ctx, tree, &to_common);
    }

    let share_propose = fees.mul_div_floor(&params.fee_split_weight_propose, &weight_total)?;
    let share_next = fees.mul_div_floor(&params.fee_split_weight_next_propose, &weight_total)?;
    let share_vote = fees.mul_div_floor(&params.fee_split_weight_vote, &weight_total)?;
    fees.sub(&share_propose)?;
    fees.sub(&share_next)?;
    fees.sub(&share_vote)?;
    to_common.add(&fees);

    match proposer {
        Some(addr) => {
            proposer_payout.add(&share_propose);
            pay_fee(ctx, tree, addr, &proposer_payout)?;
        }
        None => to_common.add(&share_propose),
    }

    // Reserve the next-proposer share; tokens park in the common pool.
    state::set_next_proposer_fees(tree, &share_next)?;
    to_common.add(&share_next);

    // Voters: equal split, remainder to the common pool.
    if voters.is_empty() {
        to_common.add(&share_vote);
    } else {
        let count = Quantity::from_u64(voters.len() as u64);
        let per_voter = share_vote.mul_div_floor(&Quantity::from_u64(1), &count)?;
        let mut paid_total = Quantity::zero();
        if !per_voter.is_zero() {
            for voter in voters {
                pay_fee(ctx, tree, voter, &per_voter)?;
                paid_total.add(&per_voter);
            }
        }
        let mut rest = share_vote;
        rest.sub(&paid_total)?;
        to_common.add(&rest);
    }

    credit_common(ctx, tree, &to_common)
}

fn pay_fee(ctx: &mut Context, tree: &mut Tree, to: &Address, amount: &Quantity) -> ChainResult<()> {
    if amount.is_zero() {
        return Ok(());
    }
    let mut account = state::account(tree, to)?;
    account.general.balance.add(amount);
    state::set_account(tree, to, &account)?;
    ctx.emit(
        MODULE,
        event_kind::TRANSFER,
        &TransferEvent {
            from: FEE_ACCUMULATOR_ADDRESS,
            to: *to,
            tokens: amount.clone(),
        },
    )
}

fn credit_common(ctx: &mut Context, tree: &mut Tree, amount: &Quantity) -> ChainResult<()> {
    if amount.is_zero() {
        return Ok(());
    }
    let mut pool = state::common_pool(tree)?;
    pool.add(amount);
    state::set_common_pool(tree, &pool)?;
    ctx.emit(
        MODULE,
        event_kind::TRANSFER,
        &TransferEvent {
            from: FEE_ACCUMULATOR_ADDRESS,
            to: COMMON_POOL_ADDRESS,
            tokens: amount.clone(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::super::commission::{CommissionRateStep, CommissionSchedule};
    use super::super::state as staking_state;
    use super::super::{Account, ConsensusParameters, SharePool};
    use super::*;
    use crate::quantity::Quantity;

    fn addr(tag: u8) -> Address {
        Address([tag; 20])
    }

    fn block_ctx(epoch: u64) -> Context {
        Context::for_block(1, 0, epoch, true)
    }

    fn setup(params: ConsensusParameters) -> Tree {
        let mut tree = Tree::new(4);
        staking_state::set_params(&mut tree, &params).unwrap();
        tree
    }

    #[test]
    fn reward_with_commission_matches_share_math() {
        // Pool {100 shares, 100 tokens}, rate 20%, reward scale of 100%
        // over one epoch: reward 100, commission 20.
        let params = ConsensusParameters {
            reward_schedule: vec![RewardStep {
                until: 10,
                scale: Quantity::from_u64(REWARD_AMOUNT_DENOMINATOR),
            }],
            ..Default::default()
        };
        let mut tree = setup(params);
        let escrow = addr(1);
        let mut account = Account::default();
        account.escrow.active = SharePool {
            balance: Quantity::from_u64(100),
            total_shares: Quantity::from_u64(100),
        };
        account.escrow.commission_schedule = CommissionSchedule {
            rates: vec![CommissionRateStep {
                start: 0,
                rate: Quantity::from_u64(20_000),
            }],
            bounds: vec![],
        };
        staking_state::set_account(&mut tree, &escrow, &account).unwrap();
        staking_state::set_common_pool(&mut tree, &Quantity::from_u64(1_000)).unwrap();

        let mut ctx = block_ctx(1);
        add_rewards(&mut ctx, &mut tree, &[escrow]).unwrap();

        let account = staking_state::account(&tree, &escrow).unwrap();
        assert_eq!(account.escrow.active.balance, Quantity::from_u64(200));
        assert_eq!(account.escrow.active.total_shares, Quantity::from_u64(111));
        let delegation = staking_state::delegation(&tree, &escrow, &escrow).unwrap();
        assert_eq!(delegation.shares, Quantity::from_u64(11));
        assert_eq!(
            staking_state::common_pool(&tree).unwrap(),
            Quantity::from_u64(900)
        );
    }

    #[test]
    fn reward_is_capped_by_common_pool() {
        let params = ConsensusParameters {
            reward_schedule: vec![RewardStep {
                until: u64::MAX,
                scale: Quantity::from_u64(REWARD_AMOUNT_DENOMINATOR),
            }],
            ..Default::default()
        };
        let mut tree = setup(params);
        let escrow = addr(1);
        let mut account = Account::default();
        account.escrow.active = SharePool {
            balance: Quantity::from_u64(100),
            total_shares: Quantity::from_u64(100),
        };
        staking_state::set_account(&mut tree, &escrow, &account).unwrap();
        staking_state::set_common_pool(&mut tree, &Quantity::from_u64(30)).unwrap();

        let mut ctx = block_ctx(1);
        add_rewards(&mut ctx, &mut tree, &[escrow]).unwrap();
        assert!(staking_state::common_pool(&tree).unwrap().is_zero());
        assert_eq!(
            staking_state::account(&tree, &escrow)
                .unwrap()
                .escrow
                .active
                .balance,
            Quantity::from_u64(130)
        );
    }

    #[test]
    fn slash_is_proportional_and_preserves_shares() {
        let mut tree = setup(ConsensusParameters::default());
        let target = addr(1);
        let mut account = Account::default();
        account.escrow.active = SharePool {
            balance: Quantity::from_u64(200),
            total_shares: Quantity::from_u64(100),
        };
        account.escrow.debonding = SharePool {
            balance: Quantity::from_u64(50),
            total_shares: Quantity::from_u64(50),
        };
        staking_state::set_account(&mut tree, &target, &account).unwrap();

        let mut ctx = block_ctx(0);
        assert!(slash(&mut ctx, &mut tree, &target, &Quantity::from_u64(40)).unwrap());

        let account = staking_state::account(&tree, &target).unwrap();
        assert_eq!(account.escrow.active.balance, Quantity::from_u64(168));
        assert_eq!(account.escrow.active.total_shares, Quantity::from_u64(100));
        assert_eq!(account.escrow.debonding.balance, Quantity::from_u64(42));
        assert_eq!(account.escrow.debonding.total_shares, Quantity::from_u64(50));
        assert_eq!(
            staking_state::common_pool(&tree).unwrap(),
            Quantity::from_u64(40)
        );
        let events = ctx.take_events();
        let take: EscrowTakeEvent = events[0].decode().unwrap();
        assert_eq!(take.tokens, Quantity::from_u64(40));
    }

    #[test]
    fn slash_of_empty_escrow_is_a_noop() {
        let mut tree = setup(ConsensusParameters::default());
        let mut ctx = block_ctx(0);
        assert!(!slash(&mut ctx, &mut tree, &addr(9), &Quantity::from_u64(5)).unwrap());
    }

    #[test]
    fn matured_debonding_returns_funds() {
        let params = ConsensusParameters {
            debonding_interval: 2,
            ..Default::default()
        };
        let mut tree = setup(params);
        let owner = addr(1);
        let mut account = Account::default();
        account.general.balance = Quantity::from_u64(700);
        account.escrow.debonding = SharePool {
            balance: Quantity::from_u64(150),
            total_shares: Quantity::from_u64(150),
        };
        staking_state::set_account(&mut tree, &owner, &account).unwrap();
        staking_state::set_debonding_delegation(
            &mut tree,
            &owner,
            &owner,
            0,
            &super::super::DebondingDelegation {
                shares: Quantity::from_u64(150),
                debond_end: 5,
            },
        )
        .unwrap();

        // Not yet matured.
        let mut ctx = block_ctx(4);
        on_epoch_transition(&mut ctx, &mut tree).unwrap();
        assert_eq!(
            staking_state::debonding_delegations_for(&tree, &owner)
                .unwrap()
                .len(),
            1
        );

        let mut ctx = block_ctx(5);
        on_epoch_transition(&mut ctx, &mut tree).unwrap();
        let account = staking_state::account(&tree, &owner).unwrap();
        assert_eq!(account.general.balance, Quantity::from_u64(850));
        assert!(account.escrow.debonding.balance.is_zero());
        assert!(account.escrow.debonding.total_shares.is_zero());
        assert!(staking_state::debonding_delegations_for(&tree, &owner)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn fee_split_pays_proposer_next_pot_and_voters() {
        let params = ConsensusParameters {
            fee_split_weight_propose: Quantity::from_u64(2),
            fee_split_weight_next_propose: Quantity::from_u64(1),
            fee_split_weight_vote: Quantity::from_u64(1),
            ..Default::default()
        };
        let mut tree = setup(params);
        staking_state::set_last_block_fees(&mut tree, &Quantity::from_u64(100)).unwrap();
        let proposer = addr(1);
        let voters = [addr(2), addr(3), addr(4)];

        let mut ctx = block_ctx(0);
        distribute_fees(&mut ctx, &mut tree, Some(&proposer), &voters).unwrap();

        // W = 4: proposer 50, reserved 25 (parked in the common pool),
        // voters 25 -> 8 each, 1 remainder to common.
        assert_eq!(
            staking_state::account(&tree, &proposer)
                .unwrap()
                .general
                .balance,
            Quantity::from_u64(50)
        );
        assert_eq!(
            staking_state::next_proposer_fees(&tree).unwrap(),
            Quantity::from_u64(25)
        );
        for voter in &voters {
            assert_eq!(
                staking_state::account(&tree, voter).unwrap().general.balance,
                Quantity::from_u64(8)
            );
        }
        assert_eq!(
            staking_state::common_pool(&tree).unwrap(),
            Quantity::from_u64(26)
        );
        assert!(staking_state::last_block_fees(&tree).unwrap().is_zero());

        let events = ctx.take_events();
        let transfers: Vec<TransferEvent> =
            events.iter().map(|tag| tag.decode().unwrap()).collect();
        assert!(transfers
            .iter()
            .all(|event| event.from == FEE_ACCUMULATOR_ADDRESS));
        assert!(transfers
            .iter()
            .any(|event| event.to == COMMON_POOL_ADDRESS));

        // Next block: the reserved share reaches the new proposer out of the
        // common pool.
        let next_proposer = addr(5);
        let mut ctx = block_ctx(0);
        distribute_fees(&mut ctx, &mut tree, Some(&next_proposer), &[]).unwrap();
        assert_eq!(
            staking_state::account(&tree, &next_proposer)
                .unwrap()
                .general
                .balance,
            Quantity::from_u64(25)
        );
        assert_eq!(
            staking_state::common_pool(&tree).unwrap(),
            Quantity::from_u64(1)
        );
        assert!(staking_state::next_proposer_fees(&tree).unwrap().is_zero());
    }
}
