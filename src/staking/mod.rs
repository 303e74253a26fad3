//! Staking state machine: accounts, delegations, debonding, commission
//! schedules, rewards, slashing and the stake accumulator.

pub mod accumulator;
pub mod commission;
pub mod rewards;
pub mod state;
pub mod transactions;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::crypto::Address;
use crate::epochtime::EpochTime;
use crate::errors::{ChainError, ChainResult};
use crate::gas::GasCosts;
use crate::quantity::Quantity;

use accumulator::StakeAccumulator;
use commission::{CommissionSchedule, CommissionScheduleRules};

pub const MODULE: &str = "staking";

/// Transaction method names.
pub mod method {
    pub const TRANSFER: &str = "staking.Transfer";
    pub const BURN: &str = "staking.Burn";
    pub const ADD_ESCROW: &str = "staking.AddEscrow";
    pub const RECLAIM_ESCROW: &str = "staking.ReclaimEscrow";
    pub const AMEND_COMMISSION_SCHEDULE: &str = "staking.AmendCommissionSchedule";
}

/// Gas operation identifiers for the price table.
pub mod op {
    pub const TRANSFER: &str = "transfer";
    pub const BURN: &str = "burn";
    pub const ADD_ESCROW: &str = "add_escrow";
    pub const RECLAIM_ESCROW: &str = "reclaim_escrow";
    pub const AMEND_COMMISSION_SCHEDULE: &str = "amend_commission_schedule";
}

/// Denominator for reward scale factors.
pub const REWARD_AMOUNT_DENOMINATOR: u64 = 100_000_000;

/// Stake threshold kinds enforced through the accumulator.
#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "kebab-case")]
pub enum ThresholdKind {
    Entity,
    Validator,
    ComputeWorker,
    StorageWorker,
    KeyManager,
    Runtime,
}

impl ThresholdKind {
    pub const ALL: [ThresholdKind; 6] = [
        ThresholdKind::Entity,
        ThresholdKind::Validator,
        ThresholdKind::ComputeWorker,
        ThresholdKind::StorageWorker,
        ThresholdKind::KeyManager,
        ThresholdKind::Runtime,
    ];
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneralAccount {
    pub balance: Quantity,
    pub nonce: u64,
}

/// A pool of tokens with fractional ownership denoted in shares.
///
/// Invariant: `total_shares == 0` iff `balance == 0`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharePool {
    pub balance: Quantity,
    pub total_shares: Quantity,
}

impl SharePool {
    /// Shares the pool would mint for a deposit of `tokens`, at the current
    /// ratio (pre-deposit). An empty pool mints one share per token.
    fn shares_for_tokens(&self, tokens: &Quantity) -> ChainResult<Quantity> {
        if self.total_shares.is_zero() {
            return Ok(tokens.clone());
        }
        if self.balance.is_zero() {
            return Err(ChainError::Fatal(
                "staking: share pool has shares but no balance".into(),
            ));
        }
        tokens.mul_div_floor(&self.total_shares, &self.balance)
    }

    fn tokens_for_shares(&self, shares: &Quantity) -> ChainResult<Quantity> {
        if shares.is_zero() || self.total_shares.is_zero() || self.balance.is_zero() {
            return Ok(Quantity::zero());
        }
        shares.mul_div_floor(&self.balance, &self.total_shares)
    }

    /// Moves `amount` from `src_balance` into the pool, crediting the minted
    /// shares to `shares_dst`.
    pub fn deposit(
        &mut self,
        shares_dst: &mut Quantity,
        src_balance: &mut Quantity,
        amount: &Quantity,
    ) -> ChainResult<()> {
        let shares = self.shares_for_tokens(amount)?;
        src_balance.sub(amount)?;
        self.balance.add(amount);
        self.total_shares.add(&shares);
        shares_dst.add(&shares);
        Ok(())
    }

    /// Redeems `shares` out of `shares_src`, moving the corresponding tokens
    /// to `dst_balance`. Redeeming the pool's full share total always drains
    /// the full balance.
    pub fn withdraw(
        &mut self,
        dst_balance: &mut Quantity,
        shares_src: &mut Quantity,
        shares: &Quantity,
    ) -> ChainResult<()> {
        if *shares_src < *shares {
            return Err(ChainError::InsufficientBalance(format!(
                "staking: insufficient shares: {shares_src} < {shares}"
            )));
        }
        let tokens = self.tokens_for_shares(shares)?;
        shares_src.sub(shares)?;
        self.total_shares
            .sub(shares)
            .map_err(|_| ChainError::Fatal("staking: pool share total underflow".into()))?;
        self.balance
            .sub(&tokens)
            .map_err(|_| ChainError::Fatal("staking: pool balance underflow".into()))?;
        dst_balance.add(&tokens);
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscrowAccount {
    pub active: SharePool,
    pub debonding: SharePool,
    pub commission_schedule: CommissionSchedule,
    pub stake_accumulator: StakeAccumulator,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub general: GeneralAccount,
    pub escrow: EscrowAccount,
}

/// A delegator's claim on an escrow's active pool.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delegation {
    pub shares: Quantity,
}

/// A claim on an escrow's debonding pool, waiting out the exit period.
/// Uniquely keyed by `(delegator, escrow, nonce-at-creation)` so repeated
/// reclaims never collide.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebondingDelegation {
    pub shares: Quantity,
    pub debond_end: EpochTime,
}

/// One step of the epoch reward schedule; the first step with
/// `epoch <= until` is active.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardStep {
    pub until: EpochTime,
    pub scale: Quantity,
}

#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "kebab-case")]
pub enum SlashReason {
    ConsensusEquivocation,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlashParameters {
    pub amount: Quantity,
    pub freeze_interval: EpochTime,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusParameters {
    pub thresholds: BTreeMap<ThresholdKind, Quantity>,
    pub debonding_interval: EpochTime,
    pub reward_schedule: Vec<RewardStep>,
    pub commission_schedule_rules: CommissionScheduleRules,
    pub slashing: BTreeMap<SlashReason, SlashParameters>,
    pub gas_costs: GasCosts,
    pub min_delegation_amount: Quantity,
    pub disable_transfers: bool,
    pub disable_delegation: bool,
    pub undisable_transfers_from: BTreeSet<Address>,
    pub fee_split_weight_propose: Quantity,
    pub fee_split_weight_next_propose: Quantity,
    pub fee_split_weight_vote: Quantity,
    /// Scale applied to the block proposer's per-block reward, over
    /// [`REWARD_AMOUNT_DENOMINATOR`].
    pub reward_factor_block_proposed: Quantity,
}

impl Default for ConsensusParameters {
    fn default() -> Self {
        Self {
            thresholds: BTreeMap::new(),
            debonding_interval: 1,
            reward_schedule: Vec::new(),
            commission_schedule_rules: CommissionScheduleRules::default(),
            slashing: BTreeMap::new(),
            gas_costs: GasCosts::new(),
            min_delegation_amount: Quantity::zero(),
            disable_transfers: false,
            disable_delegation: false,
            undisable_transfers_from: BTreeSet::new(),
            fee_split_weight_propose: Quantity::from_u64(1),
            fee_split_weight_next_propose: Quantity::from_u64(1),
            fee_split_weight_vote: Quantity::from_u64(1),
            reward_factor_block_proposed: Quantity::zero(),
        }
    }
}

// Transaction bodies.

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transfer {
    pub to: Address,
    pub tokens: Quantity,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Burn {
    pub tokens: Quantity,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Escrow {
    pub account: Address,
    pub tokens: Quantity,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReclaimEscrow {
    pub account: Address,
    pub shares: Quantity,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AmendCommissionSchedule {
    pub amendment: CommissionSchedule,
}

// Events.

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferEvent {
    pub from: Address,
    pub to: Address,
    pub tokens: Quantity,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BurnEvent {
    pub owner: Address,
    pub tokens: Quantity,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddEscrowEvent {
    pub owner: Address,
    pub escrow: Address,
    pub tokens: Quantity,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReclaimEscrowEvent {
    pub owner: Address,
    pub escrow: Address,
    pub tokens: Quantity,
}

/// Emitted when stake is taken out of an escrow by the protocol (slashing).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscrowTakeEvent {
    pub owner: Address,
    pub tokens: Quantity,
}

pub mod event_kind {
    pub const TRANSFER: &str = "transfer";
    pub const BURN: &str = "burn";
    pub const ADD_ESCROW: &str = "add_escrow";
    pub const RECLAIM_ESCROW: &str = "reclaim_escrow";
    pub const ESCROW_TAKE: &str = "escrow_take";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_mints_one_share_per_token() {
        let mut pool = SharePool::default();
        let mut shares = Quantity::zero();
        let mut balance = Quantity::from_u64(1_000);
        pool.deposit(&mut shares, &mut balance, &Quantity::from_u64(300))
            .unwrap();
        assert_eq!(pool.balance, Quantity::from_u64(300));
        assert_eq!(pool.total_shares, Quantity::from_u64(300));
        assert_eq!(shares, Quantity::from_u64(300));
        assert_eq!(balance, Quantity::from_u64(700));
    }

    #[test]
    fn deposit_uses_pre_deposit_ratio() {
        let mut pool = SharePool {
            balance: Quantity::from_u64(180),
            total_shares: Quantity::from_u64(100),
        };
        let mut shares = Quantity::zero();
        let mut balance = Quantity::from_u64(20);
        pool.deposit(&mut shares, &mut balance, &Quantity::from_u64(20))
            .unwrap();
        assert_eq!(shares, Quantity::from_u64(11));
        assert_eq!(pool.total_shares, Quantity::from_u64(111));
        assert_eq!(pool.balance, Quantity::from_u64(200));
    }

    #[test]
    fn withdrawing_all_shares_drains_the_pool() {
        let mut pool = SharePool {
            balance: Quantity::from_u64(7),
            total_shares: Quantity::from_u64(3),
        };
        let mut holder = Quantity::from_u64(3);
        let mut out = Quantity::zero();
        pool.withdraw(&mut out, &mut holder, &Quantity::from_u64(3))
            .unwrap();
        assert!(pool.balance.is_zero());
        assert!(pool.total_shares.is_zero());
        assert_eq!(out, Quantity::from_u64(7));
    }

    #[test]
    fn withdraw_rejects_more_shares_than_held() {
        let mut pool = SharePool {
            balance: Quantity::from_u64(100),
            total_shares: Quantity::from_u64(100),
        };
        let mut holder = Quantity::from_u64(10);
        let mut out = Quantity::zero();
        let err = pool
            .withdraw(&mut out, &mut holder, &Quantity::from_u64(11))
            .unwrap_err();
        assert!(matches!(err, ChainError::InsufficientBalance(_)));
        assert_eq!(holder, Quantity::from_u64(10));
        assert_eq!(pool.balance, Quantity::from_u64(100));
    }
}
