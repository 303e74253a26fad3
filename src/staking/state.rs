//! Staking keyspace over the authenticated store.
//!
//! All staking keys live under the `s/` prefix. Accounts, delegations and
//! debonding delegations are keyed by their 20-byte addresses; debonding
//! records carry the reclaiming account's nonce as the final disambiguator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::Address;
use crate::encoding;
use crate::epochtime::EpochTime;
use crate::errors::{ChainError, ChainResult};
use crate::mkvs::{KeyValueRead, Tree};
use crate::quantity::Quantity;

use super::{Account, ConsensusParameters, DebondingDelegation, Delegation, ThresholdKind};

const PARAMS_KEY: &[u8] = b"s/params";
const TOTAL_SUPPLY_KEY: &[u8] = b"s/total_supply";
const COMMON_POOL_KEY: &[u8] = b"s/common_pool";
const LAST_BLOCK_FEES_KEY: &[u8] = b"s/last_block_fees";
const NEXT_PROPOSER_FEES_KEY: &[u8] = b"s/next_proposer_fees";
const ACCOUNT_PREFIX: &[u8] = b"s/a/";
const DELEGATION_PREFIX: &[u8] = b"s/d/";
const DEBONDING_PREFIX: &[u8] = b"s/db/";

fn account_key(addr: &Address) -> Vec<u8> {
    [ACCOUNT_PREFIX, &addr.0[..]].concat()
}

fn delegation_key(delegator: &Address, escrow: &Address) -> Vec<u8> {
    [DELEGATION_PREFIX, &delegator.0[..], &escrow.0[..]].concat()
}

fn debonding_key(delegator: &Address, escrow: &Address, nonce: u64) -> Vec<u8> {
    [
        DEBONDING_PREFIX,
        &delegator.0[..],
        &escrow.0[..],
        &nonce.to_be_bytes()[..],
    ]
    .concat()
}

fn address_at(key: &[u8], offset: usize) -> ChainResult<Address> {
    let bytes: [u8; 20] = key
        .get(offset..offset + 20)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| ChainError::Fatal("staking: malformed state key".into()))?;
    Ok(Address(bytes))
}

fn get_quantity(store: &impl KeyValueRead, key: &[u8]) -> ChainResult<Quantity> {
    match store.get(key) {
        Some(raw) => encoding::from_slice(&raw),
        None => Ok(Quantity::zero()),
    }
}

pub fn params(store: &impl KeyValueRead) -> ChainResult<ConsensusParameters> {
    let raw = store
        .get(PARAMS_KEY)
        .ok_or_else(|| ChainError::Fatal("staking: consensus parameters missing".into()))?;
    encoding::from_slice(&raw)
}

pub fn set_params(tree: &mut Tree, params: &ConsensusParameters) -> ChainResult<()> {
    tree.insert(PARAMS_KEY, encoding::to_vec(params)?);
    Ok(())
}

/// Fetches an account; addresses with no state resolve to the empty account.
pub fn account(store: &impl KeyValueRead, addr: &Address) -> ChainResult<Account> {
    match store.get(&account_key(addr)) {
        Some(raw) => encoding::from_slice(&raw),
        None => Ok(Account::default()),
    }
}

pub fn set_account(tree: &mut Tree, addr: &Address, account: &Account) -> ChainResult<()> {
    tree.insert(&account_key(addr), encoding::to_vec(account)?);
    Ok(())
}

pub fn all_accounts(store: &impl KeyValueRead) -> ChainResult<Vec<(Address, Account)>> {
    store
        .iterate_prefix(ACCOUNT_PREFIX)
        .into_iter()
        .map(|(key, raw)| {
            Ok((
                address_at(&key, ACCOUNT_PREFIX.len())?,
                encoding::from_slice(&raw)?,
            ))
        })
        .collect()
}

pub fn total_supply(store: &impl KeyValueRead) -> ChainResult<Quantity> {
    get_quantity(store, TOTAL_SUPPLY_KEY)
}

pub fn set_total_supply(tree: &mut Tree, supply: &Quantity) -> ChainResult<()> {
    tree.insert(TOTAL_SUPPLY_KEY, encoding::to_vec(supply)?);
    Ok(())
}

pub fn common_pool(store: &impl KeyValueRead) -> ChainResult<Quantity> {
    get_quantity(store, COMMON_POOL_KEY)
}

pub fn set_common_pool(tree: &mut Tree, pool: &Quantity) -> ChainResult<()> {
    tree.insert(COMMON_POOL_KEY, encoding::to_vec(pool)?);
    Ok(())
}

pub fn last_block_fees(store: &impl KeyValueRead) -> ChainResult<Quantity> {
    get_quantity(store, LAST_BLOCK_FEES_KEY)
}

pub fn set_last_block_fees(tree: &mut Tree, fees: &Quantity) -> ChainResult<()> {
    tree.insert(LAST_BLOCK_FEES_KEY, encoding::to_vec(fees)?);
    Ok(())
}

/// The share of the previous block's fees reserved for the next proposer.
pub fn next_proposer_fees(store: &impl KeyValueRead) -> ChainResult<Quantity> {
    get_quantity(store, NEXT_PROPOSER_FEES_KEY)
}

pub fn set_next_proposer_fees(tree: &mut Tree, fees: &Quantity) -> ChainResult<()> {
    tree.insert(NEXT_PROPOSER_FEES_KEY, encoding::to_vec(fees)?);
    Ok(())
}

pub fn delegation(
    store: &impl KeyValueRead,
    delegator: &Address,
    escrow: &Address,
) -> ChainResult<Delegation> {
    match store.get(&delegation_key(delegator, escrow)) {
        Some(raw) => encoding::from_slice(&raw),
        None => Ok(Delegation::default()),
    }
}

/// Stores a delegation; a record reduced to zero shares is deleted.
pub fn set_delegation(
    tree: &mut Tree,
    delegator: &Address,
    escrow: &Address,
    delegation: &Delegation,
) -> ChainResult<()> {
    let key = delegation_key(delegator, escrow);
    if delegation.shares.is_zero() {
        tree.remove(&key);
    } else {
        tree.insert(&key, encoding::to_vec(delegation)?);
    }
    Ok(())
}

pub fn delegations_for(
    store: &impl KeyValueRead,
    delegator: &Address,
) -> ChainResult<Vec<(Address, Delegation)>> {
    let prefix = [DELEGATION_PREFIX, &delegator.0[..]].concat();
    store
        .iterate_prefix(&prefix)
        .into_iter()
        .map(|(key, raw)| {
            Ok((
                address_at(&key, DELEGATION_PREFIX.len() + 20)?,
                encoding::from_slice(&raw)?,
            ))
        })
        .collect()
}

pub fn all_delegations(
    store: &impl KeyValueRead,
) -> ChainResult<Vec<(Address, Address, Delegation)>> {
    store
        .iterate_prefix(DELEGATION_PREFIX)
        .into_iter()
        .map(|(key, raw)| {
            Ok((
                address_at(&key, DELEGATION_PREFIX.len())?,
                address_at(&key, DELEGATION_PREFIX.len() + 20)?,
                encoding::from_slice(&raw)?,
            ))
        })
        .collect()
}

pub fn set_debonding_delegation(
    tree: &mut Tree,
    delegator: &Address,
    escrow: &Address,
    nonce: u64,
    deb: &DebondingDelegation,
) -> ChainResult<()> {
    tree.insert(&debonding_key(delegator, escrow, nonce), encoding::to_vec(deb)?);
    Ok(())
}

pub fn remove_debonding_delegation(
    tree: &mut Tree,
    delegator: &Address,
    escrow: &Address,
    nonce: u64,
) {
    tree.remove(&debonding_key(delegator, escrow, nonce));
}

pub fn debonding_delegations_for(
    store: &impl KeyValueRead,
    delegator: &Address,
) -> ChainResult<Vec<(Address, u64, DebondingDelegation)>> {
    let prefix = [DEBONDING_PREFIX, &delegator.0[..]].concat();
    store
        .iterate_prefix(&prefix)
        .into_iter()
        .map(|(key, raw)| {
            let escrow = address_at(&key, DEBONDING_PREFIX.len() + 20)?;
            let nonce_off = DEBONDING_PREFIX.len() + 40;
            let nonce = key
                .get(nonce_off..nonce_off + 8)
                .and_then(|s| <[u8; 8]>::try_from(s).ok())
                .map(u64::from_be_bytes)
                .ok_or_else(|| ChainError::Fatal("staking: malformed debonding key".into()))?;
            Ok((escrow, nonce, encoding::from_slice(&raw)?))
        })
        .collect()
}

pub fn all_debonding_delegations(
    store: &impl KeyValueRead,
) -> ChainResult<Vec<(Address, Address, u64, DebondingDelegation)>> {
    store
        .iterate_prefix(DEBONDING_PREFIX)
        .into_iter()
        .map(|(key, raw)| {
            let delegator = address_at(&key, DEBONDING_PREFIX.len())?;
            let escrow = address_at(&key, DEBONDING_PREFIX.len() + 20)?;
            let nonce_off = DEBONDING_PREFIX.len() + 40;
            let nonce = key
                .get(nonce_off..nonce_off + 8)
                .and_then(|s| <[u8; 8]>::try_from(s).ok())
                .map(u64::from_be_bytes)
                .ok_or_else(|| ChainError::Fatal("staking: malformed debonding key".into()))?;
            Ok((delegator, escrow, nonce, encoding::from_slice(&raw)?))
        })
        .collect()
}

/// Staking genesis state.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Genesis {
    pub params: ConsensusParameters,
    pub total_supply: Quantity,
    pub common_pool: Quantity,
    pub last_block_fees: Quantity,
    pub accounts: BTreeMap<Address, Account>,
    /// delegator -> escrow -> delegation
    pub delegations: BTreeMap<Address, BTreeMap<Address, Delegation>>,
    /// delegator -> escrow -> debonding records (nonce assigned by position)
    pub debonding_delegations: BTreeMap<Address, BTreeMap<Address, Vec<DebondingDelegation>>>,
}

impl Genesis {
    /// Genesis sanity checks: supply conservation, referential integrity,
    /// share invariants, schedule validity and threshold configuration.
    pub fn sanity_check(&self, now: EpochTime) -> ChainResult<()> {
        for kind in ThresholdKind::ALL {
            if !self.params.thresholds.contains_key(&kind) {
                return Err(ChainError::Config(format!(
                    "staking: genesis missing threshold for {kind:?}"
                )));
            }
        }

        let mut expected_supply = self.common_pool.clone();
        expected_supply.add(&self.last_block_fees);
        for (addr, account) in &self.accounts {
            if addr.is_reserved() {
                return Err(ChainError::Config(format!(
                    "staking: genesis account at reserved address {addr}"
                )));
            }
            expected_supply.add(&account.general.balance);
            expected_supply.add(&account.escrow.active.balance);
            expected_supply.add(&account.escrow.debonding.balance);
            for pool in [&account.escrow.active, &account.escrow.debonding] {
                if pool.balance.is_zero() != pool.total_shares.is_zero() {
                    return Err(ChainError::Config(format!(
                        "staking: genesis share pool invariant violated for {addr}"
                    )));
                }
            }
            let mut schedule = account.escrow.commission_schedule.clone();
            schedule
                .prune_and_validate_for_genesis(&self.params.commission_schedule_rules, now)
                .map_err(|err| {
                    ChainError::Config(format!(
                        "staking: genesis commission schedule for {addr}: {err}"
                    ))
                })?;
        }
        if expected_supply != self.total_supply {
            return Err(ChainError::Config(format!(
                "staking: genesis total supply {} does not match ledger sum {}",
                self.total_supply, expected_supply
            )));
        }

        for (delegator, escrows) in &self.delegations {
            if !self.accounts.contains_key(delegator) {
                return Err(ChainError::Config(format!(
                    "staking: genesis delegation from unknown account {delegator}"
                )));
            }
            for escrow in escrows.keys() {
                if !self.accounts.contains_key(escrow) {
                    return Err(ChainError::Config(format!(
                        "staking: genesis delegation to unknown escrow {escrow}"
                    )));
                }
            }
        }
        // Delegated shares must add up to the pools' share totals.
        let mut active_shares: BTreeMap<Address, Quantity> = BTreeMap::new();
        for (_, escrows) in &self.delegations {
            for (escrow, delegation) in escrows {
                active_shares
                    .entry(*escrow)
                    .or_insert_with(Quantity::zero)
                    .add(&delegation.shares);
            }
        }
        let mut debonding_shares: BTreeMap<Address, Quantity> = BTreeMap::new();
        for (delegator, escrows) in &self.debonding_delegations {
            if !self.accounts.contains_key(delegator) {
                return Err(ChainError::Config(format!(
                    "staking: genesis debonding delegation from unknown account {delegator}"
                )));
            }
            for (escrow, debs) in escrows {
                if !self.accounts.contains_key(escrow) {
                    return Err(ChainError::Config(format!(
                        "staking: genesis debonding delegation to unknown escrow {escrow}"
                    )));
                }
                for deb in debs {
                    debonding_shares
                        .entry(*escrow)
                        .or_insert_with(Quantity::zero)
                        .add(&deb.shares);
                }
            }
        }
        for (addr, account) in &self.accounts {
            let active = active_shares.get(addr).cloned().unwrap_or_default();
            if active != account.escrow.active.total_shares {
                return Err(ChainError::Config(format!(
                    "staking: genesis active shares for {addr} do not match delegations"
                )));
            }
            let debonding = debonding_shares.get(addr).cloned().unwrap_or_default();
            if debonding != account.escrow.debonding.total_shares {
                return Err(ChainError::Config(format!(
                    "staking: genesis debonding shares for {addr} do not match delegations"
                )));
            }
        }
        Ok(())
    }

    pub fn init(&self, tree: &mut Tree) -> ChainResult<()> {
        set_params(tree, &self.params)?;
        set_total_supply(tree, &self.total_supply)?;
        set_common_pool(tree, &self.common_pool)?;
        set_last_block_fees(tree, &self.last_block_fees)?;
        for (addr, account) in &self.accounts {
            set_account(tree, addr, account)?;
        }
        for (delegator, escrows) in &self.delegations {
            for (escrow, delegation) in escrows {
                set_delegation(tree, delegator, escrow, delegation)?;
            }
        }
        for (delegator, escrows) in &self.debonding_delegations {
            for (escrow, debs) in escrows {
                for (i, deb) in debs.iter().enumerate() {
                    set_debonding_delegation(tree, delegator, escrow, i as u64, deb)?;
                }
            }
        }
        Ok(())
    }
}
