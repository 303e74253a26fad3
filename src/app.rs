//! The consensus application.
//!
//! Ties the three state machines together behind the BFT engine's block
//! interface: BeginBlock advances the epoch clock and runs block-boundary
//! work, DeliverTx authenticates and dispatches transactions, EndBlock elects
//! committees on epoch changes and seals a new state version.
//!
//! Execution is strictly single-threaded per block and deterministic:
//! replaying the same block sequence yields byte-identical state roots.

use std::collections::VecDeque;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::context::{Context, EventTag};
use crate::crypto::{context_with_chain, Address, Hash, PublicKey};
use crate::encoding;
use crate::epochtime::{EpochClock, EpochTime};
use crate::errors::{ChainError, ChainResult};
use crate::gas::{Gas, GasMeter};
use crate::genesis::{self, Document};
use crate::mkvs::{KeyValueRead, Snapshot, Tree};
use crate::quantity::Quantity;
use crate::registry;
use crate::roothash;
use crate::scheduler;
use crate::staking::{self, SlashReason};

/// Base signature context for consensus transactions; always bound to the
/// chain context.
pub const TX_SIGNATURE_CONTEXT: &str = "tessera/consensus: tx";

/// Committed state versions retained for past-height queries.
const STATE_HISTORY: usize = 64;

/// Per-height event tags retained for event stream queries.
const EVENT_HISTORY: usize = 64;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fee {
    pub amount: Quantity,
    pub gas: Gas,
}

/// The consensus transaction envelope body.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: u64,
    pub fee: Fee,
    pub method: String,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedTransaction {
    pub payload: Transaction,
    pub signature: crate::crypto::ContextSignature,
}

impl SignedTransaction {
    pub fn sign(
        keypair: &ed25519_dalek::Keypair,
        chain_context: &str,
        payload: Transaction,
    ) -> ChainResult<Self> {
        let bytes = encoding::to_vec(&payload)?;
        let context = context_with_chain(TX_SIGNATURE_CONTEXT, chain_context);
        Ok(SignedTransaction {
            signature: crate::crypto::ContextSignature::sign(keypair, &context, &bytes),
            payload,
        })
    }

    /// Verifies the signature, rejecting any context that is not
    /// byte-for-byte the expected one for this chain.
    pub fn verify(&self, chain_context: &str) -> ChainResult<()> {
        let bytes = encoding::to_vec(&self.payload)?;
        self.signature
            .verify(&context_with_chain(TX_SIGNATURE_CONTEXT, chain_context), &bytes)
    }

    pub fn hash(&self) -> ChainResult<Hash> {
        encoding::hash_of(self)
    }
}

/// Block metadata reported by the BFT engine.
#[derive(Clone, Debug)]
pub struct BlockInfo {
    pub height: u64,
    /// Block time, seconds since the epoch.
    pub time: u64,
    /// Consensus key of the block proposer.
    pub proposer_consensus_key: Option<PublicKey>,
    /// Consensus keys whose signatures were included in the previous commit.
    pub commit_signers: Vec<PublicKey>,
}

#[derive(Clone, Debug)]
pub struct EndBlockResult {
    pub height: u64,
    pub epoch: EpochTime,
    pub state_root: Hash,
    pub events: Vec<EventTag>,
}

/// Read handle over either the live tree or a committed snapshot.
pub enum Store<'a> {
    Live(&'a Tree),
    Past(&'a Snapshot),
}

impl KeyValueRead for Store<'_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self {
            Store::Live(tree) => tree.get(key),
            Store::Past(snapshot) => snapshot.get(key),
        }
    }

    fn iterate_from(&self, start: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        match self {
            Store::Live(tree) => tree.iterate_from(start),
            Store::Past(snapshot) => snapshot.iterate_from(start),
        }
    }
}

pub struct Application {
    tree: Tree,
    clock: EpochClock,
    chain_context: String,
    halt_epoch: EpochTime,
    last_epoch: EpochTime,
    halted: bool,
    block_ctx: Option<Context>,
    event_log: RwLock<VecDeque<(u64, Vec<EventTag>)>>,
}

impl Application {
    /// Builds the application state from a genesis document.
    pub fn from_genesis(doc: &Document) -> ChainResult<Self> {
        Self::from_genesis_with_history(doc, STATE_HISTORY)
    }

    /// Same, with an explicit number of retained state versions (see
    /// [`crate::config::NodeConfig::state_history`]).
    pub fn from_genesis_with_history(doc: &Document, state_history: usize) -> ChainResult<Self> {
        doc.sanity_check()?;
        let clock = EpochClock::new(doc.epoch_time.interval)?;
        let chain_context = doc.chain_context()?;
        let genesis_epoch = clock.epoch_at(doc.height);

        let mut tree = Tree::new(state_history);
        genesis::set_chain_context(&mut tree, &chain_context)?;
        doc.staking.init(&mut tree)?;
        roothash::round::set_params(&mut tree, &doc.roothash.params)?;
        scheduler::set_params(&mut tree, &doc.scheduler.params)?;

        let mut ctx = Context::for_block(doc.height, doc.time, genesis_epoch, true);
        registry::transactions::init_genesis(&mut ctx, &mut tree, &doc.registry)?;

        tree.commit_version(doc.height)?;
        info!(chain = %doc.chain_id, context = %chain_context, height = doc.height, "initialized from genesis");

        Ok(Self {
            tree,
            clock,
            chain_context,
            halt_epoch: doc.halt_epoch,
            last_epoch: genesis_epoch,
            halted: false,
            block_ctx: None,
            event_log: RwLock::new(VecDeque::new()),
        })
    }

    pub fn chain_context(&self) -> &str {
        &self.chain_context
    }

    pub fn current_epoch(&self) -> EpochTime {
        self.last_epoch
    }

    /// BeginBlock: advance the epoch if due, disburse the previous block's
    /// fees and the proposer reward, run epoch-transition work (debonding,
    /// epoch rewards, node expiry, runtime maintenance) and round timeouts.
    pub fn begin_block(&mut self, info: &BlockInfo) -> ChainResult<()> {
        if self.halted {
            return Err(ChainError::Fatal("consensus: network halted".into()));
        }
        if self.block_ctx.is_some() {
            return Err(ChainError::Fatal("consensus: block already in progress".into()));
        }

        let epoch = self.clock.epoch_at(info.height);
        let epoch_changed = epoch != self.last_epoch;
        if epoch_changed && epoch >= self.halt_epoch {
            self.halted = true;
            error!(epoch, halt_epoch = self.halt_epoch, "halt epoch reached");
            return Err(ChainError::Fatal("consensus: halt epoch reached".into()));
        }

        let mut ctx = Context::for_block(info.height, info.time, epoch, epoch_changed);

        let proposer = match info.proposer_consensus_key {
            Some(key) => self.entity_address_by_consensus_key(&key)?,
            None => None,
        };
        let mut voters = Vec::new();
        for signer in &info.commit_signers {
            if let Some(addr) = self.entity_address_by_consensus_key(signer)? {
                if !voters.contains(&addr) {
                    voters.push(addr);
                }
            }
        }

        staking::rewards::distribute_fees(&mut ctx, &mut self.tree, proposer.as_ref(), &voters)?;
        if let Some(addr) = &proposer {
            let factor = staking::state::params(&self.tree)?.reward_factor_block_proposed;
            staking::rewards::add_reward_single(&mut ctx, &mut self.tree, addr, &factor)?;
        }

        if epoch_changed {
            debug!(epoch, height = info.height, "epoch transition");
            staking::rewards::on_epoch_transition(&mut ctx, &mut self.tree)?;
            let eligible = self.reward_eligible_entities()?;
            staking::rewards::add_rewards(&mut ctx, &mut self.tree, &eligible)?;
            registry::transactions::on_epoch_transition(&mut ctx, &mut self.tree)?;
            roothash::round::maintenance(&mut ctx, &mut self.tree)?;
        }

        roothash::round::on_block(&mut ctx, &mut self.tree)?;

        self.block_ctx = Some(ctx);
        Ok(())
    }

    /// Escrow accounts eligible for the epoch reward: entities that currently
    /// have registered validator-role nodes.
    fn reward_eligible_entities(&self) -> ChainResult<Vec<Address>> {
        let mut eligible = Vec::new();
        for node in registry::state::nodes(&self.tree)? {
            if !node.roles.contains(registry::ROLE_VALIDATOR) {
                continue;
            }
            let addr = Address::from_public_key(&node.entity_id);
            if !eligible.contains(&addr) {
                eligible.push(addr);
            }
        }
        Ok(eligible)
    }

    fn entity_address_by_consensus_key(&self, key: &PublicKey) -> ChainResult<Option<Address>> {
        Ok(registry::state::node_by_consensus_key(&self.tree, key)?
            .map(|node| Address::from_public_key(&node.entity_id)))
    }

    /// DeliverTx: authenticate the envelope, charge the fee and nonce, and
    /// dispatch under a store checkpoint so a failing transaction rolls back
    /// atomically (fee and nonce stay charged).
    pub fn deliver_tx(&mut self, raw: &[u8]) -> ChainResult<()> {
        if self.block_ctx.is_none() {
            return Err(ChainError::Fatal("consensus: no block in progress".into()));
        }

        let signed: SignedTransaction = encoding::from_slice(raw).map_err(|_| {
            ChainError::InvalidArgument("consensus: malformed transaction envelope".into())
        })?;
        signed.verify(&self.chain_context)?;

        let tx = &signed.payload;
        let signer = signed.signature.public_key;
        let signer_addr = Address::from_public_key(&signer);

        let mut account = staking::state::account(&self.tree, &signer_addr)?;
        if account.general.nonce != tx.nonce {
            return Err(ChainError::InvalidNonce {
                expected: account.general.nonce,
                got: tx.nonce,
            });
        }
        account.general.balance.sub(&tx.fee.amount).map_err(|_| {
            ChainError::InsufficientBalance("consensus: cannot pay transaction fee".into())
        })?;
        account.general.nonce += 1;
        staking::state::set_account(&mut self.tree, &signer_addr, &account)?;
        let mut fees = staking::state::last_block_fees(&self.tree)?;
        fees.add(&tx.fee.amount);
        staking::state::set_last_block_fees(&mut self.tree, &fees)?;

        let tx_hash = signed.hash()?;
        let block_ctx = self.block_ctx.as_mut().expect("checked above");
        let mut tx_ctx = block_ctx.for_tx(signer, tx_hash, GasMeter::new(tx.fee.gas));

        self.tree.checkpoint();
        match dispatch(&mut tx_ctx, &mut self.tree, &tx.method, &tx.body) {
            Ok(()) => {
                self.tree.commit_checkpoint()?;
                block_ctx.absorb(tx_ctx);
                Ok(())
            }
            Err(err) => {
                self.tree.rollback_checkpoint()?;
                debug!(method = %tx.method, %err, "transaction failed");
                Err(err)
            }
        }
    }

    /// EndBlock: elect committees on epoch change, emit the accumulated
    /// events and publish the new application state root.
    pub fn end_block(&mut self) -> ChainResult<EndBlockResult> {
        let mut ctx = self
            .block_ctx
            .take()
            .ok_or_else(|| ChainError::Fatal("consensus: no block in progress".into()))?;

        if ctx.epoch_changed {
            roothash::round::elect_and_transition(&mut ctx, &mut self.tree)?;
        }
        self.last_epoch = ctx.epoch;

        let height = ctx.height;
        let epoch = ctx.epoch;
        let events = ctx.take_events();
        let state_root = self.tree.commit_version(height)?;

        let mut log = self.event_log.write();
        log.push_back((height, events.clone()));
        while log.len() > EVENT_HISTORY {
            log.pop_front();
        }
        drop(log);

        Ok(EndBlockResult {
            height,
            epoch,
            state_root,
            events,
        })
    }

    /// Evidence hook: consensus-layer equivocation slashes the offending
    /// node's entity and freezes the node.
    pub fn on_evidence_equivocation(&mut self, consensus_key: &PublicKey) -> ChainResult<()> {
        let ctx = self
            .block_ctx
            .as_mut()
            .ok_or_else(|| ChainError::Fatal("consensus: no block in progress".into()))?;
        let Some(node) = registry::state::node_by_consensus_key(&self.tree, consensus_key)? else {
            return Ok(());
        };
        let params = staking::state::params(&self.tree)?;
        let Some(slash_params) = params.slashing.get(&SlashReason::ConsensusEquivocation).cloned()
        else {
            return Ok(());
        };

        let until = registry::transactions::equivocation_freeze_end(ctx, slash_params.freeze_interval);
        registry::transactions::freeze_node(&mut self.tree, &node.id, until)?;
        let entity_addr = Address::from_public_key(&node.entity_id);
        staking::rewards::slash(ctx, &mut self.tree, &entity_addr, &slash_params.amount)?;
        Ok(())
    }

    // Read-only queries, at the latest committed height or a retained past
    // height.

    pub fn at(&self, height: Option<u64>) -> ChainResult<Store<'_>> {
        match height {
            None => Ok(Store::Live(&self.tree)),
            Some(height) => self
                .tree
                .snapshot(height)
                .map(Store::Past)
                .ok_or_else(|| ChainError::NotFound("consensus: no such height".into())),
        }
    }

    pub fn state_root(&self, height: Option<u64>) -> ChainResult<Hash> {
        match height {
            None => Ok(self.tree.root_hash()),
            Some(height) => self
                .tree
                .snapshot(height)
                .map(|snapshot| snapshot.root)
                .ok_or_else(|| ChainError::NotFound("consensus: no such height".into())),
        }
    }

    pub fn staking_account(&self, height: Option<u64>, addr: &Address) -> ChainResult<staking::Account> {
        staking::state::account(&self.at(height)?, addr)
    }

    pub fn delegations_for(
        &self,
        height: Option<u64>,
        delegator: &Address,
    ) -> ChainResult<Vec<(Address, staking::Delegation)>> {
        staking::state::delegations_for(&self.at(height)?, delegator)
    }

    pub fn debonding_delegations_for(
        &self,
        height: Option<u64>,
        delegator: &Address,
    ) -> ChainResult<Vec<(Address, u64, staking::DebondingDelegation)>> {
        staking::state::debonding_delegations_for(&self.at(height)?, delegator)
    }

    pub fn total_supply(&self, height: Option<u64>) -> ChainResult<Quantity> {
        staking::state::total_supply(&self.at(height)?)
    }

    pub fn common_pool(&self, height: Option<u64>) -> ChainResult<Quantity> {
        staking::state::common_pool(&self.at(height)?)
    }

    pub fn last_block_fees(&self, height: Option<u64>) -> ChainResult<Quantity> {
        staking::state::last_block_fees(&self.at(height)?)
    }

    pub fn threshold(&self, height: Option<u64>, kind: staking::ThresholdKind) -> ChainResult<Quantity> {
        staking::state::params(&self.at(height)?)?
            .thresholds
            .get(&kind)
            .cloned()
            .ok_or_else(|| ChainError::NotFound("staking: threshold not configured".into()))
    }

    pub fn debonding_interval(&self, height: Option<u64>) -> ChainResult<EpochTime> {
        Ok(staking::state::params(&self.at(height)?)?.debonding_interval)
    }

    pub fn staking_params(&self, height: Option<u64>) -> ChainResult<staking::ConsensusParameters> {
        staking::state::params(&self.at(height)?)
    }

    pub fn entity(&self, height: Option<u64>, id: &PublicKey) -> ChainResult<registry::Entity> {
        registry::state::entity(&self.at(height)?, id)?
            .ok_or_else(|| ChainError::NotFound("registry: no such entity".into()))
    }

    pub fn entities(&self, height: Option<u64>) -> ChainResult<Vec<registry::Entity>> {
        registry::state::entities(&self.at(height)?)
    }

    pub fn node(&self, height: Option<u64>, id: &PublicKey) -> ChainResult<registry::Node> {
        registry::state::node(&self.at(height)?, id)?
            .ok_or_else(|| ChainError::NotFound("registry: no such node".into()))
    }

    pub fn nodes(&self, height: Option<u64>) -> ChainResult<Vec<registry::Node>> {
        registry::state::nodes(&self.at(height)?)
    }

    pub fn runtime(&self, height: Option<u64>, id: &registry::Namespace) -> ChainResult<registry::Runtime> {
        registry::state::runtime(&self.at(height)?, id)?
            .ok_or_else(|| ChainError::NotFound("registry: no such runtime".into()))
    }

    pub fn runtimes(&self, height: Option<u64>) -> ChainResult<Vec<registry::Runtime>> {
        registry::state::runtimes(&self.at(height)?)
    }

    pub fn committee(
        &self,
        height: Option<u64>,
        runtime_id: &registry::Namespace,
        kind: scheduler::CommitteeKind,
    ) -> ChainResult<Option<scheduler::Committee>> {
        scheduler::committee(&self.at(height)?, runtime_id, kind)
    }

    pub fn latest_runtime_block(
        &self,
        height: Option<u64>,
        runtime_id: &registry::Namespace,
    ) -> ChainResult<roothash::Block> {
        roothash::round::runtime_state(&self.at(height)?, runtime_id)?
            .map(|state| state.current_block)
            .ok_or_else(|| ChainError::NotFound("roothash: block not found".into()))
    }

    pub fn runtime_block(
        &self,
        height: Option<u64>,
        runtime_id: &registry::Namespace,
        round: u64,
    ) -> ChainResult<roothash::Block> {
        roothash::round::block_at(&self.at(height)?, runtime_id, round)?
            .ok_or_else(|| ChainError::NotFound("roothash: block not found".into()))
    }

    pub fn runtime_genesis_block(
        &self,
        height: Option<u64>,
        runtime_id: &registry::Namespace,
    ) -> ChainResult<roothash::Block> {
        let store = self.at(height)?;
        let runtime = registry::state::runtime(&store, runtime_id)?
            .ok_or_else(|| ChainError::NotFound("registry: no such runtime".into()))?;
        roothash::round::block_at(&store, runtime_id, runtime.genesis.round)?
            .ok_or_else(|| ChainError::NotFound("roothash: block not found".into()))
    }

    /// Event tags emitted at the given height, if still retained.
    pub fn events_at(&self, height: u64) -> ChainResult<Vec<EventTag>> {
        self.event_log
            .read()
            .iter()
            .find(|(at, _)| *at == height)
            .map(|(_, events)| events.clone())
            .ok_or_else(|| ChainError::NotFound("consensus: no events for height".into()))
    }

    /// A genesis snapshot of the current staking state, for light clients and
    /// chain restarts.
    pub fn staking_genesis_snapshot(&self) -> ChainResult<staking::state::Genesis> {
        let store = self.at(None)?;
        let params = staking::state::params(&store)?;
        let mut genesis = staking::state::Genesis {
            params,
            total_supply: staking::state::total_supply(&store)?,
            common_pool: staking::state::common_pool(&store)?,
            last_block_fees: staking::state::last_block_fees(&store)?,
            ..Default::default()
        };
        for (addr, account) in staking::state::all_accounts(&store)? {
            genesis.accounts.insert(addr, account);
        }
        for (delegator, escrow, delegation) in staking::state::all_delegations(&store)? {
            genesis
                .delegations
                .entry(delegator)
                .or_default()
                .insert(escrow, delegation);
        }
        for (delegator, escrow, _nonce, deb) in staking::state::all_debonding_delegations(&store)? {
            genesis
                .debonding_delegations
                .entry(delegator)
                .or_default()
                .entry(escrow)
                .or_default()
                .push(deb);
        }
        Ok(genesis)
    }
}

fn dispatch(ctx: &mut Context, tree: &mut Tree, method: &str, body: &[u8]) -> ChainResult<()> {
    match method.split_once('.') {
        Some(("staking", _)) => staking::transactions::dispatch(ctx, tree, method, body),
        Some(("registry", _)) => registry::transactions::dispatch(ctx, tree, method, body),
        Some(("roothash", _)) => roothash::round::dispatch(ctx, tree, method, body),
        _ => Err(ChainError::InvalidArgument(format!(
            "consensus: unknown method {method}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use crate::staking::ThresholdKind;

    fn minimal_genesis() -> Document {
        let mut doc = Document {
            chain_id: "tessera-test".to_string(),
            halt_epoch: EpochTime::MAX,
            ..Default::default()
        };
        doc.epoch_time.interval = 10;
        doc.staking.params.thresholds = ThresholdKind::ALL
            .into_iter()
            .map(|kind| (kind, Quantity::zero()))
            .collect();
        doc
    }

    fn fund(doc: &mut Document, addr: Address, amount: u64) {
        let mut account = staking::Account::default();
        account.general.balance = Quantity::from_u64(amount);
        doc.staking.accounts.insert(addr, account);
        doc.staking.total_supply.add(&Quantity::from_u64(amount));
    }

    fn block(height: u64) -> BlockInfo {
        BlockInfo {
            height,
            time: height * 5,
            proposer_consensus_key: None,
            commit_signers: Vec::new(),
        }
    }

    #[test]
    fn transfer_via_envelope_moves_funds_and_charges_fee() {
        let keypair = generate_keypair();
        let from = Address::from_public_key(&PublicKey::from_keypair(&keypair));
        let to = Address([9; 20]);
        let mut doc = minimal_genesis();
        fund(&mut doc, from, 1_000);
        let mut app = Application::from_genesis(&doc).unwrap();

        let tx = Transaction {
            nonce: 0,
            fee: Fee {
                amount: Quantity::from_u64(10),
                gas: 1_000,
            },
            method: staking::method::TRANSFER.to_string(),
            body: encoding::to_vec(&staking::Transfer {
                to,
                tokens: Quantity::from_u64(100),
            })
            .unwrap(),
        };
        let signed = SignedTransaction::sign(&keypair, app.chain_context(), tx).unwrap();
        let raw = encoding::to_vec(&signed).unwrap();

        app.begin_block(&block(1)).unwrap();
        app.deliver_tx(&raw).unwrap();
        let result = app.end_block().unwrap();
        assert!(result
            .events
            .iter()
            .any(|tag| tag.module == "staking" && tag.kind == "transfer"));

        assert_eq!(
            app.staking_account(None, &from).unwrap().general.balance,
            Quantity::from_u64(890)
        );
        assert_eq!(
            app.staking_account(None, &to).unwrap().general.balance,
            Quantity::from_u64(100)
        );
        assert_eq!(app.last_block_fees(None).unwrap(), Quantity::from_u64(10));

        // Replaying the same nonce is rejected and changes nothing.
        app.begin_block(&block(2)).unwrap();
        let err = app.deliver_tx(&raw).unwrap_err();
        assert!(matches!(err, ChainError::InvalidNonce { expected: 1, got: 0 }));
        app.end_block().unwrap();
        assert_eq!(
            app.staking_account(None, &to).unwrap().general.balance,
            Quantity::from_u64(100)
        );
    }

    #[test]
    fn wrong_chain_context_is_rejected() {
        let keypair = generate_keypair();
        let mut doc = minimal_genesis();
        fund(
            &mut doc,
            Address::from_public_key(&PublicKey::from_keypair(&keypair)),
            100,
        );
        let mut app = Application::from_genesis(&doc).unwrap();

        let tx = Transaction {
            nonce: 0,
            fee: Fee::default(),
            method: staking::method::BURN.to_string(),
            body: encoding::to_vec(&staking::Burn {
                tokens: Quantity::from_u64(1),
            })
            .unwrap(),
        };
        let signed = SignedTransaction::sign(&keypair, "deadbeef", tx).unwrap();
        let raw = encoding::to_vec(&signed).unwrap();

        app.begin_block(&block(1)).unwrap();
        let err = app.deliver_tx(&raw).unwrap_err();
        assert!(matches!(err, ChainError::InvalidArgument(_)));
        app.end_block().unwrap();
    }

    #[test]
    fn failed_transaction_rolls_back_but_keeps_fee_and_nonce() {
        let keypair = generate_keypair();
        let from = Address::from_public_key(&PublicKey::from_keypair(&keypair));
        let mut doc = minimal_genesis();
        fund(&mut doc, from, 50);
        let mut app = Application::from_genesis(&doc).unwrap();

        // Transfer more than the balance: dispatch fails after fee charge.
        let tx = Transaction {
            nonce: 0,
            fee: Fee {
                amount: Quantity::from_u64(5),
                gas: 1_000,
            },
            method: staking::method::TRANSFER.to_string(),
            body: encoding::to_vec(&staking::Transfer {
                to: Address([9; 20]),
                tokens: Quantity::from_u64(100),
            })
            .unwrap(),
        };
        let signed = SignedTransaction::sign(&keypair, app.chain_context(), tx).unwrap();
        let raw = encoding::to_vec(&signed).unwrap();

        app.begin_block(&block(1)).unwrap();
        let err = app.deliver_tx(&raw).unwrap_err();
        assert!(matches!(err, ChainError::InsufficientBalance(_)));
        app.end_block().unwrap();

        let account = app.staking_account(None, &from).unwrap();
        assert_eq!(account.general.balance, Quantity::from_u64(45));
        assert_eq!(account.general.nonce, 1);
        assert_eq!(
            app.staking_account(None, &Address([9; 20])).unwrap().general.balance,
            Quantity::zero()
        );
    }

    #[test]
    fn out_of_gas_leaves_state_untouched() {
        let keypair = generate_keypair();
        let from = Address::from_public_key(&PublicKey::from_keypair(&keypair));
        let mut doc = minimal_genesis();
        doc.staking
            .params
            .gas_costs
            .insert(staking::op::TRANSFER.to_string(), 100);
        fund(&mut doc, from, 1_000);
        let mut app = Application::from_genesis(&doc).unwrap();

        let tx = Transaction {
            nonce: 0,
            fee: Fee {
                amount: Quantity::from_u64(1),
                gas: 10,
            },
            method: staking::method::TRANSFER.to_string(),
            body: encoding::to_vec(&staking::Transfer {
                to: Address([9; 20]),
                tokens: Quantity::from_u64(100),
            })
            .unwrap(),
        };
        let signed = SignedTransaction::sign(&keypair, app.chain_context(), tx).unwrap();

        app.begin_block(&block(1)).unwrap();
        let err = app.deliver_tx(&encoding::to_vec(&signed).unwrap()).unwrap_err();
        assert!(matches!(err, ChainError::OutOfGas { .. }));
        app.end_block().unwrap();
        assert_eq!(
            app.staking_account(None, &Address([9; 20])).unwrap().general.balance,
            Quantity::zero()
        );
    }

    #[test]
    fn replaying_blocks_yields_identical_roots() {
        let run = || {
            let keypair = ed25519_dalek::Keypair {
                secret: ed25519_dalek::SecretKey::from_bytes(&[5; 32]).unwrap(),
                public: ed25519_dalek::PublicKey::from(&ed25519_dalek::SecretKey::from_bytes(&[5; 32]).unwrap()),
            };
            let from = Address::from_public_key(&PublicKey::from_keypair(&keypair));
            let mut doc = minimal_genesis();
            fund(&mut doc, from, 1_000);
            let mut app = Application::from_genesis(&doc).unwrap();
            let mut roots = Vec::new();
            for height in 1..=25u64 {
                app.begin_block(&block(height)).unwrap();
                if height == 3 {
                    let tx = Transaction {
                        nonce: 0,
                        fee: Fee::default(),
                        method: staking::method::ADD_ESCROW.to_string(),
                        body: encoding::to_vec(&staking::Escrow {
                            account: from,
                            tokens: Quantity::from_u64(300),
                        })
                        .unwrap(),
                    };
                    let signed =
                        SignedTransaction::sign(&keypair, app.chain_context(), tx).unwrap();
                    app.deliver_tx(&encoding::to_vec(&signed).unwrap()).unwrap();
                }
                roots.push(app.end_block().unwrap().state_root);
            }
            roots
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn past_height_queries_read_retained_snapshots() {
        let keypair = generate_keypair();
        let from = Address::from_public_key(&PublicKey::from_keypair(&keypair));
        let mut doc = minimal_genesis();
        fund(&mut doc, from, 500);
        let mut app = Application::from_genesis(&doc).unwrap();

        app.begin_block(&block(1)).unwrap();
        app.end_block().unwrap();

        let tx = Transaction {
            nonce: 0,
            fee: Fee::default(),
            method: staking::method::BURN.to_string(),
            body: encoding::to_vec(&staking::Burn {
                tokens: Quantity::from_u64(100),
            })
            .unwrap(),
        };
        let signed = SignedTransaction::sign(&keypair, app.chain_context(), tx).unwrap();
        app.begin_block(&block(2)).unwrap();
        app.deliver_tx(&encoding::to_vec(&signed).unwrap()).unwrap();
        app.end_block().unwrap();

        assert_eq!(
            app.staking_account(Some(1), &from).unwrap().general.balance,
            Quantity::from_u64(500)
        );
        assert_eq!(
            app.staking_account(None, &from).unwrap().general.balance,
            Quantity::from_u64(400)
        );
        assert_eq!(app.total_supply(Some(1)).unwrap(), Quantity::from_u64(500));
        assert_eq!(app.total_supply(None).unwrap(), Quantity::from_u64(400));
        assert!(app.staking_account(Some(999), &from).is_err());
    }
}
