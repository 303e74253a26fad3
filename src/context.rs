//! Per-block and per-transaction execution context.
//!
//! A [`Context`] is threaded through every state transition. It carries the
//! clock (height and epoch), the transaction signer, the gas meter and the
//! event buffer. Events are serialized into consensus tags as they are
//! emitted; block-level events carry the empty hash in place of a
//! transaction hash.

use serde::Serialize;

use crate::crypto::{Address, Hash, PublicKey};
use crate::encoding;
use crate::epochtime::EpochTime;
use crate::errors::{ChainError, ChainResult};
use crate::gas::GasMeter;

/// A consensus event tag: subsystem module, event kind, canonical payload and
/// the hash of the originating transaction (empty for block-level events).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventTag {
    pub module: &'static str,
    pub kind: &'static str,
    pub payload: Vec<u8>,
    pub tx_hash: Hash,
}

impl EventTag {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> ChainResult<T> {
        encoding::from_slice(&self.payload)
    }
}

pub struct Context {
    pub height: u64,
    /// Block time reported by the BFT engine, seconds since the epoch.
    pub time: u64,
    pub epoch: EpochTime,
    pub epoch_changed: bool,
    pub tx_signer: Option<PublicKey>,
    pub tx_hash: Hash,
    pub gas: GasMeter,
    events: Vec<EventTag>,
}

impl Context {
    /// A block-level context: unlimited gas, no signer, empty tx hash.
    pub fn for_block(height: u64, time: u64, epoch: EpochTime, epoch_changed: bool) -> Self {
        Self {
            height,
            time,
            epoch,
            epoch_changed,
            tx_signer: None,
            tx_hash: Hash::default(),
            gas: GasMeter::unlimited(),
            events: Vec::new(),
        }
    }

    pub fn for_tx(&self, signer: PublicKey, tx_hash: Hash, gas: GasMeter) -> Self {
        Self {
            height: self.height,
            time: self.time,
            epoch: self.epoch,
            epoch_changed: false,
            tx_signer: Some(signer),
            tx_hash,
            gas,
            events: Vec::new(),
        }
    }

    pub fn signer(&self) -> ChainResult<PublicKey> {
        self.tx_signer
            .ok_or_else(|| ChainError::Fatal("consensus: no transaction signer".into()))
    }

    pub fn signer_address(&self) -> ChainResult<Address> {
        Ok(Address::from_public_key(&self.signer()?))
    }

    pub fn emit<T: Serialize>(
        &mut self,
        module: &'static str,
        kind: &'static str,
        event: &T,
    ) -> ChainResult<()> {
        self.events.push(EventTag {
            module,
            kind,
            payload: encoding::to_vec(event)?,
            tx_hash: self.tx_hash,
        });
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<EventTag> {
        std::mem::take(&mut self.events)
    }

    /// Merges a child (per-transaction) context's events back into this one.
    pub fn absorb(&mut self, mut child: Context) {
        self.events.append(&mut child.events);
    }
}
