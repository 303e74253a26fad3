//! Tessera consensus application core.
//!
//! The deterministic application of a proof-of-stake, BFT-replicated
//! computation platform hosting isolated runtimes. The crate owns the
//! staking and registry state machines, per-epoch committee election and the
//! roothash protocol that finalizes runtime blocks from committee
//! commitments.
//!
//! External collaborators are consumed through narrow interfaces: the BFT
//! engine drives [`app::Application`] through BeginBlock / DeliverTx /
//! EndBlock, the authenticated key-value store behind [`mkvs::Tree`] is
//! replaceable by a persistent implementation, and commitment gossip arrives
//! as ordinary signed transactions.

pub mod app;
pub mod config;
pub mod context;
pub mod crypto;
pub mod encoding;
pub mod epochtime;
pub mod errors;
pub mod gas;
pub mod genesis;
pub mod mkvs;
pub mod quantity;
pub mod registry;
pub mod roothash;
pub mod scheduler;
pub mod staking;

pub use app::Application;
pub use errors::{ChainError, ChainResult};
pub use quantity::Quantity;
