use std::io;

use thiserror::Error;

/// Errors surfaced by the consensus application.
///
/// Transaction-level failures carry a stable textual context identifying the
/// subsystem (for example `"staking: insufficient balance"`). Only the module
/// identifier and a numeric code cross the consensus boundary; see
/// [`ChainError::module_code`].
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("insufficient stake: {0}")]
    InsufficientStake(String),
    #[error("out of gas: limit {limit}, wanted {wanted}")]
    OutOfGas { limit: u64, wanted: u64 },
    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_cbor::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Detected invariant violation. The node halts; never surfaced to users
    /// as recoverable.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ChainError {
    /// Stable module identifier and numeric code for light clients.
    ///
    /// The module is the textual context prefix (up to the first `':'`) of
    /// the inner message, or `"unknown"` when the variant carries none.
    pub fn module_code(&self) -> (&str, u32) {
        // Not every message carries a subsystem prefix.
        fn module(msg: &str) -> &str {
            match msg.split_once(':') {
                Some((m, _)) if !m.contains(' ') => m,
                _ => "unknown",
            }
        }
        match self {
            ChainError::InvalidArgument(m) => (module(m), 1),
            ChainError::Forbidden(m) => (module(m), 2),
            ChainError::InsufficientBalance(m) => (module(m), 3),
            ChainError::InsufficientStake(m) => (module(m), 4),
            ChainError::OutOfGas { .. } => ("consensus", 5),
            ChainError::InvalidNonce { .. } => ("consensus", 6),
            ChainError::NotFound(m) => (module(m), 7),
            ChainError::Crypto(_) => ("consensus", 8),
            ChainError::Serialization(_) => ("consensus", 9),
            ChainError::Config(_) => ("consensus", 10),
            ChainError::Io(_) => ("consensus", 11),
            ChainError::Fatal(_) => ("consensus", 12),
        }
    }

}

pub type ChainResult<T> = Result<T, ChainError>;
