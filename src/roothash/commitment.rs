//! Committee commitments.
//!
//! Executor workers commit to their compute results; merge workers bundle a
//! set of agreeing executor commitments with the parent block header they
//! propose. Every commitment is context-signed by the committing node's
//! identity key, and storage receipts bind the result roots to the storage
//! committee.

use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::crypto::{ContextSignature, Hash, PublicKey, Signature};
use crate::encoding;
use crate::errors::{ChainError, ChainResult};
use crate::registry::Namespace;
use crate::scheduler::Committee;

use super::Header;

/// Signature contexts. The effective context is bound to the chain context;
/// see [`crate::crypto::context_with_chain`].
pub mod sigctx {
    pub const EXECUTOR_COMMITMENT: &str = "tessera/roothash: executor commitment";
    pub const MERGE_COMMITMENT: &str = "tessera/roothash: merge commitment";
    pub const STORAGE_RECEIPT: &str = "tessera/roothash: storage receipt";
    pub const BATCH_DISPATCH: &str = "tessera/roothash: batch dispatch";
}

/// The header of computation results, the unit executor agreement is decided
/// on: two executors agree iff their encoded headers are bit-identical.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputeResultsHeader {
    pub previous_hash: Hash,
    pub io_root: Hash,
    pub state_root: Hash,
    pub messages: Vec<super::RuntimeMessage>,
}

impl ComputeResultsHeader {
    pub fn encoded_hash(&self) -> ChainResult<Hash> {
        encoding::hash_of(self)
    }
}

/// The storage receipt body signed by storage committee members.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageReceiptBody {
    pub version: u16,
    pub namespace: Namespace,
    pub round: u64,
    pub roots: Vec<Hash>,
}

/// Verifies a set of storage receipt signatures over `{namespace, round,
/// roots}` against the current storage committee.
pub fn verify_storage_receipts(
    signatures: &[ContextSignature],
    expected_context: &str,
    namespace: &Namespace,
    round: u64,
    roots: &[Hash],
    storage_committee: &Committee,
) -> ChainResult<()> {
    if signatures.is_empty() {
        return Err(ChainError::InvalidArgument(
            "roothash: missing storage receipts".into(),
        ));
    }
    let body = StorageReceiptBody {
        version: 1,
        namespace: *namespace,
        round,
        roots: roots.to_vec(),
    };
    let bytes = encoding::to_vec(&body)?;
    for signature in signatures {
        signature.verify(expected_context, &bytes)?;
        if !storage_committee.is_member(&signature.public_key) {
            return Err(ChainError::Forbidden(format!(
                "roothash: storage receipt from non-member {}",
                signature.public_key
            )));
        }
    }
    Ok(())
}

pub fn sign_storage_receipt(
    keypair: &Keypair,
    context: &str,
    namespace: &Namespace,
    round: u64,
    roots: &[Hash],
) -> ChainResult<ContextSignature> {
    let body = StorageReceiptBody {
        version: 1,
        namespace: *namespace,
        round,
        roots: roots.to_vec(),
    };
    Ok(ContextSignature::sign(keypair, context, &encoding::to_vec(&body)?))
}

/// The batch dispatch signed by the transaction-scheduler leader; executors
/// cite it to prove the input batch identity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchDispatch {
    pub committee_id: Hash,
    pub input_root: Hash,
}

pub fn sign_batch_dispatch(
    keypair: &Keypair,
    context: &str,
    committee_id: Hash,
    input_root: Hash,
) -> ChainResult<ContextSignature> {
    let body = BatchDispatch {
        committee_id,
        input_root,
    };
    Ok(ContextSignature::sign(keypair, context, &encoding::to_vec(&body)?))
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputeBody {
    /// Encoded hash of the executor committee this commitment cites.
    pub committee_id: Hash,
    pub header: ComputeResultsHeader,
    pub storage_signatures: Vec<ContextSignature>,
    /// Signature by an enclave-attested key, when the runtime runs in a TEE.
    pub rak_signature: Option<Signature>,
    /// The transaction scheduler's batch dispatch signature.
    pub txn_scheduler_signature: ContextSignature,
    pub input_root: Hash,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorCommitment {
    pub body: ComputeBody,
    pub signature: ContextSignature,
}

impl ExecutorCommitment {
    pub fn sign(keypair: &Keypair, context: &str, body: ComputeBody) -> ChainResult<Self> {
        let bytes = encoding::to_vec(&body)?;
        Ok(ExecutorCommitment {
            signature: ContextSignature::sign(keypair, context, &bytes),
            body,
        })
    }

    /// Verifies the signature and returns the committing node's key.
    pub fn open(&self, expected_context: &str) -> ChainResult<PublicKey> {
        let bytes = encoding::to_vec(&self.body)?;
        self.signature.verify(expected_context, &bytes)?;
        Ok(self.signature.public_key)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeBody {
    pub executor_commits: Vec<ExecutorCommitment>,
    /// The proposed parent block header.
    pub header: Header,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeCommitment {
    pub body: MergeBody,
    pub signature: ContextSignature,
}

impl MergeCommitment {
    pub fn sign(keypair: &Keypair, context: &str, body: MergeBody) -> ChainResult<Self> {
        let bytes = encoding::to_vec(&body)?;
        Ok(MergeCommitment {
            signature: ContextSignature::sign(keypair, context, &bytes),
            body,
        })
    }

    pub fn open(&self, expected_context: &str) -> ChainResult<PublicKey> {
        let bytes = encoding::to_vec(&self.body)?;
        self.signature.verify(expected_context, &bytes)?;
        Ok(self.signature.public_key)
    }
}

/// The `roothash.MergeCommit` transaction body.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeCommit {
    pub runtime_id: Namespace,
    pub commits: Vec<MergeCommitment>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{CommitteeKind, CommitteeNode, Role};

    fn keypair(seed: u8) -> Keypair {
        let secret = ed25519_dalek::SecretKey::from_bytes(&[seed; 32]).unwrap();
        let public = ed25519_dalek::PublicKey::from(&secret);
        Keypair { secret, public }
    }

    fn storage_committee(members: &[&Keypair]) -> Committee {
        Committee {
            kind: CommitteeKind::Storage,
            runtime_id: Namespace([0x80; 32]),
            members: members
                .iter()
                .map(|kp| CommitteeNode {
                    role: Role::Worker,
                    public_key: PublicKey(kp.public.to_bytes()),
                })
                .collect(),
            valid_for: 1,
        }
    }

    #[test]
    fn storage_receipts_verify_against_committee() {
        let signer = keypair(1);
        let committee = storage_committee(&[&signer]);
        let ns = Namespace([0x80; 32]);
        let roots = vec![Hash::digest(b"io"), Hash::digest(b"state")];
        let receipt =
            sign_storage_receipt(&signer, sigctx::STORAGE_RECEIPT, &ns, 3, &roots).unwrap();

        verify_storage_receipts(
            &[receipt.clone()],
            sigctx::STORAGE_RECEIPT,
            &ns,
            3,
            &roots,
            &committee,
        )
        .unwrap();

        // Receipt for a different round fails.
        let err = verify_storage_receipts(
            &[receipt.clone()],
            sigctx::STORAGE_RECEIPT,
            &ns,
            4,
            &roots,
            &committee,
        )
        .unwrap_err();
        assert!(matches!(err, ChainError::Crypto(_)));

        // Non-member signer is rejected.
        let outsider = keypair(2);
        let outsider_committee = storage_committee(&[&outsider]);
        let err = verify_storage_receipts(
            &[receipt],
            sigctx::STORAGE_RECEIPT,
            &ns,
            3,
            &roots,
            &outsider_committee,
        )
        .unwrap_err();
        assert!(matches!(err, ChainError::Forbidden(_)));
    }

    #[test]
    fn executor_commitment_roundtrip() {
        let node = keypair(3);
        let txn_leader = keypair(4);
        let committee_id = Hash::digest(b"committee");
        let input_root = Hash::digest(b"input");
        let body = ComputeBody {
            committee_id,
            header: ComputeResultsHeader {
                previous_hash: Hash::digest(b"prev"),
                io_root: Hash::digest(b"io"),
                state_root: Hash::digest(b"state"),
                messages: Vec::new(),
            },
            storage_signatures: Vec::new(),
            rak_signature: None,
            txn_scheduler_signature: sign_batch_dispatch(
                &txn_leader,
                sigctx::BATCH_DISPATCH,
                committee_id,
                input_root,
            )
            .unwrap(),
            input_root,
        };
        let commit =
            ExecutorCommitment::sign(&node, sigctx::EXECUTOR_COMMITMENT, body.clone()).unwrap();
        let signer = commit.open(sigctx::EXECUTOR_COMMITMENT).unwrap();
        assert_eq!(signer, PublicKey(node.public.to_bytes()));
        assert!(commit.open(sigctx::MERGE_COMMITMENT).is_err());
    }
}
