//! Signing, hashing and address derivation.
//!
//! All hashing is SHA-512/256. Signatures are ed25519 and always context
//! bound: the signed message is `H(context || payload)`, where the context is
//! a short ASCII string that domain-separates every signature on a chain (see
//! [`context_with_chain`]).

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Keypair, PublicKey as DalekPublicKey, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512_256};

use crate::errors::{ChainError, ChainResult};

/// A SHA-512/256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha512_256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    pub fn digest_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha512_256::new();
        for part in parts {
            hasher.update(part);
        }
        Hash(hasher.finalize().into())
    }

    /// The well-known hash of the empty input.
    pub fn empty() -> Self {
        Hash::digest(&[])
    }

    pub fn is_empty(&self) -> bool {
        *self == Hash::empty()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(data: &str) -> ChainResult<Self> {
        let bytes = hex::decode(data)
            .map_err(|err| ChainError::Crypto(format!("invalid hash encoding: {err}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChainError::Crypto("invalid hash length".into()))?;
        Ok(Hash(bytes))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Hash::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// A 32-byte ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn from_keypair(keypair: &Keypair) -> Self {
        PublicKey(keypair.public.to_bytes())
    }

    pub fn from_hex(data: &str) -> ChainResult<Self> {
        let bytes = hex::decode(data)
            .map_err(|err| ChainError::Crypto(format!("invalid public key encoding: {err}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChainError::Crypto("invalid public key length".into()))?;
        Ok(PublicKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn dalek(&self) -> ChainResult<DalekPublicKey> {
        DalekPublicKey::from_bytes(&self.0)
            .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        PublicKey::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// An ed25519 signature, hex in text positions.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn from_hex(data: &str) -> ChainResult<Self> {
        let bytes = hex::decode(data)
            .map_err(|err| ChainError::Crypto(format!("invalid signature encoding: {err}")))?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| ChainError::Crypto("invalid signature length".into()))?;
        Ok(Signature(bytes))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Signature::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// Binds a signature context to a specific chain. The chain context is the
/// hash of the canonical genesis document; without it, signatures made for
/// one network would replay on another.
pub fn context_with_chain(base: &str, chain_context: &str) -> String {
    format!("{base} for chain {chain_context}")
}

fn signing_digest(context: &str, message: &[u8]) -> [u8; 32] {
    Hash::digest_parts(&[context.as_bytes(), message]).0
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

/// A context-bound signature together with the key and the exact context
/// string it was produced under. Verifiers compare the context byte-for-byte
/// against the one they expect before touching the signature.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextSignature {
    pub public_key: PublicKey,
    pub context: String,
    pub signature: Signature,
}

impl ContextSignature {
    pub fn sign(keypair: &Keypair, context: &str, message: &[u8]) -> Self {
        let digest = signing_digest(context, message);
        let signature = keypair.sign(&digest);
        ContextSignature {
            public_key: PublicKey::from_keypair(keypair),
            context: context.to_string(),
            signature: Signature(signature.to_bytes()),
        }
    }

    pub fn verify(&self, expected_context: &str, message: &[u8]) -> ChainResult<()> {
        if self.context.as_bytes() != expected_context.as_bytes() {
            return Err(ChainError::InvalidArgument(format!(
                "consensus: unexpected signature context {:?}",
                self.context
            )));
        }
        let public = self.public_key.dalek()?;
        let signature = ed25519_dalek::Signature::from_bytes(&self.signature.0)
            .map_err(|err| ChainError::Crypto(format!("invalid signature bytes: {err}")))?;
        let digest = signing_digest(&self.context, message);
        public
            .verify(&digest, &signature)
            .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
    }
}

/// A 20-byte account address: the truncated SHA-512/256 of the public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 20]);

// Reserved addresses occupy a prefix no key-derived address can reach.
const RESERVED_PREFIX: [u8; 19] = [0xff; 19];

/// System-owned reserve funding rewards and receiving slashes.
pub const COMMON_POOL_ADDRESS: Address = Address([
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0x01,
]);

/// Holds the fees of the block being processed until disbursement.
pub const FEE_ACCUMULATOR_ADDRESS: Address = Address([
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0x02,
]);

impl Address {
    pub fn from_public_key(pk: &PublicKey) -> Self {
        let digest = Hash::digest(pk.as_bytes());
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest.0[..20]);
        Address(out)
    }

    /// Reserved addresses are structurally invalid as real accounts: no
    /// account-mutating transaction accepts them as signer or destination.
    pub fn is_reserved(&self) -> bool {
        self.0[..19] == RESERVED_PREFIX
    }

    pub fn from_hex(data: &str) -> ChainResult<Self> {
        let bytes = hex::decode(data)
            .map_err(|err| ChainError::Crypto(format!("invalid address encoding: {err}")))?;
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| ChainError::Crypto("invalid address length".into()))?;
        Ok(Address(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = ChainError;

    fn from_str(s: &str) -> ChainResult<Self> {
        Address::from_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Address::from_hex(&value).map_err(serde::de::Error::custom)
    }
}
