//! # Identities and Peer Records
//!
//! Core identity types for the overlay:
//!
//! - [`Address`]: 512-bit identifier, the unit of the XOR metric
//! - [`Keypair`]: Ed25519 signing keypair backing a node's long-term identity
//! - [`PublicId`]: wire-transmissible identity material (public key)
//! - [`NodeInfo`]: one routing-table peer (identity, key, endpoints)
//! - [`Contact`]: persisted bootstrap record
//!
//! ## Identity model
//!
//! A node's [`Address`] is the 64-byte blake3 extended output of its Ed25519
//! public key. Possession of the signing key proves ownership of the
//! address; any peer holding a [`PublicId`] can re-derive and check the
//! address locally.
//!
//! ## XOR metric
//!
//! Distance between two addresses is their bitwise XOR read as a 512-bit
//! big-endian unsigned integer. The metric is symmetric and unidirectional:
//! for any address there is exactly one peer at each distance, so ordering
//! by distance to a target is strict: ties are impossible between distinct
//! addresses.

use std::net::SocketAddr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// Number of bytes in an [`Address`].
pub const ADDRESS_LENGTH: usize = 64;

/// Number of bits in an [`Address`]; bucket indices range over `0..ADDRESS_BITS`.
pub const ADDRESS_BITS: usize = ADDRESS_LENGTH * 8;

/// A 512-bit overlay identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(#[serde(with = "BigArray")] [u8; ADDRESS_LENGTH]);

impl Address {
    pub fn from_bytes(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Derive the address owned by an Ed25519 public key: the 64-byte
    /// blake3 extended output of the key bytes.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(public_key);
        let mut out = [0u8; ADDRESS_LENGTH];
        hasher.finalize_xof().fill(&mut out);
        Address(out)
    }

    /// Bitwise XOR of two addresses, read big-endian as the distance.
    pub fn xor_distance(&self, other: &Address) -> [u8; ADDRESS_LENGTH] {
        let mut result = [0u8; ADDRESS_LENGTH];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        result
    }

    /// Number of leading bits shared with `other`, in `0..ADDRESS_BITS`.
    ///
    /// This is the k-bucket index of `other` relative to `self`. Equal
    /// addresses never occur between distinct peers; the all-shared case
    /// saturates at `ADDRESS_BITS - 1`.
    pub fn bucket_index(&self, other: &Address) -> usize {
        let dist = self.xor_distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ADDRESS_BITS - 1
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

/// Compare two raw distances as big-endian unsigned integers.
pub fn distance_cmp(a: &[u8; ADDRESS_LENGTH], b: &[u8; ADDRESS_LENGTH]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// True if `lhs` is strictly closer to `target` than `rhs` is.
pub fn closer_to_target(lhs: &Address, rhs: &Address, target: &Address) -> bool {
    distance_cmp(&lhs.xor_distance(target), &rhs.xor_distance(target))
        == std::cmp::Ordering::Less
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl From<[u8; ADDRESS_LENGTH]> for Address {
    fn from(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Address(bytes)
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Ed25519 signing keypair. Created once at node start; immutable.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The overlay address owned by this keypair.
    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key_bytes())
    }

    pub fn public_id(&self) -> PublicId {
        PublicId {
            public_key: self.public_key_bytes(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Public identity material carried on the wire: the Ed25519 public key
/// from which the peer's [`Address`] is re-derived on receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicId {
    pub public_key: [u8; 32],
}

impl PublicId {
    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key)
    }

    /// Verify a detached signature over `message` against this key.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.public_key) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(signature)).is_ok()
    }
}

/// An (internal, external) UDP endpoint pair as advertised to peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPair {
    pub internal: SocketAddr,
    pub external: SocketAddr,
}

impl EndpointPair {
    pub fn new(internal: SocketAddr, external: SocketAddr) -> Self {
        Self { internal, external }
    }
}

/// One routing-table peer. Immutable after insertion except `connected`,
/// which flips once the transport confirms the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: Address,
    pub public_key: [u8; 32],
    pub endpoints: EndpointPair,
    pub connected: bool,
}

impl NodeInfo {
    pub fn new(public_id: PublicId, endpoints: EndpointPair) -> Self {
        Self {
            id: public_id.address(),
            public_key: public_id.public_key,
            endpoints,
            connected: false,
        }
    }

    pub fn public_id(&self) -> PublicId {
        PublicId {
            public_key: self.public_key,
        }
    }
}

/// A persisted bootstrap record: enough to dial a known peer and check who
/// answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Address,
    pub endpoints: EndpointPair,
}

impl Contact {
    pub fn new(id: Address, endpoints: EndpointPair) -> Self {
        Self { id, endpoints }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_with_prefix(prefix: u8) -> Address {
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes[0] = prefix;
        Address::from_bytes(bytes)
    }

    #[test]
    fn xor_distance_properties() {
        let a = addr_with_prefix(0b1010_0000);
        let b = addr_with_prefix(0b1100_0000);

        assert_eq!(a.xor_distance(&a), [0u8; ADDRESS_LENGTH]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&b)[0], 0b0110_0000);
    }

    #[test]
    fn bucket_index_counts_common_leading_bits() {
        let zero = Address::from_bytes([0u8; ADDRESS_LENGTH]);

        assert_eq!(zero.bucket_index(&addr_with_prefix(0b1000_0000)), 0);
        assert_eq!(zero.bucket_index(&addr_with_prefix(0b0100_0000)), 1);
        assert_eq!(zero.bucket_index(&addr_with_prefix(0b0000_0001)), 7);

        let mut far = [0u8; ADDRESS_LENGTH];
        far[8] = 0b0010_0000;
        assert_eq!(zero.bucket_index(&Address::from_bytes(far)), 66);

        let mut last = [0u8; ADDRESS_LENGTH];
        last[ADDRESS_LENGTH - 1] = 1;
        assert_eq!(zero.bucket_index(&Address::from_bytes(last)), ADDRESS_BITS - 1);
    }

    #[test]
    fn closer_to_target_is_strict() {
        let target = Address::from_bytes([0u8; ADDRESS_LENGTH]);
        let near = addr_with_prefix(0b0000_0001);
        let far = addr_with_prefix(0b1000_0000);

        assert!(closer_to_target(&near, &far, &target));
        assert!(!closer_to_target(&far, &near, &target));
        assert!(!closer_to_target(&near, &near, &target));
    }

    #[test]
    fn address_derivation_is_stable() {
        let keypair = Keypair::generate();
        let from_keypair = keypair.address();
        let from_public_id = keypair.public_id().address();

        assert_eq!(from_keypair, from_public_id);
        assert_ne!(from_keypair, Keypair::generate().address());
    }

    #[test]
    fn sign_and_verify() {
        let keypair = Keypair::generate();
        let message = b"find group response";
        let signature = keypair.sign(message).to_bytes();

        assert!(keypair.public_id().verify(message, &signature));
        assert!(!keypair.public_id().verify(b"tampered", &signature));

        let other = Keypair::generate();
        assert!(!other.public_id().verify(message, &signature));
    }

    #[test]
    fn keypair_round_trips_through_secret_bytes() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(keypair.address(), restored.address());
    }
}
