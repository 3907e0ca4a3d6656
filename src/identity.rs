//! # Identifiers and Contacts
//!
//! Every node and every stored key lives in the same 160-bit identifier
//! space. Closeness is the Kademlia XOR metric: `distance(a, b) = a XOR b`
//! read as an unsigned big-endian integer.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Identifier`] | Node id or key id (20 bytes) |
//! | [`Contact`] | Identifier plus the UDP endpoint it answers on |
//!
//! Lookup code never orders identifiers by their raw value: it orders them by
//! [`Identifier::xor_distance`] to a reference, compared with [`distance_cmp`].

use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Identifier width in bytes.
pub const ID_BYTES: usize = 20;

/// Identifier width in bits; also the number of routing buckets.
pub const ID_BITS: usize = ID_BYTES * 8;

/// XOR distance between two identifiers.
pub type Distance = [u8; ID_BYTES];

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier([u8; ID_BYTES]);

impl Identifier {
    #[inline]
    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// A fresh identifier drawn from the OS random source.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive the identifier a user key is stored under.
    ///
    /// The key is hashed with BLAKE3 and truncated to the identifier width, so
    /// arbitrary byte strings map uniformly onto the keyspace.
    pub fn from_key(key: &[u8]) -> Self {
        let hash = blake3::hash(key);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&hash.as_bytes()[..ID_BYTES]);
        Self(bytes)
    }

    #[inline]
    pub fn xor_distance(&self, other: &Identifier) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Position of the highest set bit of `self XOR other`.
    ///
    /// Bucket 0 holds the single nearest neighbour slot, bucket 159 the
    /// farthest half of the keyspace. Returns `None` for identical ids: an
    /// identifier is never bucketed against itself.
    pub fn bucket_index(&self, other: &Identifier) -> Option<usize> {
        let dist = self.xor_distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                let leading = byte_idx * 8 + byte.leading_zeros() as usize;
                return Some(ID_BITS - 1 - leading);
            }
        }
        None
    }

    /// True if `a` is strictly closer to `self` than `b`.
    #[inline]
    pub fn is_closer(&self, a: &Identifier, b: &Identifier) -> bool {
        distance_cmp(&self.xor_distance(a), &self.xor_distance(b)) == Ordering::Less
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_BYTES];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Compare two XOR distances as unsigned big-endian integers.
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    a.cmp(b)
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_BYTES]> for Identifier {
    fn from(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Identifier {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A peer's identifier and the endpoint it was last reachable on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: Identifier,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: Identifier, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", &self.id.to_hex()[..8], self.addr)
    }
}

/// Sort contacts in place by ascending XOR distance to `target`.
pub fn sort_by_distance(contacts: &mut [Contact], target: &Identifier) {
    contacts.sort_by(|a, b| distance_cmp(&a.id.xor_distance(target), &b.id.xor_distance(target)));
}
