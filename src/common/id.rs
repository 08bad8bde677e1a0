//! Node identifiers, content keys and the XOR distance metric.

use std::fmt::{self, Debug, Formatter};

use bytes::Bytes;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::common::PeerId;
use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 32;

/// The width of the key space in bits.
pub const KEY_SPACE_BITS: u32 = ID_SIZE as u32 * 8;

/// Raw bytes of a content identifier.
///
/// Opaque to the node except for its hash-derived [NodeId].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Bytes);

impl Key {
    pub fn new<T: Into<Bytes>>(bytes: T) -> Key {
        Key(bytes.into())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", hex(&self.0))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// A point in the 256-bit key space, where XOR distance is measured from.
///
/// Derived from a peer id or from the SHA-256 of a content key.
pub struct NodeId(pub [u8; ID_SIZE]);

impl NodeId {
    pub fn random() -> NodeId {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        NodeId(random_bytes)
    }

    /// Create a new NodeId from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<NodeId> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidKey);
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(NodeId(tmp))
    }

    /// The point a content key maps to: SHA-256 of its raw bytes.
    pub fn from_key(key: &Key) -> NodeId {
        NodeId(Sha256::digest(key.as_ref()).into())
    }

    /// The point a peer maps to: SHA-256 of its id bytes.
    pub fn from_peer(peer: &PeerId) -> NodeId {
        NodeId(Sha256::digest(peer.as_bytes()).into())
    }

    /// XOR distance between this id and another.
    pub fn xor(&self, other: &NodeId) -> Distance {
        let mut result = [0u8; ID_SIZE];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(result)
    }

    /// The number of leading bits this id shares with another.
    ///
    /// Ranges from 0 (first bits differ) to [KEY_SPACE_BITS] (equal ids).
    /// Doubles as the routing table bucket index of `other` relative to self.
    pub fn common_prefix_len(&self, other: &NodeId) -> u32 {
        for i in 0..ID_SIZE {
            let xored = self.0[i] ^ other.0[i];

            if xored != 0 {
                return i as u32 * 8 + xored.leading_zeros();
            }
        }

        KEY_SPACE_BITS
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex(&self.0[..4]))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// XOR of two [NodeId]s, ordered as a 256-bit big-endian unsigned integer.
///
/// The ordering is total; two distinct peers can never be at the same
/// distance from a target.
pub struct Distance(pub [u8; ID_SIZE]);

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex(&self.0))
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        let id = NodeId::random();

        assert_eq!(id.xor(&id), Distance([0; ID_SIZE]));
        assert_eq!(id.common_prefix_len(&id), KEY_SPACE_BITS);
    }

    #[test]
    fn common_prefix_len() {
        let a = NodeId([0; ID_SIZE]);

        let mut flipped_first = [0; ID_SIZE];
        flipped_first[0] = 0b1000_0000;
        assert_eq!(a.common_prefix_len(&NodeId(flipped_first)), 0);

        let mut flipped_last = [0; ID_SIZE];
        flipped_last[ID_SIZE - 1] = 1;
        assert_eq!(a.common_prefix_len(&NodeId(flipped_last)), KEY_SPACE_BITS - 1);

        let mut second_byte = [0; ID_SIZE];
        second_byte[1] = 0b0100_0000;
        assert_eq!(a.common_prefix_len(&NodeId(second_byte)), 9);
    }

    #[test]
    fn xor_is_symmetric() {
        let a = NodeId::random();
        let b = NodeId::random();

        assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn distance_orders_as_big_endian_integer() {
        let origin = NodeId([0; ID_SIZE]);

        let mut one = [0; ID_SIZE];
        one[ID_SIZE - 1] = 1;
        let mut big = [0; ID_SIZE];
        big[0] = 1;

        assert!(origin.xor(&NodeId(one)) < origin.xor(&NodeId(big)));
    }

    #[test]
    fn key_derivation_is_deterministic() {
        let key = Key::new(&b"/ipns/record"[..]);

        assert_eq!(NodeId::from_key(&key), NodeId::from_key(&key));
        assert_ne!(
            NodeId::from_key(&key),
            NodeId::from_key(&Key::new(&b"/ipns/other"[..]))
        );
    }

    #[test]
    fn rejects_wrong_size() {
        assert!(NodeId::from_bytes([0u8; 20]).is_err());
        assert!(NodeId::from_bytes([0u8; ID_SIZE]).is_ok());
    }
}
