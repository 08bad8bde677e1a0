//! Peer identity and addressing types.

use std::fmt::{self, Debug, Display, Formatter};

use crate::common::id::{hex, ID_SIZE};
use crate::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Identifier of a peer: the multihash digest of its public key.
pub struct PeerId(pub [u8; ID_SIZE]);

impl PeerId {
    /// Create a new PeerId from some bytes. Returns Err if `bytes` is not of
    /// length [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<PeerId> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidKey);
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(PeerId(tmp))
    }

    /// Wrap a raw SHA-256 digest as a peer id.
    ///
    /// Used by the random walk to synthesize lookup targets.
    pub fn from_hash(hash: [u8; ID_SIZE]) -> PeerId {
        PeerId(hash)
    }

    pub fn random() -> PeerId {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rand::Rng::gen(&mut rng);

        PeerId(random_bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex(&self.0[..4]))
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
/// A network address of a peer, kept as an opaque string.
///
/// Addresses are hints; the authoritative store is the host's address
/// repository.
pub struct Multiaddr(pub String);

impl Multiaddr {
    pub fn new<T: Into<String>>(address: T) -> Multiaddr {
        Multiaddr(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Multiaddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for Multiaddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Multiaddr({})", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
/// A peer id together with the addresses it is believed reachable at.
pub struct PeerInfo {
    pub id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addresses: Vec<Multiaddr>) -> PeerInfo {
        PeerInfo { id, addresses }
    }

    /// A peer info carrying no address hints.
    pub fn bare(id: PeerId) -> PeerInfo {
        PeerInfo {
            id,
            addresses: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
/// The connection manager's best estimate of whether a peer is reachable.
pub enum Connectedness {
    NotConnected,
    Connected,
    CanConnect,
    CanNotConnect,
}

impl From<Connectedness> for u8 {
    fn from(value: Connectedness) -> u8 {
        match value {
            Connectedness::NotConnected => 0,
            Connectedness::Connected => 1,
            Connectedness::CanConnect => 2,
            Connectedness::CanNotConnect => 3,
        }
    }
}

impl From<u8> for Connectedness {
    fn from(value: u8) -> Connectedness {
        match value {
            1 => Connectedness::Connected,
            2 => Connectedness::CanConnect,
            3 => Connectedness::CanNotConnect,
            _ => Connectedness::NotConnected,
        }
    }
}
