//! # Amino
//!
//! Kademlia DHT node: a structured overlay of peers organized by XOR
//! distance in a 256-bit id space, answering four services on top of it —
//! locate a peer, store and retrieve key/value records, and announce or
//! discover content providers.
//!
//! The transport is not part of this crate: the node consumes a
//! [Host](crate::host::Host) capability for streams, connectedness and the
//! address repository, and drives everything from a single actor thread.

// Public modules
mod common;
mod error;

pub mod dht;
pub mod host;
pub mod providers;
pub mod rpc;
pub mod storage;

pub use crate::common::{
    messages, now_unix, Connectedness, Distance, Key, Multiaddr, NodeId, PeerId, PeerInfo,
    PeerRoutingTable, Record, UpdateOutcome, DEFAULT_BUCKET_SIZE_K, ID_SIZE, KEY_SPACE_BITS,
};
pub use dht::{Kademlia, Response};
pub use error::Error;
pub use rpc::{Config, RandomWalkConfig};

// Alias Result to be the crate Result.
pub type Result<T, E = Error> = core::result::Result<T, E>;
