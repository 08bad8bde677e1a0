//! Common types used across the crate.

mod id;
pub mod messages;
mod peer;
mod record;
mod routing_table;

pub use id::{Distance, Key, NodeId, ID_SIZE, KEY_SPACE_BITS};
pub use peer::{Connectedness, Multiaddr, PeerId, PeerInfo};
pub use record::{now_unix, Record};
pub use routing_table::{PeerRoutingTable, UpdateOutcome, DEFAULT_BUCKET_SIZE_K};
