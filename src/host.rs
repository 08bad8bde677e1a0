//! Capabilities the node consumes from the surrounding peer-to-peer host.
//!
//! The transport (connection manager, stream multiplexer, secure channel) is
//! an external collaborator; the node only sees it through the [Host] trait.
//! Implementations are expected to be driven from the node's single actor
//! thread, so none of the methods may block.

use std::io;
use std::time::Duration;

use crate::common::{Connectedness, Multiaddr, PeerId, PeerInfo};
use crate::Result;

/// Address TTL for peers added permanently (e.g. self).
pub const TTL_PERMANENT: Duration = Duration::from_secs(u64::MAX / 4);

/// Address TTL for peers learned from the network.
pub const TTL_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// One duplex byte stream, non-blocking on both sides.
///
/// `read` returns `Ok(0)` once the remote side closed, and
/// [io::ErrorKind::WouldBlock] while no data is pending.
pub trait StreamChannel: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Close this side of the stream. Closing twice is a no-op.
    fn close(&mut self);
}

/// The peer-to-peer host: identity, address repository, connection manager
/// and stream lifecycle, reduced to what the node needs.
pub trait Host: Send {
    /// This node's own id and listen addresses.
    fn local_peer_info(&self) -> PeerInfo;

    /// Announce the stream protocol the node answers on; inbound streams for
    /// it are surfaced through [Host::poll_inbound].
    fn register_protocol(&mut self, protocol_id: &str);

    /// The connection manager's reachability estimate for a peer.
    fn connectedness(&self, peer: &PeerInfo) -> Connectedness;

    /// Add or refresh addresses in the address repository.
    fn upsert_addresses(&mut self, peer: &PeerId, addresses: &[Multiaddr], ttl: Duration);

    /// The address repository's view of a peer; `addresses` is empty for
    /// unknown peers.
    fn peer_info(&self, peer: &PeerId) -> PeerInfo;

    /// Open an outbound stream to a peer over the registered protocol.
    fn new_stream(&mut self, peer: &PeerId) -> Result<Box<dyn StreamChannel>>;

    /// Next accepted inbound stream, if any.
    fn poll_inbound(&mut self) -> Option<(PeerId, Box<dyn StreamChannel>)>;

    /// Next "new outbound connection" event from the host's event bus, if
    /// any.
    fn poll_new_connection(&mut self) -> Option<PeerInfo>;
}
