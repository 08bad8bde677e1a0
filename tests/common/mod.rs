//! Shared in-memory mesh harness for end-to-end tests.
//!
//! Every node gets a [MemoryHost] wired into one [MemoryNetwork]; streams
//! are in-process byte pipes, addresses are synthetic `/memory/<n>` strings
//! and connectedness is "registered in the mesh or not". Address TTLs are
//! accepted and ignored; nothing here lives long enough to expire.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use amino::host::{Host, StreamChannel};
use amino::{Config, Connectedness, Error, Kademlia, Multiaddr, PeerId, PeerInfo, Result};

#[derive(Default)]
struct Pipe {
    a_to_b: VecDeque<u8>,
    b_to_a: VecDeque<u8>,
    a_closed: bool,
    b_closed: bool,
}

/// One end of an in-memory duplex stream.
pub struct MemoryChannel {
    pipe: Arc<Mutex<Pipe>>,
    is_a: bool,
}

pub fn duplex() -> (MemoryChannel, MemoryChannel) {
    let pipe = Arc::new(Mutex::new(Pipe::default()));

    (
        MemoryChannel {
            pipe: pipe.clone(),
            is_a: true,
        },
        MemoryChannel { pipe, is_a: false },
    )
}

impl StreamChannel for MemoryChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.lock().unwrap();
        let (incoming, remote_closed) = if self.is_a {
            let remote_closed = pipe.b_closed;
            (&mut pipe.b_to_a, remote_closed)
        } else {
            let remote_closed = pipe.a_closed;
            (&mut pipe.a_to_b, remote_closed)
        };

        if incoming.is_empty() {
            if remote_closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let n = buf.len().min(incoming.len());
        for byte in buf.iter_mut().take(n) {
            *byte = incoming.pop_front().expect("non empty");
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.lock().unwrap();

        if self.is_a && pipe.b_closed || !self.is_a && pipe.a_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        let outgoing = if self.is_a {
            &mut pipe.a_to_b
        } else {
            &mut pipe.b_to_a
        };
        outgoing.extend(buf);
        Ok(buf.len())
    }

    fn close(&mut self) {
        let mut pipe = self.pipe.lock().unwrap();
        if self.is_a {
            pipe.a_closed = true;
        } else {
            pipe.b_closed = true;
        }
    }
}

#[derive(Default)]
struct NetworkInner {
    next_port: u64,
    inboxes: HashMap<PeerId, VecDeque<(PeerId, MemoryChannel)>>,
}

/// A simulated network of hosts.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh host in the mesh.
    pub fn host(&self) -> MemoryHost {
        let mut inner = self.inner.lock().unwrap();

        let id = PeerId::random();
        let port = inner.next_port;
        inner.next_port += 1;
        inner.inboxes.insert(id, VecDeque::new());

        let local = PeerInfo::new(id, vec![Multiaddr::new(format!("/memory/{port}"))]);

        MemoryHost {
            network: self.inner.clone(),
            local,
            addresses: HashMap::new(),
        }
    }
}

/// The [Host] capability backed by a [MemoryNetwork].
pub struct MemoryHost {
    network: Arc<Mutex<NetworkInner>>,
    local: PeerInfo,
    addresses: HashMap<PeerId, Vec<Multiaddr>>,
}

impl Host for MemoryHost {
    fn local_peer_info(&self) -> PeerInfo {
        self.local.clone()
    }

    fn register_protocol(&mut self, _protocol_id: &str) {}

    fn connectedness(&self, peer: &PeerInfo) -> Connectedness {
        if self.network.lock().unwrap().inboxes.contains_key(&peer.id) {
            Connectedness::CanConnect
        } else {
            Connectedness::CanNotConnect
        }
    }

    fn upsert_addresses(&mut self, peer: &PeerId, addresses: &[Multiaddr], _ttl: Duration) {
        let known = self.addresses.entry(*peer).or_default();

        for address in addresses {
            if !known.contains(address) {
                known.push(address.clone());
            }
        }
    }

    fn peer_info(&self, peer: &PeerId) -> PeerInfo {
        if *peer == self.local.id {
            return self.local.clone();
        }

        PeerInfo::new(
            *peer,
            self.addresses.get(peer).cloned().unwrap_or_default(),
        )
    }

    fn new_stream(&mut self, peer: &PeerId) -> Result<Box<dyn StreamChannel>> {
        let mut inner = self.network.lock().unwrap();

        let Some(inbox) = inner.inboxes.get_mut(peer) else {
            return Err(Error::Io(io::ErrorKind::NotConnected.into()));
        };

        let (near, far) = duplex();
        inbox.push_back((self.local.id, far));

        Ok(Box::new(near))
    }

    fn poll_inbound(&mut self) -> Option<(PeerId, Box<dyn StreamChannel>)> {
        let mut inner = self.network.lock().unwrap();

        let (peer, channel) = inner.inboxes.get_mut(&self.local.id)?.pop_front()?;

        Some((peer, Box::new(channel)))
    }

    fn poll_new_connection(&mut self) -> Option<PeerInfo> {
        None
    }
}

/// Config with short timeouts and the random walk off, for deterministic
/// tests.
pub fn test_config() -> Config {
    Config {
        query_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_millis(500),
        random_walk: amino::RandomWalkConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Spawn a node on a fresh host of the mesh.
pub fn spawn_node(network: &MemoryNetwork, config: Config) -> (Kademlia, PeerInfo) {
    let host = network.host();
    let info = host.local_peer_info();

    let dht = Kademlia::with_defaults(config, Box::new(host)).expect("node starts");

    (dht, info)
}

/// Tell `node` about `peer` so lookups can start from it.
pub fn introduce(node: &Kademlia, peer: &PeerInfo) {
    node.add_peer(peer.clone(), true).expect("node is running");
}
