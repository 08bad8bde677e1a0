//! Dht node facade.
//!
//! [Kademlia] is a cheap-to-clone handle to a node running on its own actor
//! thread. All operations go through a channel to the actor; handlers are
//! therefore never invoked synchronously inside the API call, even on local
//! hits.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;

use crate::common::{Key, PeerId, PeerInfo, Record};
use crate::host::Host;
use crate::rpc::{Config, KademliaNode, ProviderSender, ResponseMessage};
use crate::storage::{DefaultValidator, MemoryStorage, Storage, Validator};
use crate::{Error, Result};

/// Pace of the actor loop when no API calls arrive.
const TICK_INTERVAL: Duration = Duration::from_micros(200);

#[derive(Debug)]
/// Handle to a Kademlia DHT node.
pub struct Kademlia {
    sender: flume::Sender<ActorMessage>,
    handle: Option<JoinHandle<()>>,
}

impl Clone for Kademlia {
    fn clone(&self) -> Self {
        Kademlia {
            sender: self.sender.clone(),
            handle: None,
        }
    }
}

impl Kademlia {
    /// Start a node over the given host with explicit storage and validator.
    pub fn new(
        config: Config,
        host: Box<dyn Host>,
        storage: Box<dyn Storage>,
        validator: Box<dyn Validator>,
    ) -> Result<Self> {
        let (sender, receiver) = flume::unbounded();

        let node = KademliaNode::new(config, host, storage, validator);

        let handle = thread::Builder::new()
            .name("amino-dht".to_string())
            .spawn(move || run(node, receiver))?;

        Ok(Kademlia {
            sender,
            handle: Some(handle),
        })
    }

    /// Start a node with in-memory storage and the default validator.
    pub fn with_defaults(config: Config, host: Box<dyn Host>) -> Result<Self> {
        Self::new(
            config,
            host,
            Box::<MemoryStorage>::default(),
            Box::new(DefaultValidator),
        )
    }

    // === Getters ===

    /// Returns the node's peer id.
    pub fn id(&self) -> Result<PeerId> {
        let (sender, receiver) = flume::bounded(1);
        self.sender.send(ActorMessage::Id(sender))?;

        Ok(receiver.recv()?)
    }

    /// Returns the number of peers in the routing table.
    pub fn routing_table_size(&self) -> Result<usize> {
        let (sender, receiver) = flume::bounded(1);
        self.sender.send(ActorMessage::RoutingTableSize(sender))?;

        Ok(receiver.recv()?)
    }

    /// Returns a clone of the routing table.
    pub fn routing_table(&self) -> Result<crate::common::PeerRoutingTable> {
        let (sender, receiver) = flume::bounded(1);
        self.sender.send(ActorMessage::RoutingTable(sender))?;

        Ok(receiver.recv()?)
    }

    // === Public Methods ===

    /// Validate and store a record locally.
    pub fn put_value<T: Into<Bytes>>(&self, key: Key, value: T) -> Result<()> {
        let (sender, receiver) = flume::bounded(1);
        self.sender
            .send(ActorMessage::PutValue(key, value.into(), sender))?;

        receiver.recv()?
    }

    /// Resolve a record, locally or with an iterative lookup.
    pub fn get_value(&self, key: Key) -> Result<Record> {
        let (sender, receiver) = flume::bounded(1);
        self.sender.send(ActorMessage::GetValue(key, sender))?;

        receiver.recv()?
    }

    /// Become a provider for `key`; with `notify`, announce it to the k
    /// closest peers and wait for the announcement to finish.
    pub fn provide(&self, key: Key, notify: bool) -> Result<()> {
        let (sender, receiver) = flume::bounded(1);
        self.sender
            .send(ActorMessage::Provide(key, notify, sender))?;

        receiver.recv()?
    }

    /// Stream providers of `key` as they are discovered, deduped, up to
    /// `limit` (0 means unlimited).
    pub fn find_providers(&self, key: Key, limit: usize) -> Response<PeerInfo> {
        let (sender, receiver) = flume::unbounded();

        let _ = self
            .sender
            .send(ActorMessage::FindProviders(key, limit, sender));

        Response { receiver }
    }

    /// Resolve a peer's addresses.
    pub fn find_peer(&self, peer: PeerId) -> Result<PeerInfo> {
        let (sender, receiver) = flume::bounded(1);
        self.sender.send(ActorMessage::FindPeer(peer, sender))?;

        receiver.recv()?
    }

    /// Upsert a peer into the address repository and the routing table.
    pub fn add_peer(&self, info: PeerInfo, permanent: bool) -> Result<()> {
        self.sender.send(ActorMessage::AddPeer(info, permanent))?;

        Ok(())
    }

    /// Run one random lookup to populate the routing table.
    pub fn bootstrap(&self) -> Result<()> {
        let (sender, receiver) = flume::bounded(1);
        self.sender.send(ActorMessage::Bootstrap(sender))?;

        receiver.recv()?
    }

    /// Stop the actor thread. Pending operations observe [Error::Shutdown].
    pub fn shutdown(&mut self) {
        let _ = self.sender.send(ActorMessage::Shutdown);

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(mut node: KademliaNode, receiver: flume::Receiver<ActorMessage>) {
    loop {
        // Pace the loop on the actor channel so API calls wake it early.
        match receiver.recv_timeout(TICK_INTERVAL) {
            Ok(ActorMessage::Shutdown) => break,
            Ok(message) => handle_actor_message(&mut node, message),
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }

        // Drain whatever else queued up meanwhile.
        loop {
            match receiver.try_recv() {
                Ok(ActorMessage::Shutdown) => return,
                Ok(message) => handle_actor_message(&mut node, message),
                Err(_) => break,
            }
        }

        node.tick();
    }
}

fn handle_actor_message(node: &mut KademliaNode, message: ActorMessage) {
    match message {
        ActorMessage::Shutdown => unreachable!("handled by the loop"),
        ActorMessage::Id(sender) => {
            let _ = sender.send(*node.id());
        }
        ActorMessage::RoutingTableSize(sender) => {
            let _ = sender.send(node.routing_table_size());
        }
        ActorMessage::RoutingTable(sender) => {
            let _ = sender.send(node.routing_table());
        }
        ActorMessage::PutValue(key, value, sender) => {
            node.put_value(key, value, sender);
        }
        ActorMessage::GetValue(key, sender) => {
            node.get_value(key, sender);
        }
        ActorMessage::Provide(key, notify, sender) => {
            node.provide(key, notify, sender);
        }
        ActorMessage::FindProviders(key, limit, sender) => {
            node.find_providers(key, limit, sender);
        }
        ActorMessage::FindPeer(peer, sender) => {
            node.find_peer(peer, sender);
        }
        ActorMessage::AddPeer(info, permanent) => {
            node.add_peer(info, permanent);
        }
        ActorMessage::Bootstrap(sender) => {
            node.bootstrap(sender);
        }
    }
}

enum ActorMessage {
    Shutdown,
    Id(flume::Sender<PeerId>),
    RoutingTableSize(flume::Sender<usize>),
    RoutingTable(flume::Sender<crate::common::PeerRoutingTable>),
    PutValue(Key, Bytes, flume::Sender<Result<()>>),
    GetValue(Key, flume::Sender<Result<Record>>),
    Provide(Key, bool, flume::Sender<Result<()>>),
    FindProviders(Key, usize, ProviderSender),
    FindPeer(PeerId, flume::Sender<Result<PeerInfo>>),
    AddPeer(PeerInfo, bool),
    Bootstrap(flume::Sender<Result<()>>),
}

/// Blocking iterator over the items of a streaming response.
///
/// Ends when the query converges or the node shuts down.
pub struct Response<T> {
    receiver: flume::Receiver<ResponseMessage<T>>,
}

impl<T> Iterator for Response<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        match self.receiver.recv() {
            Ok(ResponseMessage::Value(value)) => Some(value),
            Ok(ResponseMessage::Done) | Err(_) => None,
        }
    }
}
