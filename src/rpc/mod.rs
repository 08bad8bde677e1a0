//! The Kademlia node core.
//!
//! [KademliaNode] owns the routing table, the content routing table, local
//! storage, the session map and every running query. It is not thread-safe:
//! everything happens on the single actor loop that calls
//! [KademliaNode::tick], which is what [Dht](crate::dht::Kademlia) runs in
//! its background thread. Useful directly for custom actor setups.

mod closest_peers;
pub mod config;
mod iterative_query;
mod put_query;
mod random_walk;
mod server;
mod sessions;

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::common::messages::{Message, Peer};
use crate::common::{
    now_unix, Connectedness, Key, NodeId, PeerId, PeerInfo, PeerRoutingTable, Record,
    UpdateOutcome,
};
use crate::host::{Host, TTL_DAY, TTL_PERMANENT};
use crate::providers::ContentRoutingTable;
use crate::storage::{Storage, Validator};
use crate::{Error, Result};

pub use config::{
    Config, RandomWalkConfig, DEFAULT_PROTOCOL_ID, DEFAULT_QUERY_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};

use iterative_query::{IterativeQuery, QueryKind};
use put_query::PutQuery;
use random_walk::RandomWalk;
use sessions::{SessionEvent, SessionId, Sessions};

/// One item of a streaming response.
#[derive(Debug, Clone)]
pub enum ResponseMessage<T> {
    Value(T),
    Done,
}

pub(crate) type ProviderSender = flume::Sender<ResponseMessage<PeerInfo>>;

/// A lookup in flight, together with who is waiting for it.
#[derive(Debug)]
struct RunningQuery {
    query: IterativeQuery,
    context: QueryContext,
    /// Outbound exchanges this lookup owns.
    sessions: HashMap<SessionId, PeerId>,
}

#[derive(Debug)]
enum QueryContext {
    /// Locate a peer. No sender when the lookup is a random walk; discovered
    /// peers land in the routing table either way.
    FindPeer {
        sender: Option<flume::Sender<Result<PeerInfo>>>,
    },
    GetValue {
        key: Key,
        sender: flume::Sender<Result<Record>>,
    },
    FindProviders {
        sender: ProviderSender,
    },
    /// FindNode lookup followed by an ADD_PROVIDER fan-out.
    Announce {
        key: Key,
        sender: Option<flume::Sender<Result<()>>>,
    },
}

#[derive(Debug)]
struct RunningPut {
    put: PutQuery,
    sender: Option<flume::Sender<Result<()>>>,
    sessions: HashSet<SessionId>,
}

/// The node core driven by the actor loop.
pub struct KademliaNode {
    config: Config,
    local: PeerInfo,

    host: Box<dyn Host>,
    storage: Box<dyn Storage>,
    validator: Box<dyn Validator>,

    routing_table: PeerRoutingTable,
    providers: ContentRoutingTable,

    sessions: Sessions,
    queries: HashMap<u64, RunningQuery>,
    put_queries: HashMap<u64, RunningPut>,
    next_query_id: u64,

    random_walk: RandomWalk,
}

impl std::fmt::Debug for KademliaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KademliaNode")
            .field("local", &self.local)
            .field("routing_table_size", &self.routing_table.size())
            .field("sessions", &self.sessions.len())
            .field("queries", &self.queries.len())
            .finish()
    }
}

impl KademliaNode {
    pub fn new(
        config: Config,
        mut host: Box<dyn Host>,
        storage: Box<dyn Storage>,
        validator: Box<dyn Validator>,
    ) -> Self {
        let local = host.local_peer_info();

        host.register_protocol(&config.protocol_id);

        let mut node = KademliaNode {
            local: local.clone(),
            routing_table: PeerRoutingTable::with_bucket_size(local.id, config.closer_peer_count),
            providers: ContentRoutingTable::new(config.provider_ttl),
            sessions: Sessions::new(config.request_timeout),
            queries: HashMap::new(),
            put_queries: HashMap::new(),
            next_query_id: 0,
            random_walk: RandomWalk::new(config.random_walk.clone()),
            host,
            storage,
            validator,
            config,
        };

        // Save ourselves into the peer repository.
        node.add_peer(local, true);

        node
    }

    // === Getters ===

    /// Returns this node's peer id.
    pub fn id(&self) -> &PeerId {
        &self.local.id
    }

    pub fn local_peer_info(&self) -> &PeerInfo {
        &self.local
    }

    pub fn routing_table_size(&self) -> usize {
        self.routing_table.size()
    }

    /// Returns a clone of the routing table.
    pub fn routing_table(&self) -> PeerRoutingTable {
        self.routing_table.clone()
    }

    // === Public Methods ===

    /// Advance inbound streams, running queries and the random walk;
    /// everything that needs to happen at every turn of the actor loop.
    pub fn tick(&mut self) {
        // New outbound connections reported by the host's event bus.
        while let Some(info) = self.host.poll_new_connection() {
            debug!(peer = ?info.id, "New outbound connection");
            self.add_peer(info, false);
        }

        // Accepted inbound streams become sessions; the remote peer itself
        // is a routing observation.
        while let Some((peer, channel)) = self.host.poll_inbound() {
            self.add_peer(PeerInfo::bare(peer), false);
            self.sessions.accept(peer, channel);
        }

        let now = Instant::now();
        if self.random_walk.is_due(now) {
            if let Err(error) = self.find_random_peer() {
                debug!(?error, "Random walk skipped");
            }
            self.random_walk.advance(now);
        }

        self.tick_queries();

        for event in self.sessions.poll() {
            self.handle_session_event(event);
        }

        self.finish_queries();
        self.finish_put_queries();
    }

    /// Validate and store a record locally.
    pub fn put_value(&mut self, key: Key, value: Bytes, sender: flume::Sender<Result<()>>) {
        debug!(?key, "CALL: PutValue");

        let result = self.store_record(Record::new(key, value));
        let _ = sender.send(result);
    }

    /// Resolve a record: locally when fresh, otherwise with a GetValue
    /// lookup over the nearest peers.
    pub fn get_value(&mut self, key: Key, sender: flume::Sender<Result<Record>>) {
        debug!(?key, "CALL: GetValue");

        if let Some(record) = self.storage.get_value(&key) {
            if !record.is_expired(now_unix()) {
                let _ = sender.send(Ok(record));
                return;
            }
        }

        let target = NodeId::from_key(&key);
        let seeds = self.nearest_peer_infos(&target);
        if seeds.is_empty() {
            info!("Can't do GetValue request: no peers to connect to");
            let _ = sender.send(Err(Error::NoPeers));
            return;
        }

        self.start_query(
            QueryKind::GetValue,
            target,
            Message::get_value(key.clone()),
            seeds,
            QueryContext::GetValue { key, sender },
        );
    }

    /// Register ourselves as a provider of `key`; with `notify`, announce it
    /// to the k closest peers.
    pub fn provide(&mut self, key: Key, notify: bool, sender: flume::Sender<Result<()>>) {
        debug!(?key, notify, "CALL: Provide");

        self.providers.add_provider(&key, self.local.id);

        if !notify {
            let _ = sender.send(Ok(()));
            return;
        }

        let target = NodeId::from_key(&key);
        let seeds = self.nearest_peer_infos(&target);
        if seeds.is_empty() {
            let _ = sender.send(Err(Error::NoPeers));
            return;
        }

        self.start_query(
            QueryKind::FindNode,
            target,
            Message::find_node(key.clone()),
            seeds,
            QueryContext::Announce {
                key,
                sender: Some(sender),
            },
        );
    }

    /// Stream providers of `key` to the sender, up to `limit` (0 means
    /// unlimited).
    pub fn find_providers(&mut self, key: Key, limit: usize, sender: ProviderSender) {
        debug!(?key, limit, "CALL: FindProviders");

        // Serve from the content routing table alone when it already
        // satisfies the limit with reachable providers.
        if limit > 0 {
            let local = self.reachable_local_providers(&key, limit);

            if local.len() >= limit {
                info!(count = local.len(), "Found providers locally");

                for info in local {
                    let _ = sender.send(ResponseMessage::Value(info));
                }
                let _ = sender.send(ResponseMessage::Done);
                return;
            }
        }

        let target = NodeId::from_key(&key);
        let seeds = self.nearest_peer_infos(&target);
        if seeds.is_empty() {
            info!("Can't do FindProviders request: no peers to connect to");
            let _ = sender.send(ResponseMessage::Done);
            return;
        }

        self.start_query(
            QueryKind::FindProviders { limit },
            target,
            Message::get_providers(key),
            seeds,
            QueryContext::FindProviders { sender },
        );
    }

    /// Resolve a peer's addresses: from the address repository when known,
    /// otherwise with a FindPeer lookup.
    pub fn find_peer(&mut self, peer: PeerId, sender: flume::Sender<Result<PeerInfo>>) {
        debug!(?peer, "CALL: FindPeer");

        let known = self.host.peer_info(&peer);
        if !known.addresses.is_empty() {
            debug!(?peer, "Found locally");
            let _ = sender.send(Ok(known));
            return;
        }

        let target = NodeId::from_peer(&peer);
        let seeds = self.nearest_peer_infos(&target);
        if seeds.is_empty() {
            let _ = sender.send(Err(Error::NoPeers));
            return;
        }

        self.start_query(
            QueryKind::FindPeer { peer },
            target,
            Message::find_node(Key::new(peer.to_vec())),
            seeds,
            QueryContext::FindPeer {
                sender: Some(sender),
            },
        );
    }

    /// Upsert a peer's addresses and feed it to the routing table.
    pub fn add_peer(&mut self, info: PeerInfo, permanent: bool) {
        trace!(peer = ?info.id, "CALL: AddPeer");

        if !info.addresses.is_empty() {
            let ttl = if permanent { TTL_PERMANENT } else { TTL_DAY };
            self.host.upsert_addresses(&info.id, &info.addresses, ttl);
        }

        match self.routing_table.update(info.id) {
            UpdateOutcome::Added => {
                debug!(
                    peer = ?info.id,
                    total = self.routing_table.size(),
                    "Added to peer routing table"
                );
            }
            UpdateOutcome::Updated => {
                trace!(peer = ?info.id, "Updated in peer routing table");
            }
            UpdateOutcome::Rejected { stalest } => {
                // The table does no I/O; probing the stale peer is up to the
                // maintenance layer.
                debug!(peer = ?info.id, ?stalest, "Bucket full; peer not added");
            }
        }
    }

    /// One random-walk iteration: look up a random target to refresh the
    /// routing table.
    pub fn bootstrap(&mut self, sender: flume::Sender<Result<()>>) {
        let _ = sender.send(self.find_random_peer());
    }

    // === Private Methods ===

    fn find_random_peer(&mut self) -> Result<()> {
        let peer = self.random_walk.random_target();
        let iteration = self.random_walk.iteration();

        debug!(?peer, iteration, "Random walk lookup");

        let target = NodeId::from_peer(&peer);
        let seeds = self.nearest_peer_infos(&target);
        if seeds.is_empty() {
            return Err(Error::NoPeers);
        }

        self.start_query(
            QueryKind::FindPeer { peer },
            target,
            Message::find_node(Key::new(peer.to_vec())),
            seeds,
            QueryContext::FindPeer { sender: None },
        );

        Ok(())
    }

    /// Local providers that look reachable, newest first, up to `limit`.
    fn reachable_local_providers(&mut self, key: &Key, limit: usize) -> Vec<PeerInfo> {
        let ids = self.providers.get_providers_for(key, usize::MAX);

        let mut result = Vec::new();
        for id in ids {
            let info = self.host.peer_info(&id);
            if info.addresses.is_empty() {
                continue;
            }

            if self.host.connectedness(&info) == Connectedness::CanNotConnect {
                continue;
            }

            result.push(info);
            if result.len() >= limit {
                break;
            }
        }

        result
    }

    /// Seed candidates for a lookup: the nearest known peers that have
    /// addresses and are believed reachable. Never includes self.
    fn nearest_peer_infos(&mut self, target: &NodeId) -> Vec<PeerInfo> {
        let ids = self
            .routing_table
            .nearest_peers(target, self.config.closer_peer_count * 2);

        let mut infos = Vec::with_capacity(ids.len());
        for id in ids {
            if id == self.local.id {
                continue;
            }

            let info = self.host.peer_info(&id);
            if info.addresses.is_empty() {
                continue;
            }

            if self.host.connectedness(&info) == Connectedness::CanNotConnect {
                continue;
            }

            infos.push(info);
        }

        infos
    }

    fn start_query(
        &mut self,
        kind: QueryKind,
        target: NodeId,
        request: Message,
        seeds: Vec<PeerInfo>,
        context: QueryContext,
    ) {
        let mut query = IterativeQuery::new(
            kind,
            target,
            request,
            self.config.query_alpha,
            self.config.closer_peer_count,
            Instant::now() + self.config.query_timeout,
        );
        query.seed(seeds);

        let id = self.query_id();
        self.queries.insert(
            id,
            RunningQuery {
                query,
                context,
                sessions: HashMap::new(),
            },
        );
    }

    fn start_put_query(
        &mut self,
        target: NodeId,
        request: Message,
        addressees: Vec<PeerInfo>,
        sender: Option<flume::Sender<Result<()>>>,
    ) {
        let mut running = RunningPut {
            put: PutQuery::new(target, request),
            sender,
            sessions: HashSet::new(),
        };
        running.put.start();

        for info in addressees {
            match self.host.new_stream(&info.id) {
                Ok(channel) => {
                    match self
                        .sessions
                        .open_outbound(info.id, channel, running.put.request(), false)
                    {
                        Ok(session) => {
                            running.sessions.insert(session);
                            running.put.on_dispatched();
                        }
                        Err(error) => {
                            debug!(peer = ?info.id, ?error, "PutQuery message failed to serialize");
                        }
                    }
                }
                Err(error) => {
                    debug!(peer = ?info.id, ?error, "PutQuery dial failed");
                }
            }
        }

        let id = self.query_id();
        self.put_queries.insert(id, running);
    }

    /// Issue the RPCs every lookup decided to send this turn.
    fn tick_queries(&mut self) {
        for running in self.queries.values_mut() {
            for info in running.query.take_dispatches() {
                match self.host.new_stream(&info.id) {
                    Ok(channel) => {
                        match self.sessions.open_outbound(
                            info.id,
                            channel,
                            running.query.request(),
                            true,
                        ) {
                            Ok(session) => {
                                running.sessions.insert(session, info.id);
                            }
                            Err(error) => {
                                debug!(peer = ?info.id, ?error, "Query request failed to serialize");
                                running.query.on_failed(&info.id);
                            }
                        }
                    }
                    Err(error) => {
                        trace!(peer = ?info.id, ?error, "Query dial failed");
                        running.query.on_failed(&info.id);
                    }
                }
            }
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Request {
                session,
                peer,
                message,
            } => {
                self.handle_request(session, peer, message);
            }
            SessionEvent::Response {
                session,
                peer,
                message,
            } => {
                // Any response is a routing observation.
                self.add_peer(PeerInfo::bare(peer), false);

                let owner = self
                    .queries
                    .iter()
                    .find(|(_, running)| running.sessions.contains_key(&session))
                    .map(|(id, _)| *id);

                if let Some(id) = owner {
                    self.handle_query_response(id, session, peer, message);
                }
            }
            SessionEvent::Flushed { session, .. } => {
                if let Some(running) = self
                    .put_queries
                    .values_mut()
                    .find(|running| running.sessions.contains(&session))
                {
                    running.sessions.remove(&session);
                    running.put.on_flushed();
                }
            }
            SessionEvent::Failed {
                session,
                peer,
                error,
            } => {
                trace!(?peer, ?error, "Session failed");

                let owner = self
                    .queries
                    .iter()
                    .find(|(_, running)| running.sessions.contains_key(&session))
                    .map(|(id, _)| *id);

                if let Some(id) = owner {
                    let running = self.queries.get_mut(&id).expect("owner exists");
                    running.sessions.remove(&session);
                    running.query.on_failed(&peer);
                    return;
                }

                if let Some(running) = self
                    .put_queries
                    .values_mut()
                    .find(|running| running.sessions.contains(&session))
                {
                    running.sessions.remove(&session);
                    running.put.on_failed();
                }
            }
        }
    }

    fn handle_query_response(
        &mut self,
        id: u64,
        session: SessionId,
        from: PeerId,
        message: Message,
    ) {
        let Some(running) = self.queries.get_mut(&id) else {
            return;
        };

        running.sessions.remove(&session);

        // Merge discovered peers into the shortlist: skip self, skip peers
        // the connection manager rules out, refresh everyone's addresses.
        let mut entries: Vec<&Peer> = message.closer_peers.iter().collect();
        if matches!(running.query.kind(), QueryKind::GetValue) {
            // Providers of the value are lookup candidates too.
            entries.extend(message.provider_peers.iter());
        }

        for entry in entries {
            if entry.info.id == self.local.id {
                continue;
            }

            if entry.connectedness == Connectedness::CanNotConnect {
                continue;
            }

            if !entry.info.addresses.is_empty() {
                self.host
                    .upsert_addresses(&entry.info.id, &entry.info.addresses, TTL_DAY);
            }

            let info = self.host.peer_info(&entry.info.id);
            if self.host.connectedness(&info) == Connectedness::CanNotConnect {
                continue;
            }

            // Observed peers feed the routing table as they are discovered.
            self.routing_table.update(entry.info.id);

            running.query.add_candidate(if info.addresses.is_empty() {
                entry.info.clone()
            } else {
                info
            });
        }

        running.query.on_response(&from, &message);

        if let QueryContext::FindProviders { sender } = &running.context {
            for provider in running.query.drain_new_providers() {
                let _ = sender.send(ResponseMessage::Value(provider));
            }
        }
    }

    /// Deliver results of completed lookups and clean them up.
    fn finish_queries(&mut self) {
        let finished: Vec<u64> = self
            .queries
            .iter()
            .filter(|(_, running)| running.query.is_done())
            .map(|(id, _)| *id)
            .collect();

        for id in finished {
            let running = self.queries.remove(&id).expect("finished query exists");

            // Abandon whatever is still in flight.
            for (session, _) in running.sessions {
                self.sessions.close(session);
            }

            let query = running.query;
            let target = *query.target();
            debug!(?target, timed_out = query.timed_out(), "Query done");

            match running.context {
                QueryContext::FindPeer { sender } => {
                    let result = match query.found_peer() {
                        Some(info) => {
                            let mut info = info.clone();
                            if info.addresses.is_empty() {
                                info = self.host.peer_info(&info.id);
                            }

                            self.add_peer(info.clone(), false);
                            Ok(info)
                        }
                        None if query.timed_out() => Err(Error::Timeout),
                        None => Err(Error::NotFound),
                    };

                    if let Some(sender) = sender {
                        let _ = sender.send(result);
                    }
                }
                QueryContext::GetValue { key, sender } => {
                    let valid: Vec<Record> = query
                        .records()
                        .iter()
                        .filter(|record| record.key == key)
                        .filter(|record| {
                            self.validator.validate(&key, &record.value).is_ok()
                        })
                        .cloned()
                        .collect();

                    let result = if valid.is_empty() {
                        if query.timed_out() {
                            Err(Error::Timeout)
                        } else {
                            Err(Error::NotFound)
                        }
                    } else {
                        self.validator
                            .select(&valid)
                            .map(|index| valid[index].clone())
                    };

                    if let Ok(winner) = &result {
                        // Opportunistic write-back to responders that came up
                        // empty-handed.
                        let targets =
                            query.responders_without_record(self.config.closer_peer_count);
                        if !targets.is_empty() {
                            self.start_put_query(
                                NodeId::from_key(&key),
                                Message::put_value(winner.clone()),
                                targets,
                                None,
                            );
                        }
                    }

                    let _ = sender.send(result);
                }
                QueryContext::FindProviders { sender } => {
                    let _ = sender.send(ResponseMessage::Done);
                }
                QueryContext::Announce { key, sender } => {
                    let closest = query.closest_responders(self.config.closer_peer_count);

                    if closest.is_empty() {
                        if let Some(sender) = sender {
                            let _ = sender.send(Err(Error::NoPeers));
                        }
                        continue;
                    }

                    let provider = Peer::new(self.local.clone(), Connectedness::Connected);
                    self.start_put_query(
                        NodeId::from_key(&key),
                        Message::add_provider(key, provider),
                        closest,
                        sender,
                    );
                }
            }
        }
    }

    fn finish_put_queries(&mut self) {
        let finished: Vec<u64> = self
            .put_queries
            .iter()
            .filter(|(_, running)| running.put.is_done())
            .map(|(id, _)| *id)
            .collect();

        for id in finished {
            let running = self.put_queries.remove(&id).expect("finished query exists");
            let outcome = running.put.outcome();

            debug!(ok = outcome.is_ok(), "PutQuery done");

            if let Some(sender) = running.sender {
                let _ = sender.send(outcome);
            }
        }
    }

    /// Validate a record and store it, letting the validator arbitrate
    /// against any record already present.
    fn store_record(&mut self, record: Record) -> Result<()> {
        self.validator.validate(&record.key, &record.value)?;

        let record = match self.storage.get_value(&record.key) {
            Some(existing) if !existing.is_expired(now_unix()) => {
                let pair = [existing, record];
                let index = self.validator.select(&pair)?;
                pair.into_iter()
                    .nth(index)
                    .expect("selected index in bounds")
            }
            _ => record,
        };

        self.storage.put_value(record)
    }

    fn query_id(&mut self) -> u64 {
        let id = self.next_query_id;
        self.next_query_id = self.next_query_id.wrapping_add(1);
        id
    }
}
