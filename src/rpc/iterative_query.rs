//! The iterative α-parallel lookup state machine.
//!
//! A lookup keeps a shortlist of candidates sorted by distance to the
//! target, contacts the closest uncontacted ones with at most α requests in
//! flight, merges the `closer_peers` of every response back into the
//! shortlist, and converges once the best-k window holds no uncontacted
//! candidate. A final polish phase then drains whatever is left of the wider
//! shortlist before the lookup completes.
//!
//! The state machine is pure: it decides who to contact and accumulates
//! responses, while the node performs the I/O and reports back.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, trace};

use crate::common::messages::Message;
use crate::common::{NodeId, PeerId, PeerInfo, Record};

use super::closest_peers::{CandidateState, ClosestPeers};

#[derive(Debug, Clone)]
/// What a lookup is after; selects the per-response accumulation and the
/// completion policy.
pub(crate) enum QueryKind {
    /// Converge on the k closest nodes; used by provider announcements,
    /// record write-back and the bootstrap walk.
    FindNode,
    /// Locate one peer's addresses.
    FindPeer { peer: PeerId },
    /// Collect candidate records for a key.
    GetValue,
    /// Stream distinct providers of a key, up to `limit` (0 = unlimited).
    FindProviders { limit: usize },
}

#[derive(Debug)]
pub(crate) struct IterativeQuery {
    target: NodeId,
    kind: QueryKind,
    request: Message,
    shortlist: ClosestPeers,
    alpha: usize,
    k: usize,
    deadline: Instant,
    /// Final phase: the best-k window is drained, still-fresh candidates in
    /// the wider shortlist get their chance.
    polish: bool,
    timed_out: bool,
    done: bool,

    // Accumulated per-kind results.
    found_peer: Option<PeerInfo>,
    records: Vec<Record>,
    responders_with_record: HashSet<PeerId>,
    providers_seen: HashSet<PeerId>,
    new_providers: Vec<PeerInfo>,
    provider_count: usize,
}

impl IterativeQuery {
    pub fn new(
        kind: QueryKind,
        target: NodeId,
        request: Message,
        alpha: usize,
        k: usize,
        deadline: Instant,
    ) -> Self {
        trace!(?target, ?kind, "New query");

        IterativeQuery {
            shortlist: ClosestPeers::new(target),
            target,
            kind,
            request,
            alpha,
            k,
            deadline,
            polish: false,
            timed_out: false,
            done: false,

            found_peer: None,
            records: Vec::new(),
            responders_with_record: HashSet::new(),
            providers_seen: HashSet::new(),
            new_providers: Vec::new(),
            provider_count: 0,
        }
    }

    // === Getters ===

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn kind(&self) -> &QueryKind {
        &self.kind
    }

    /// The request sent to every contacted peer.
    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// The peer a FindPeer lookup located, if any.
    pub fn found_peer(&self) -> Option<&PeerInfo> {
        self.found_peer.as_ref()
    }

    /// Candidate records a GetValue lookup accumulated.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// The closest `n` responded peers.
    pub fn closest_responders(&self, n: usize) -> Vec<PeerInfo> {
        self.shortlist.responded(n)
    }

    /// Responders that did not hold the record themselves; targets for the
    /// opportunistic write-back after a GetValue lookup.
    pub fn responders_without_record(&self, n: usize) -> Vec<PeerInfo> {
        self.shortlist
            .responded(usize::MAX)
            .into_iter()
            .filter(|info| !self.responders_with_record.contains(&info.id))
            .take(n)
            .collect()
    }

    // === Public Methods ===

    /// Seed the shortlist with the initial candidates.
    pub fn seed<I: IntoIterator<Item = PeerInfo>>(&mut self, candidates: I) {
        for candidate in candidates {
            self.shortlist.add(candidate);
        }
    }

    /// Merge a peer discovered during the lookup into the shortlist.
    ///
    /// The caller filters out self and unreachable peers before handing
    /// them over.
    pub fn add_candidate(&mut self, info: PeerInfo) {
        self.shortlist.add(info);
    }

    /// Decide which peers to contact now, bounded by α in-flight requests.
    ///
    /// Marks the returned candidates in-flight; the caller either opens a
    /// session per peer or reports [IterativeQuery::on_failed]. Also
    /// advances the phase machine, so call it once per tick even when the
    /// in-flight lanes are full.
    pub fn take_dispatches(&mut self) -> Vec<PeerInfo> {
        let mut dispatches = Vec::new();

        if self.done {
            return dispatches;
        }

        if Instant::now() >= self.deadline {
            let target = self.target;
            debug!(?target, "Query deadline elapsed");

            self.timed_out = true;
            self.done = true;
            return dispatches;
        }

        loop {
            if self.shortlist.inflight_count() >= self.alpha {
                return dispatches;
            }

            let window = if self.polish { usize::MAX } else { self.k };

            if let Some(info) = self.shortlist.take_fresh(window) {
                dispatches.push(info);
                continue;
            }

            if self.shortlist.inflight_count() > 0 {
                // Stragglers may still widen the shortlist.
                return dispatches;
            }

            if !self.polish {
                self.polish = true;
                continue;
            }

            // Polish drained too; the lookup has converged.
            self.done = true;
            return dispatches;
        }
    }

    /// Record a response from a contacted peer and accumulate its payload.
    pub fn on_response(&mut self, from: &PeerId, message: &Message) {
        if self.done {
            return;
        }

        let target = self.target;
        trace!(?target, ?from, "Query got response");

        self.shortlist.set_state(from, CandidateState::Responded);

        match self.kind {
            QueryKind::FindNode => {}
            QueryKind::FindPeer { peer } => {
                if *from == peer {
                    if let Some(info) = self.shortlist.info_of(from) {
                        self.found_peer = Some(info.clone());
                        self.done = true;
                        return;
                    }
                }

                if let Some(entry) = message
                    .closer_peers
                    .iter()
                    .find(|entry| entry.info.id == peer && !entry.info.addresses.is_empty())
                {
                    self.found_peer = Some(entry.info.clone());
                    self.done = true;
                }
            }
            QueryKind::GetValue => {
                if let Some(record) = &message.record {
                    self.records.push(record.clone());
                    self.responders_with_record.insert(*from);
                }
            }
            QueryKind::FindProviders { limit } => {
                for entry in &message.provider_peers {
                    if limit > 0 && self.provider_count >= limit {
                        break;
                    }

                    if self.providers_seen.insert(entry.info.id) {
                        self.new_providers.push(entry.info.clone());
                        self.provider_count += 1;
                    }
                }

                if limit > 0 && self.provider_count >= limit {
                    self.done = true;
                }
            }
        }
    }

    /// Record a failed exchange; the lookup absorbs it and moves on.
    pub fn on_failed(&mut self, peer: &PeerId) {
        self.shortlist.set_state(peer, CandidateState::Failed);
    }

    /// Providers discovered since the last drain, for streaming delivery.
    pub fn drain_new_providers(&mut self) -> Vec<PeerInfo> {
        std::mem::take(&mut self.new_providers)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::common::messages::{MessageType, Peer};
    use crate::common::{Connectedness, Key};

    const ALPHA: usize = 3;
    const K: usize = 20;

    fn query(kind: QueryKind, target: NodeId) -> IterativeQuery {
        IterativeQuery::new(
            kind,
            target,
            Message::find_node(Key::new(&b"target"[..])),
            ALPHA,
            K,
            Instant::now() + Duration::from_secs(60),
        )
    }

    fn infos(n: usize) -> Vec<PeerInfo> {
        (0..n).map(|_| PeerInfo::bare(PeerId::random())).collect()
    }

    #[test]
    fn parallelism_is_bounded_by_alpha() {
        let mut query = query(QueryKind::FindNode, NodeId::random());
        query.seed(infos(30));

        let dispatches = query.take_dispatches();
        assert_eq!(dispatches.len(), ALPHA);

        // Lanes full; nothing more until a lane frees up.
        assert!(query.take_dispatches().is_empty());

        query.on_response(&dispatches[0].id, &Message::ping());
        assert_eq!(query.take_dispatches().len(), 1);
    }

    #[test]
    fn no_peer_is_contacted_twice() {
        let mut query = query(QueryKind::FindNode, NodeId::random());
        let seeds = infos(10);
        query.seed(seeds.clone());

        // Re-adding known peers must not make them contactable again.
        let mut contacted = HashSet::new();
        loop {
            let dispatches = query.take_dispatches();
            if query.is_done() {
                break;
            }

            for info in dispatches {
                assert!(contacted.insert(info.id), "peer contacted twice");
                query.on_response(&info.id, &Message::ping());
                query.add_candidate(info);
            }
        }

        assert_eq!(contacted.len(), 10);
    }

    #[test]
    fn converges_when_no_fresh_candidates_remain() {
        let mut query = query(QueryKind::FindNode, NodeId::random());
        query.seed(infos(5));

        let mut rounds = 0;
        while !query.is_done() {
            let dispatches = query.take_dispatches();
            for info in &dispatches {
                query.on_failed(&info.id);
            }

            rounds += 1;
            assert!(rounds < 50, "query failed to converge");
        }

        assert!(!query.timed_out());
        assert!(query.closest_responders(K).is_empty());
    }

    #[test]
    fn polish_phase_contacts_candidates_beyond_best_k() {
        let target = NodeId::random();
        let mut query = query(QueryKind::FindNode, target);
        query.seed(infos(K + 5));

        let mut contacted = 0;
        while !query.is_done() {
            for info in query.take_dispatches() {
                contacted += 1;
                query.on_response(&info.id, &Message::ping());
            }
        }

        // Every candidate got its RPC, including the 5 outside best-k.
        assert_eq!(contacted, K + 5);
    }

    #[test]
    fn deadline_stops_the_query() {
        let mut query = IterativeQuery::new(
            QueryKind::FindNode,
            NodeId::random(),
            Message::ping(),
            ALPHA,
            K,
            Instant::now() - Duration::from_secs(1),
        );
        query.seed(infos(10));

        assert!(query.take_dispatches().is_empty());
        assert!(query.is_done());
        assert!(query.timed_out());
    }

    #[test]
    fn find_peer_completes_on_target_response() {
        let target_peer = PeerId::random();
        let mut query = query(
            QueryKind::FindPeer { peer: target_peer },
            NodeId::from_peer(&target_peer),
        );

        query.seed([PeerInfo::bare(target_peer)]);
        let dispatched = query.take_dispatches();
        assert_eq!(dispatched[0].id, target_peer);

        query.on_response(&target_peer, &Message::ping());

        assert!(query.is_done());
        assert_eq!(query.found_peer().unwrap().id, target_peer);
    }

    #[test]
    fn find_peer_completes_on_address_bearing_closer_peer() {
        let target_peer = PeerId::random();
        let mut query = query(
            QueryKind::FindPeer { peer: target_peer },
            NodeId::from_peer(&target_peer),
        );

        let seed = PeerInfo::bare(PeerId::random());
        query.seed([seed.clone()]);
        query.take_dispatches();

        let mut response = Message::find_node(Key::new(&b"t"[..]));
        response.closer_peers.push(Peer::new(
            PeerInfo::new(
                target_peer,
                vec![crate::common::Multiaddr::new("/ip4/10.0.0.2/tcp/4001")],
            ),
            Connectedness::CanConnect,
        ));
        assert_eq!(response.message_type, MessageType::FindNode);

        query.on_response(&seed.id, &response);

        assert!(query.is_done());
        assert_eq!(query.found_peer().unwrap().id, target_peer);
        assert!(!query.found_peer().unwrap().addresses.is_empty());
    }

    #[test]
    fn provider_limit_completes_the_query() {
        let mut query = query(QueryKind::FindProviders { limit: 2 }, NodeId::random());

        let seed = PeerInfo::bare(PeerId::random());
        query.seed([seed.clone()]);
        query.take_dispatches();

        let mut response = Message::get_providers(Key::new(&b"c"[..]));
        let provider = Peer::new(PeerInfo::bare(PeerId::random()), Connectedness::CanConnect);
        response.provider_peers = vec![provider.clone(), provider.clone()];

        query.on_response(&seed.id, &response);
        // Duplicate providers count once.
        assert!(!query.is_done());
        assert_eq!(query.drain_new_providers().len(), 1);

        let mut response = Message::get_providers(Key::new(&b"c"[..]));
        response.provider_peers = vec![Peer::new(
            PeerInfo::bare(PeerId::random()),
            Connectedness::CanConnect,
        )];
        query.on_response(&seed.id, &response);

        assert!(query.is_done());
        assert_eq!(query.drain_new_providers().len(), 1);
    }

    #[test]
    fn get_value_accumulates_records_and_write_back_targets() {
        let target = NodeId::random();
        let mut query = query(QueryKind::GetValue, target);

        let holder = PeerInfo::bare(PeerId::random());
        let empty_handed = PeerInfo::bare(PeerId::random());
        query.seed([holder.clone(), empty_handed.clone()]);
        query.take_dispatches();

        let mut with_record = Message::get_value(Key::new(&b"k"[..]));
        with_record.record = Some(Record::new(Key::new(&b"k"[..]), &b"v"[..]));
        query.on_response(&holder.id, &with_record);

        query.on_response(&empty_handed.id, &Message::get_value(Key::new(&b"k"[..])));

        assert_eq!(query.records().len(), 1);

        let write_back = query.responders_without_record(K);
        assert_eq!(write_back.len(), 1);
        assert_eq!(write_back[0].id, empty_handed.id);
    }
}
