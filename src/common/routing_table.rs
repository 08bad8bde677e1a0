//! Kademlia peer routing table: k-buckets grouped by shared prefix length.

use std::collections::BTreeMap;

use crate::common::{Distance, NodeId, PeerId};

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_BUCKET_SIZE_K: usize = 20;

/// Outcome of observing a peer in [PeerRoutingTable::update].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The peer was appended to a bucket with room.
    Added,
    /// The peer was already known and moved to the most-recently-seen end.
    Updated,
    /// The bucket is full. The table does no I/O itself; the caller may
    /// probe the returned least-recently-seen peer and evict it.
    Rejected { stalest: PeerId },
}

#[derive(Debug, Clone)]
/// Address-agnostic map of peer ids, grouped by XOR distance from self.
///
/// Bucket `b` holds peers whose [NodeId] shares exactly `b` leading bits with
/// our own. A peer appears in at most one bucket, and self is never added.
pub struct PeerRoutingTable {
    local_peer: PeerId,
    local_id: NodeId,
    bucket_size: usize,
    buckets: BTreeMap<u32, KBucket>,
}

impl PeerRoutingTable {
    pub fn new(local_peer: PeerId) -> Self {
        Self::with_bucket_size(local_peer, DEFAULT_BUCKET_SIZE_K)
    }

    pub fn with_bucket_size(local_peer: PeerId, bucket_size: usize) -> Self {
        PeerRoutingTable {
            local_id: NodeId::from_peer(&local_peer),
            local_peer,
            bucket_size,
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the peer id this table measures distance from.
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    // === Public Methods ===

    /// Record an observation of a peer.
    ///
    /// Known peers move to the most-recently-seen end of their bucket; new
    /// peers are appended if the bucket has room.
    pub fn update(&mut self, peer: PeerId) -> UpdateOutcome {
        if peer == self.local_peer {
            // Self never enters the table; treat as a plain refresh.
            return UpdateOutcome::Updated;
        }

        let node_id = NodeId::from_peer(&peer);
        let index = self.local_id.common_prefix_len(&node_id);

        let bucket_size = self.bucket_size;
        let bucket = self.buckets.entry(index).or_default();

        bucket.update(Entry { peer, node_id }, bucket_size)
    }

    /// Remove a peer from the table.
    pub fn remove(&mut self, peer: &PeerId) {
        let index = self
            .local_id
            .common_prefix_len(&NodeId::from_peer(peer));

        if let Some(bucket) = self.buckets.get_mut(&index) {
            bucket.remove(peer);

            if bucket.is_empty() {
                self.buckets.remove(&index);
            }
        }
    }

    /// Return up to `n` known peers ordered by ascending XOR distance to
    /// `target`.
    ///
    /// Every bucket is scanned and merged into one sorted shortlist; buckets
    /// are small, so the full merge stays cheap. XOR order is total, so the
    /// result has no ties.
    pub fn nearest_peers(&self, target: &NodeId, n: usize) -> Vec<PeerId> {
        let mut nearest: Vec<(Distance, PeerId)> = Vec::with_capacity(self.size().min(n + 1));

        for bucket in self.buckets.values() {
            for entry in &bucket.entries {
                let distance = entry.node_id.xor(target);

                let position = nearest
                    .binary_search_by(|(probe, _)| probe.cmp(&distance))
                    .unwrap_or_else(|position| position);

                if position < n {
                    nearest.insert(position, (distance, entry.peer));
                    nearest.truncate(n);
                }
            }
        }

        nearest.into_iter().map(|(_, peer)| peer).collect()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        let index = self
            .local_id
            .common_prefix_len(&NodeId::from_peer(peer));

        self.buckets
            .get(&index)
            .map(|bucket| bucket.contains(peer))
            .unwrap_or(false)
    }

    /// The number of peers in the table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    #[cfg(test)]
    pub(crate) fn bucket_indexes(&self) -> Vec<(u32, Vec<PeerId>)> {
        self.buckets
            .iter()
            .map(|(index, bucket)| {
                (
                    *index,
                    bucket.entries.iter().map(|entry| entry.peer).collect(),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    peer: PeerId,
    node_id: NodeId,
}

/// One bucket of the routing table, kept in least-recently-seen order.
#[derive(Debug, Clone, Default)]
struct KBucket {
    entries: Vec<Entry>,
}

impl KBucket {
    fn update(&mut self, incoming: Entry, bucket_size: usize) -> UpdateOutcome {
        if let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.peer == incoming.peer)
        {
            self.entries.remove(index);
            self.entries.push(incoming);

            UpdateOutcome::Updated
        } else if self.entries.len() < bucket_size {
            self.entries.push(incoming);

            UpdateOutcome::Added
        } else {
            UpdateOutcome::Rejected {
                stalest: self.entries[0].peer,
            }
        }
    }

    fn remove(&mut self, peer: &PeerId) {
        self.entries.retain(|entry| entry.peer != *peer);
    }

    fn contains(&self, peer: &PeerId) -> bool {
        self.entries.iter().any(|entry| entry.peer == *peer)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
