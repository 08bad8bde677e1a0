//! Shortlist of lookup candidates, ordered by XOR distance to the target.

use crate::common::{Distance, NodeId, PeerId, PeerInfo};

/// Bound on how many candidates one lookup keeps around.
pub(crate) const SHORTLIST_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where a candidate is in the lookup lifecycle.
pub(crate) enum CandidateState {
    /// Known but not yet contacted.
    Fresh,
    /// An RPC to it is in flight.
    Inflight,
    /// It answered.
    Responded,
    /// The RPC failed or timed out.
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    info: PeerInfo,
    distance: Distance,
    state: CandidateState,
}

#[derive(Debug)]
/// The evolving set of candidate peers of one iterative query, sorted by
/// ascending distance. A peer enters at most once, so it can never be
/// contacted twice.
pub(crate) struct ClosestPeers {
    target: NodeId,
    candidates: Vec<Candidate>,
}

impl ClosestPeers {
    pub fn new(target: NodeId) -> Self {
        ClosestPeers {
            target,
            candidates: Vec::with_capacity(SHORTLIST_LIMIT),
        }
    }

    // === Getters ===

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn inflight_count(&self) -> usize {
        self.candidates
            .iter()
            .filter(|candidate| candidate.state == CandidateState::Inflight)
            .count()
    }

    /// True if an uncontacted candidate exists among the `window` closest.
    #[cfg(test)]
    pub fn has_fresh(&self, window: usize) -> bool {
        self.candidates
            .iter()
            .take(window)
            .any(|candidate| candidate.state == CandidateState::Fresh)
    }

    /// Address hints recorded for a candidate.
    pub fn info_of(&self, peer: &PeerId) -> Option<&PeerInfo> {
        self.candidates
            .iter()
            .find(|candidate| candidate.info.id == *peer)
            .map(|candidate| &candidate.info)
    }

    /// The closest `n` candidates that responded, nearest first.
    pub fn responded(&self, n: usize) -> Vec<PeerInfo> {
        self.candidates
            .iter()
            .filter(|candidate| candidate.state == CandidateState::Responded)
            .take(n)
            .map(|candidate| candidate.info.clone())
            .collect()
    }

    // === Public Methods ===

    /// Add a candidate in fresh state. Duplicates are ignored, apart from
    /// backfilling address hints we did not have yet. Returns true if the
    /// peer was new.
    pub fn add(&mut self, info: PeerInfo) -> bool {
        if let Some(existing) = self
            .candidates
            .iter_mut()
            .find(|candidate| candidate.info.id == info.id)
        {
            if existing.info.addresses.is_empty() {
                existing.info.addresses = info.addresses;
            }
            return false;
        }

        let distance = NodeId::from_peer(&info.id).xor(&self.target);

        let position = self
            .candidates
            .binary_search_by(|candidate| candidate.distance.cmp(&distance))
            .unwrap_or_else(|position| position);

        if position >= SHORTLIST_LIMIT {
            return false;
        }

        self.candidates.insert(
            position,
            Candidate {
                info,
                distance,
                state: CandidateState::Fresh,
            },
        );

        if self.candidates.len() > SHORTLIST_LIMIT {
            // Shed the farthest uncontacted candidate; contacted ones keep
            // their bookkeeping.
            if let Some(index) = self
                .candidates
                .iter()
                .rposition(|candidate| candidate.state == CandidateState::Fresh)
            {
                self.candidates.remove(index);
            }
        }

        true
    }

    /// Closest fresh candidate among the `window` nearest, marked in-flight.
    pub fn take_fresh(&mut self, window: usize) -> Option<PeerInfo> {
        let candidate = self
            .candidates
            .iter_mut()
            .take(window)
            .find(|candidate| candidate.state == CandidateState::Fresh)?;

        candidate.state = CandidateState::Inflight;

        Some(candidate.info.clone())
    }

    pub fn set_state(&mut self, peer: &PeerId, state: CandidateState) {
        if let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|candidate| candidate.info.id == *peer)
        {
            candidate.state = state;
        }
    }
}
