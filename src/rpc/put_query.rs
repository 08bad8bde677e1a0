//! Terminal fan-out of a store operation to the k closest peers.

use tracing::{debug, trace};

use crate::common::messages::Message;
use crate::common::NodeId;
use crate::{Error, Result};

#[derive(Debug)]
/// Once an [super::iterative_query::IterativeQuery] converged on the closest
/// peers to a target, a PutQuery pushes one PUT_VALUE or ADD_PROVIDER message
/// to each of them and counts acknowledgements.
///
/// Best effort: individual failures are logged and absorbed; only a fan-out
/// that reached nobody surfaces as an error.
pub(crate) struct PutQuery {
    target: NodeId,
    request: Message,
    started: bool,
    pending: usize,
    stored_at: u32,
    failed: u32,
}

impl PutQuery {
    pub fn new(target: NodeId, request: Message) -> Self {
        PutQuery {
            target,
            request,
            started: false,
            pending: 0,
            stored_at: 0,
            failed: 0,
        }
    }

    // === Getters ===

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn is_done(&self) -> bool {
        self.started && self.pending == 0
    }

    pub fn outcome(&self) -> Result<()> {
        if self.stored_at > 0 {
            Ok(())
        } else {
            Err(Error::Transport("message reached none of the closest peers"))
        }
    }

    // === Public Methods ===

    /// Mark the fan-out as dispatched; per-peer results arrive afterwards.
    pub fn start(&mut self) {
        let target = self.target;
        trace!(?target, "PutQuery start");

        self.started = true;
    }

    /// One message handed to a session.
    pub fn on_dispatched(&mut self) {
        self.pending += 1;
    }

    /// One message flushed to its peer.
    pub fn on_flushed(&mut self) {
        self.pending = self.pending.saturating_sub(1);
        self.stored_at += 1;
    }

    /// One exchange failed.
    pub fn on_failed(&mut self) {
        self.pending = self.pending.saturating_sub(1);
        self.failed += 1;

        let target = self.target;
        debug!(?target, failed = self.failed, "PutQuery exchange failed");
    }
}
