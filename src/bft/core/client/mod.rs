//! The client-side request driver, per §4.6.
//!
//! Deliberately a plain, synchronous data structure rather than its
//! own actor: a client process drives it directly from whatever loop
//! submits requests and awaits replies, arming its own retransmission
//! timer the same way a replica arms a request timer. Timestamps here
//! are a locally incrementing logical counter, not wall-clock time —
//! sufficient to give every request from this client a strictly
//! increasing identity, and deterministic to boot, without pulling in
//! a system clock dependency this crate otherwise has no use for.

use crate::bft::collections::HashMap;
use crate::bft::communication::message::{ReplyMessage, RequestMessage};
use crate::bft::communication::NodeId;

/// What delivering a reply to the driver caused to happen.
pub enum ClientStatus<P> {
    /// The reply was stale, or didn't match any pending request.
    Nil,
    /// A reply was recorded, but a quorum hasn't formed yet.
    Waiting,
    /// `f + 1` replicas returned a matching reply: the request is done.
    Ready(P),
}

/// Drives request submission and reply collection for a single client.
pub struct ClientDriver<O, P> {
    id: NodeId,
    f: usize,
    next_ts: u64,
    pending: HashMap<u64, O>,
    replies: HashMap<u64, Vec<(NodeId, P)>>,
}

impl<O, P> ClientDriver<O, P>
where
    O: Clone,
    P: Clone + PartialEq,
{
    /// Creates a new driver for client `id`, talking to a replica group
    /// tolerating `f` faults.
    pub fn new(id: NodeId, f: usize) -> Self {
        Self {
            id,
            f,
            next_ts: 1,
            pending: HashMap::default(),
            replies: HashMap::default(),
        }
    }

    fn quorum(&self) -> usize {
        self.f + 1
    }

    /// Allocates the next logical timestamp for `operation`, and
    /// returns the [`RequestMessage`] to broadcast to every replica.
    pub fn new_request(&mut self, operation: O) -> RequestMessage<O> {
        let timestamp = self.next_ts;
        self.next_ts += 1;
        self.pending.insert(timestamp, operation.clone());
        self.replies.insert(timestamp, Vec::new());
        RequestMessage::new(self.id, timestamp, operation)
    }

    /// Records an inbound reply, per §4.6 `on_reply`: tallies matching
    /// payloads and resolves once `f + 1` replicas agree.
    pub fn on_reply(&mut self, from: NodeId, m: ReplyMessage<P>) -> ClientStatus<P> {
        let timestamp = m.timestamp();
        if !self.pending.contains_key(&timestamp) {
            return ClientStatus::Nil;
        }

        let result = m.into_result();
        let votes = self.replies.entry(timestamp).or_default();
        if votes.iter().any(|&(id, _)| id == from) {
            return ClientStatus::Nil;
        }
        votes.push((from, result));

        let quorum = self.quorum();
        let mut winner = None;
        for (_, p) in votes.iter() {
            let count = votes.iter().filter(|(_, q)| q == p).count();
            if count >= quorum {
                winner = Some(p.clone());
                break;
            }
        }

        match winner {
            Some(reply) => {
                self.pending.remove(&timestamp);
                self.replies.remove(&timestamp);
                ClientStatus::Ready(reply)
            }
            None => ClientStatus::Waiting,
        }
    }

    /// Returns every request still awaiting a quorum of replies, to be
    /// resent when this client's retransmission timer fires.
    pub fn retransmit_pending(&self) -> Vec<RequestMessage<O>> {
        self.pending
            .iter()
            .map(|(&timestamp, operation)| RequestMessage::new(self.id, timestamp, operation.clone()))
            .collect()
    }

    /// Whether any request is still awaiting a quorum of replies.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
