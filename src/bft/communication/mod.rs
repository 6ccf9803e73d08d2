//! Communication primitives: the abstract [`Transport`] capability the
//! protocol core consumes, wire message formats, and an in-process
//! channel-backed `Transport` used by the demo cluster and the test
//! suite.

pub mod serialize;
pub mod message;
pub mod channel;

#[cfg(feature = "serialize_serde")]
use serde::{Serialize, Deserialize};

use smallvec::SmallVec;

use crate::bft::collections::HashMap;
use crate::bft::communication::channel::MessageChannelTx;
use crate::bft::communication::message::{Header, Message, SystemMessage};

/// Small groups are the common case (PBFT's `n = 3f + 1` keeps `n` in
/// the single or low double digits for any practical `f`), so the
/// target list lives on the stack until a deployment actually grows
/// past it.
type TargetList = SmallVec<[NodeId; 8]>;

/// A `NodeId` represents the id of a process in the BFT system: a
/// replica, or a client.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub fn targets<I>(into_iterator: I) -> impl Iterator<Item = Self>
    where
        I: IntoIterator<Item = u32>,
    {
        into_iterator
            .into_iter()
            .map(Self)
    }
}

impl From<u32> for NodeId {
    #[inline]
    fn from(id: u32) -> NodeId {
        NodeId(id)
    }
}

impl From<NodeId> for usize {
    #[inline]
    fn from(id: NodeId) -> usize {
        id.0 as usize
    }
}

impl From<NodeId> for u32 {
    #[inline]
    fn from(id: NodeId) -> u32 {
        id.0 as u32
    }
}

/// Capability abstracting over message delivery to a peer replica or
/// a client.
///
/// `Transport::send` delivers at-most-once per call, with unbounded
/// latency; implementations are free to reorder or drop messages. The
/// protocol core tolerates this by relying on retransmission via
/// request timers and the view-change protocol, never on delivery
/// guarantees from the transport itself.
pub trait Transport<O, P>: Send + Sync {
    /// The ids of every replica in the group, including this node.
    fn targets(&self) -> &[NodeId];

    /// Sends `message`, attributed to `from`, to a single `target`.
    fn send(&self, from: NodeId, target: NodeId, message: SystemMessage<O, P>);

    /// Sends `message` to every replica in the group, including
    /// ourselves: self-delivery is permitted, and handlers must be
    /// idempotent under duplicates.
    fn broadcast(&self, from: NodeId, message: SystemMessage<O, P>)
    where
        O: Clone,
        P: Clone,
    {
        for &target in self.targets() {
            self.send(from, target, message.clone());
        }
    }
}

/// A [`Transport`] backed by in-process channels.
///
/// Used by the demo cluster, where every replica runs as a task within
/// the same process, and by the integration test suite, where the
/// lack of real network latency makes protocol behavior deterministic.
pub struct InProcessTransport<O, P> {
    targets: TargetList,
    peers: HashMap<NodeId, MessageChannelTx<O, P>>,
}

impl<O, P> InProcessTransport<O, P> {
    /// Creates a new `InProcessTransport`, addressing the peers listed
    /// in `peers`.
    pub fn new(peers: HashMap<NodeId, MessageChannelTx<O, P>>) -> Self {
        let targets = peers.keys().copied().collect();
        Self { targets, peers }
    }
}

impl<O, P> Transport<O, P> for InProcessTransport<O, P>
where
    O: Send + 'static,
    P: Send + 'static,
{
    fn targets(&self) -> &[NodeId] {
        &self.targets[..]
    }

    fn send(&self, from: NodeId, target: NodeId, message: SystemMessage<O, P>) {
        let header = Header::new(from, target);
        if let Some(tx) = self.peers.get(&target) {
            let tx = tx.clone();
            crate::bft::async_runtime::spawn(async move {
                // a full channel or a peer that has shut down is a
                // benign, tolerated message loss
                let _ = tx.send(Message::System(header, message)).await;
            });
        }
    }
}
