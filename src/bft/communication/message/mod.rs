//! This module contains types associated with messages traded
//! between the system processes.

#[cfg(feature = "serialize_serde")]
use serde::{Serialize, Deserialize};

use crate::bft::crypto::hash::Digest;
use crate::bft::communication::NodeId;
use crate::bft::ordering::{Orderable, SeqNo, View};
use crate::bft::timeouts::TimeoutKind;
use crate::bft::error::Error;

/// Metadata that travels alongside a [`SystemMessage`], recording who
/// sent it and who it is addressed to.
///
/// Signing and wire framing are a transport concern; this header only
/// carries the provenance a [`crate::bft::log::StoredMessage`] needs
/// to attribute a logged message to its sender.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    from: NodeId,
    to: NodeId,
}

impl Header {
    /// Creates a new header, stamping `from` as the message's origin
    /// and `to` as its destination.
    pub fn new(from: NodeId, to: NodeId) -> Self {
        Self { from, to }
    }

    /// Returns the id of the replica, or client, that sent this message.
    pub fn from(&self) -> NodeId {
        self.from
    }

    /// Returns the id of the intended recipient of this message.
    pub fn to(&self) -> NodeId {
        self.to
    }
}

/// The `Message` type encompasses all the messages traded between
/// different asynchronous tasks within a single replica process.
pub enum Message<O, P> {
    /// Client requests and protocol sub-messages, received from a peer
    /// or from the local client handler.
    System(Header, SystemMessage<O, P>),
    /// A previously scheduled timer has fired.
    Timeout(TimeoutKind),
    /// Errors reported by asynchronous tasks, e.g. a failed transport send.
    Error(NodeId, Error),
}

/// A `SystemMessage` corresponds to a message regarding one of the SMR
/// sub-protocols: client requests, the three-phase agreement protocol,
/// checkpoints, or the view-change handshake.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum SystemMessage<O, P> {
    Request(RequestMessage<O>),
    Consensus(ConsensusMessage<O>),
    Checkpoint(CheckpointMessage),
    ViewChange(ViewChangeMessage<O>),
    NewView(NewViewMessage<O>),
    Reply(ReplyMessage<P>),
}

/// Represents a request from a client.
///
/// The `O` type argument symbolizes the client operation to be
/// performed over the replicated state.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct RequestMessage<O> {
    client_id: NodeId,
    timestamp: u64,
    operation: O,
}

impl<O> RequestMessage<O> {
    /// Creates a new `RequestMessage`.
    pub fn new(client_id: NodeId, timestamp: u64, operation: O) -> Self {
        Self { client_id, timestamp, operation }
    }

    /// Returns the id of the client that issued this request.
    pub fn client_id(&self) -> NodeId {
        self.client_id
    }

    /// Returns the logical timestamp of this request.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Returns a reference to the operation of type `O`.
    pub fn operation(&self) -> &O {
        &self.operation
    }

    /// Consumes this message, returning its parts.
    pub fn into_inner(self) -> (NodeId, u64, O) {
        (self.client_id, self.timestamp, self.operation)
    }
}

/// Represents a message from the three-phase agreement sub-protocol.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct ConsensusMessage<O> {
    view: View,
    seq: SeqNo,
    kind: ConsensusMessageKind<O>,
}

impl<O> Orderable for ConsensusMessage<O> {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

impl<O> ConsensusMessage<O> {
    /// Creates a new `ConsensusMessage`, for the view `view`, pertaining
    /// to sequence number `seq`, and of the kind `kind`.
    pub fn new(view: View, seq: SeqNo, kind: ConsensusMessageKind<O>) -> Self {
        Self { view, seq, kind }
    }

    /// Returns the view this message was sent under.
    pub fn view(&self) -> View {
        self.view
    }

    /// Returns a reference to the consensus message kind.
    pub fn kind(&self) -> &ConsensusMessageKind<O> {
        &self.kind
    }

    /// Consumes this message, returning its parts.
    pub fn into_inner(self) -> (View, SeqNo, ConsensusMessageKind<O>) {
        (self.view, self.seq, self.kind)
    }
}

/// Represents one of the three phases of the agreement sub-protocol.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum ConsensusMessageKind<O> {
    /// Pre-prepare a request. Carries the request's digest, as computed
    /// by the primary, and the original request, so that backups may
    /// recompute the digest and detect an equivocating primary.
    PrePrepare(Digest, RequestMessage<O>),
    /// Prepare a request at a given digest.
    Prepare(Digest),
    /// Commit a request at a given digest, signaling the replica is
    /// ready to apply it to the application state machine.
    Commit(Digest),
}

/// Broadcast periodically by a replica once it has executed a batch of
/// requests, to let the group agree on a stable point for garbage
/// collection.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct CheckpointMessage {
    seq: SeqNo,
    digest: Digest,
}

impl Orderable for CheckpointMessage {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

impl CheckpointMessage {
    /// Creates a new `CheckpointMessage`, claiming sequence `seq` was
    /// the last one applied before the checkpoint, and `digest` is the
    /// fingerprint of the resulting application state.
    pub fn new(seq: SeqNo, digest: Digest) -> Self {
        Self { seq, digest }
    }

    /// Returns the digest of the checkpointed application state.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

/// Evidence that a correct replica reached the `Prepared` phase for a
/// given sequence number: the logged request, together with a set of
/// matching prepares that attained a Byzantine quorum.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct PreparedCertificate<O> {
    view: View,
    seq: SeqNo,
    digest: Digest,
    request: RequestMessage<O>,
    prepares: Vec<(NodeId, Digest)>,
}

impl<O> Orderable for PreparedCertificate<O> {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

impl<O> PreparedCertificate<O> {
    /// Creates a new `PreparedCertificate`.
    pub fn new(
        view: View,
        seq: SeqNo,
        digest: Digest,
        request: RequestMessage<O>,
        prepares: Vec<(NodeId, Digest)>,
    ) -> Self {
        Self { view, seq, digest, request, prepares }
    }

    /// Returns the view under which this certificate was assembled.
    pub fn view(&self) -> View {
        self.view
    }

    /// Returns the digest the certificate attests to.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Returns a reference to the certified request.
    pub fn request(&self) -> &RequestMessage<O> {
        &self.request
    }

    /// Returns the set of prepare votes backing this certificate.
    pub fn prepares(&self) -> &[(NodeId, Digest)] {
        &self.prepares[..]
    }
}

/// Broadcast by a backup that suspects the current primary has failed,
/// to initiate a transition into the next view.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct ViewChangeMessage<O> {
    new_view: View,
    replica_id: NodeId,
    last_checkpoint_seq: SeqNo,
    last_checkpoint_digest: Option<Digest>,
    prepared_set: Vec<PreparedCertificate<O>>,
}

impl<O> Orderable for ViewChangeMessage<O> {
    fn sequence_number(&self) -> SeqNo {
        self.new_view.sequence_number()
    }
}

impl<O> ViewChangeMessage<O> {
    /// Creates a new `ViewChangeMessage`, proposing a transition into
    /// `new_view`.
    pub fn new(
        new_view: View,
        replica_id: NodeId,
        last_checkpoint_seq: SeqNo,
        last_checkpoint_digest: Option<Digest>,
        prepared_set: Vec<PreparedCertificate<O>>,
    ) -> Self {
        Self {
            new_view,
            replica_id,
            last_checkpoint_seq,
            last_checkpoint_digest,
            prepared_set,
        }
    }

    /// Returns the view being proposed.
    pub fn new_view(&self) -> View {
        self.new_view
    }

    /// Returns the id of the replica that sent this message.
    pub fn replica_id(&self) -> NodeId {
        self.replica_id
    }

    /// Returns the sequence number of the sender's last stable checkpoint.
    pub fn last_checkpoint_seq(&self) -> SeqNo {
        self.last_checkpoint_seq
    }

    /// Returns the digest of the sender's last stable checkpoint, if any.
    pub fn last_checkpoint_digest(&self) -> Option<&Digest> {
        self.last_checkpoint_digest.as_ref()
    }

    /// Returns the sender's set of prepared certificates.
    pub fn prepared_set(&self) -> &[PreparedCertificate<O>] {
        &self.prepared_set[..]
    }

    /// Consumes this message, returning its prepared set.
    pub fn into_prepared_set(self) -> Vec<PreparedCertificate<O>> {
        self.prepared_set
    }
}

/// Broadcast by the prospective primary of a view, once it has
/// collected a Byzantine quorum of matching `ViewChangeMessage`s, to
/// synthesize the sequence of pre-prepares carried over into the
/// new view.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct NewViewMessage<O> {
    view: View,
    view_change_summary: Vec<NodeId>,
    new_preprepares: Vec<(SeqNo, ConsensusMessage<O>)>,
}

impl<O> Orderable for NewViewMessage<O> {
    fn sequence_number(&self) -> SeqNo {
        self.view.sequence_number()
    }
}

impl<O> NewViewMessage<O> {
    /// Creates a new `NewViewMessage`, installing `view`, backed by the
    /// senders listed in `view_change_summary`, and carrying the
    /// reconstructed pre-prepares `new_preprepares`.
    pub fn new(
        view: View,
        view_change_summary: Vec<NodeId>,
        new_preprepares: Vec<(SeqNo, ConsensusMessage<O>)>,
    ) -> Self {
        Self { view, view_change_summary, new_preprepares }
    }

    /// Returns the view this message installs.
    pub fn view(&self) -> View {
        self.view
    }

    /// Returns the ids of the replicas whose view-changes back this
    /// new-view.
    pub fn view_change_summary(&self) -> &[NodeId] {
        &self.view_change_summary[..]
    }

    /// Consumes this message, returning the reconstructed pre-prepares.
    pub fn into_new_preprepares(self) -> Vec<(SeqNo, ConsensusMessage<O>)> {
        self.new_preprepares
    }
}

/// The reply a replica sends back to a client, once a request has
/// committed and been applied to the application state machine.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct ReplyMessage<P> {
    view: View,
    timestamp: u64,
    replica_id: NodeId,
    result: P,
}

impl<P> ReplyMessage<P> {
    /// Creates a new `ReplyMessage`.
    pub fn new(view: View, timestamp: u64, replica_id: NodeId, result: P) -> Self {
        Self { view, timestamp, replica_id, result }
    }

    /// Returns the view in which the request was committed.
    pub fn view(&self) -> View {
        self.view
    }

    /// Returns the timestamp of the original request.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Returns the id of the replica that sent this reply.
    pub fn replica_id(&self) -> NodeId {
        self.replica_id
    }

    /// Returns a reference to the result of the operation.
    pub fn result(&self) -> &P {
        &self.result
    }

    /// Consumes this message, returning its result.
    pub fn into_result(self) -> P {
        self.result
    }
}
