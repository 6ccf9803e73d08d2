//! The per-sequence, three-phase agreement engine.
//!
//! Unlike a protocol that drives one consensus instance to completion
//! before starting the next, sequence numbers here are pipelined: a
//! primary may pre-prepare seq `s+1` while `s` is still collecting
//! commits, bounded only by the log's watermark window. There is no
//! single "current phase" to poll — every handler below operates
//! against whichever [`LogEntry`](crate::bft::log::LogEntry) its
//! message names, and the log itself is the source of truth for each
//! entry's phase.

use crate::bft::communication::message::{
    ConsensusMessage, ConsensusMessageKind, RequestMessage, SystemMessage,
};
use crate::bft::communication::{NodeId, Transport};
use crate::bft::crypto::hash::{Digest, DigestScheme};
use crate::bft::log::{Info, Log};
use crate::bft::malice::{self, MaliceTable, MessageKind};
use crate::bft::ordering::{Orderable, SeqNo, View};

/// Computes the digest of a [`RequestMessage`], per §4.1: requests are
/// only ever compared for digest equality, never interpreted, so the
/// byte projection only needs to be stable across correct replicas.
pub fn digest_request<O, D>(scheme: &D, request: &RequestMessage<O>) -> Digest
where
    O: AsRef<[u8]>,
    D: DigestScheme,
{
    let mut bytes = Vec::with_capacity(12 + request.operation().as_ref().len());
    bytes.extend_from_slice(&u32::from(request.client_id()).to_le_bytes());
    bytes.extend_from_slice(&request.timestamp().to_le_bytes());
    bytes.extend_from_slice(request.operation().as_ref());
    scheme.digest(&bytes)
}

/// What a consensus handler caused to happen.
pub enum ConsensusStatus<P> {
    /// The message was stale, malformed, or fell outside the
    /// watermark window; it was silently discarded.
    Nil,
    /// The log entry advanced, but no reply is ready yet.
    Deciding,
    /// Sequence `seq` just committed. `reply` is the result of
    /// applying the request, to be delivered to `client_id`.
    Decided {
        seq: SeqNo,
        client_id: NodeId,
        timestamp: u64,
        reply: P,
    },
}

/// Drives the three-phase agreement protocol for one replica.
///
/// Owns the replica's [`Log`] and the sequence-number allocator used
/// while this replica is primary. Everything view-related (who the
/// primary is, whether a view-change is underway) is supplied by the
/// caller on every call, rather than cached here, since the
/// synchronizer is the sole owner of view transitions.
pub struct Consensus<O, P> {
    id: NodeId,
    seq_allocator: SeqNo,
    log: Log<O, P>,
}

impl<O, P> Consensus<O, P>
where
    O: Clone,
    P: Clone,
{
    /// Creates a new consensus engine for replica `id`, in a group
    /// tolerating `f` faults.
    pub fn new(id: NodeId, f: usize) -> Self {
        Self {
            id,
            seq_allocator: SeqNo::ZERO,
            log: Log::new(f),
        }
    }

    /// Returns a reference to the underlying log.
    pub fn log(&self) -> &Log<O, P> {
        &self.log
    }

    /// Returns a mutable reference to the underlying log, used by the
    /// synchronizer to install a new view's reconstructed pre-prepares.
    pub fn log_mut(&mut self) -> &mut Log<O, P> {
        &mut self.log
    }

    fn quorum_cast<T>(
        &self,
        malice_table: &MaliceTable,
        kind: MessageKind,
        transport: &T,
        message: SystemMessage<O, P>,
        corrupt: impl FnOnce(&SystemMessage<O, P>) -> SystemMessage<O, P>,
    ) where
        T: Transport<O, P>,
    {
        malice::broadcast(malice_table, kind, transport, self.id, message, corrupt);
    }

    /// Handles a fresh client submission, per §4.2 `submit_request`.
    ///
    /// Resends a cached reply outright if this `(client_id, timestamp)`
    /// already committed. If this replica is primary for `view`,
    /// allocates the next sequence number and broadcasts a pre-prepare;
    /// otherwise forwards the request to the primary.
    pub fn submit_request<T, D>(
        &mut self,
        view: View,
        request: RequestMessage<O>,
        digest_scheme: &D,
        transport: &T,
        malice_table: &MaliceTable,
    ) -> ConsensusStatus<P>
    where
        O: AsRef<[u8]> + Default,
        T: Transport<O, P>,
        D: DigestScheme,
    {
        let client_id = request.client_id();
        let timestamp = request.timestamp();

        if let Some(reply) = self.log.cached_reply(client_id, timestamp).cloned() {
            transport.send(
                self.id,
                client_id,
                SystemMessage::Reply(crate::bft::communication::message::ReplyMessage::new(
                    view, timestamp, self.id, reply,
                )),
            );
            return ConsensusStatus::Nil;
        }

        let primary = primary_id(view);
        if primary != self.id {
            transport.send(self.id, primary, SystemMessage::Request(request));
            return ConsensusStatus::Nil;
        }

        let seq = self.seq_allocator.next();
        self.seq_allocator = seq;
        let digest = digest_request(digest_scheme, &request);

        if self.log.insert_pre_prepare(seq, view, digest, request.clone()).is_err() {
            return ConsensusStatus::Nil;
        }
        self.log.record_prepare(seq, self.id, digest);

        let message = SystemMessage::Consensus(ConsensusMessage::new(
            view,
            seq,
            ConsensusMessageKind::PrePrepare(digest, request),
        ));
        self.quorum_cast(malice_table, MessageKind::PrePrepare, transport, message, |_| {
            fake_pre_prepare(view, seq)
        });

        ConsensusStatus::Deciding
    }

    /// Handles an inbound pre-prepare, per §4.2 `on_pre_prepare`.
    pub fn on_pre_prepare<T, D>(
        &mut self,
        from: NodeId,
        view: View,
        m: ConsensusMessage<O>,
        digest_scheme: &D,
        transport: &T,
        malice_table: &MaliceTable,
    ) -> ConsensusStatus<P>
    where
        O: AsRef<[u8]> + Default,
        T: Transport<O, P>,
        D: DigestScheme,
    {
        if m.view() != view || from != primary_id(view) {
            return ConsensusStatus::Nil;
        }
        let seq = m.sequence_number();
        if !self.log.in_window(seq) {
            return ConsensusStatus::Nil;
        }

        let (_, _, kind) = m.into_inner();
        let (digest, request) = match kind {
            ConsensusMessageKind::PrePrepare(digest, request) => (digest, request),
            _ => return ConsensusStatus::Nil,
        };
        if digest_request(digest_scheme, &request) != digest {
            return ConsensusStatus::Nil;
        }

        if self.log.insert_pre_prepare(seq, view, digest, request).is_err() {
            return ConsensusStatus::Nil;
        }
        self.log.record_prepare(seq, from, digest);
        self.log.record_prepare(seq, self.id, digest);

        let message = SystemMessage::Consensus(ConsensusMessage::new(
            view,
            seq,
            ConsensusMessageKind::Prepare(digest),
        ));
        self.quorum_cast(malice_table, MessageKind::Prepare, transport, message, |_| {
            fake_prepare(view, seq)
        });

        self.advance_prepare(view, seq, transport, malice_table)
    }

    /// Handles an inbound prepare, per §4.2 `on_prepare`.
    pub fn on_prepare<T>(
        &mut self,
        from: NodeId,
        view: View,
        m: ConsensusMessage<O>,
        transport: &T,
        malice_table: &MaliceTable,
    ) -> ConsensusStatus<P>
    where
        T: Transport<O, P>,
    {
        if m.view() != view {
            return ConsensusStatus::Nil;
        }
        let seq = m.sequence_number();
        if !self.log.in_window(seq) {
            return ConsensusStatus::Nil;
        }
        let (_, _, kind) = m.into_inner();
        let digest = match kind {
            ConsensusMessageKind::Prepare(digest) => digest,
            _ => return ConsensusStatus::Nil,
        };

        self.log.record_prepare(seq, from, digest);
        self.advance_prepare(view, seq, transport, malice_table)
    }

    /// If `log[seq]` has reached a prepared quorum, transitions it and
    /// broadcasts a commit, per §4.2 `advance_prepare`.
    fn advance_prepare<T>(
        &mut self,
        view: View,
        seq: SeqNo,
        transport: &T,
        malice_table: &MaliceTable,
    ) -> ConsensusStatus<P>
    where
        T: Transport<O, P>,
    {
        if !self.log.advance_prepare(seq) {
            return ConsensusStatus::Nil;
        }
        log::debug!("replica {:?} reached prepared quorum for seq {:?} in view {}", self.id, u32::from(seq), view.number());
        let digest = *self.log.entry(seq).expect("just advanced").digest();
        self.log.record_commit(seq, self.id, digest);

        let message = SystemMessage::Consensus(ConsensusMessage::new(
            view,
            seq,
            ConsensusMessageKind::Commit(digest),
        ));
        self.quorum_cast(malice_table, MessageKind::Commit, transport, message, |_| {
            fake_commit(view, seq)
        });

        ConsensusStatus::Deciding
    }

    /// Handles an inbound commit, per §4.2 `on_commit`. `apply` runs
    /// the request against the application state machine exactly once,
    /// the moment a committed quorum forms.
    pub fn on_commit(
        &mut self,
        view: View,
        m: ConsensusMessage<O>,
        from: NodeId,
        apply: impl FnOnce(&O) -> P,
    ) -> ConsensusStatus<P> {
        if m.view() != view {
            return ConsensusStatus::Nil;
        }
        let seq = m.sequence_number();
        if !self.log.in_window(seq) {
            return ConsensusStatus::Nil;
        }
        let (_, _, kind) = m.into_inner();
        let digest = match kind {
            ConsensusMessageKind::Commit(digest) => digest,
            _ => return ConsensusStatus::Nil,
        };

        self.log.record_commit(seq, from, digest);
        self.advance_commit(seq, apply)
    }

    /// If `log[seq]` has reached a committed quorum, applies the
    /// request and returns the reply, per §4.2 `advance_commit`.
    fn advance_commit(&mut self, seq: SeqNo, apply: impl FnOnce(&O) -> P) -> ConsensusStatus<P> {
        match self.log.advance_commit(seq, apply) {
            Some(reply) => {
                log::debug!("replica {:?} committed seq {:?}", self.id, u32::from(seq));
                let entry = self.log.entry(seq).expect("just committed");
                ConsensusStatus::Decided {
                    seq,
                    client_id: entry.request().client_id(),
                    timestamp: entry.request().timestamp(),
                    reply,
                }
            }
            None => ConsensusStatus::Nil,
        }
    }

    /// Whether a new checkpoint should be proposed, per §4.2. Exposed
    /// so the caller can broadcast a `Checkpoint` message after a
    /// commit, without this module needing its own copy of the
    /// application's fingerprinting capability.
    pub fn should_checkpoint(&self) -> Info {
        self.log.should_checkpoint()
    }
}

fn primary_id(view: View) -> NodeId {
    NodeId::from(view.leader())
}

fn fake_pre_prepare<O, P>(view: View, seq: SeqNo) -> SystemMessage<O, P>
where
    O: Default,
{
    SystemMessage::Consensus(ConsensusMessage::new(
        view,
        seq,
        ConsensusMessageKind::PrePrepare(
            sentinel_digest(),
            RequestMessage::new(NodeId::from(0), 0, O::default()),
        ),
    ))
}

fn fake_prepare<O, P>(view: View, seq: SeqNo) -> SystemMessage<O, P> {
    SystemMessage::Consensus(ConsensusMessage::new(
        view,
        seq,
        ConsensusMessageKind::Prepare(sentinel_digest()),
    ))
}

fn fake_commit<O, P>(view: View, seq: SeqNo) -> SystemMessage<O, P> {
    SystemMessage::Consensus(ConsensusMessage::new(
        view,
        seq,
        ConsensusMessageKind::Commit(sentinel_digest()),
    ))
}

fn sentinel_digest() -> Digest {
    Digest::from_data(b"castellan-malice-sentinel")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::communication::NodeId;
    use crate::bft::crypto::hash::DefaultDigestScheme;

    struct NullTransport {
        targets: Vec<NodeId>,
    }

    impl Transport<String, String> for NullTransport {
        fn targets(&self) -> &[NodeId] {
            &self.targets[..]
        }

        fn send(&self, _from: NodeId, _target: NodeId, _message: SystemMessage<String, String>) {}
    }

    fn transport(n: u32) -> NullTransport {
        NullTransport {
            targets: (0..n).map(NodeId::from).collect(),
        }
    }

    #[test]
    fn primary_allocates_sequence_and_broadcasts_pre_prepare() {
        let view = View::new(4, 1);
        let mut consensus: Consensus<String, String> = Consensus::new(NodeId::from(0), 1);
        let scheme = DefaultDigestScheme;
        let malice = MaliceTable::new();
        let t = transport(4);

        let req = RequestMessage::new(NodeId::from(10), 1, "op".to_string());
        let status = consensus.submit_request(view, req, &scheme, &t, &malice);
        assert!(matches!(status, ConsensusStatus::Deciding));
        assert_eq!(
            consensus.log().entry(SeqNo::from(1)).unwrap().phase(),
            crate::bft::log::Phase::PrePrepared
        );
    }

    #[test]
    fn three_phase_run_commits_and_returns_reply() {
        let view = View::new(4, 1);
        let scheme = DefaultDigestScheme;
        let malice = MaliceTable::new();
        let t = transport(4);

        let mut primary: Consensus<String, String> = Consensus::new(NodeId::from(0), 1);
        let req = RequestMessage::new(NodeId::from(10), 1, "op".to_string());
        primary.submit_request(view, req.clone(), &scheme, &t, &malice);

        let digest = digest_request(&scheme, &req);
        let seq = SeqNo::from(1);

        let mut backups: Vec<Consensus<String, String>> =
            (1..4).map(|i| Consensus::new(NodeId::from(i), 1)).collect();

        for backup in backups.iter_mut() {
            let pp = ConsensusMessage::new(view, seq, ConsensusMessageKind::PrePrepare(digest, req.clone()));
            backup.on_pre_prepare(NodeId::from(0), view, pp, &scheme, &t, &malice);
        }

        // cross-feed prepares between all four replicas (including the
        // primary, which must also observe 2f+1 prepares to commit)
        let mut all = vec![&mut primary];
        all.extend(backups.iter_mut());

        let prepare_votes: Vec<(NodeId, ConsensusMessage<String>)> = (0..4)
            .map(|i| (NodeId::from(i), ConsensusMessage::new(view, seq, ConsensusMessageKind::Prepare(digest))))
            .collect();

        for replica in all.iter_mut() {
            for (from, msg) in prepare_votes.iter() {
                replica.on_prepare(*from, view, msg.clone(), &t, &malice);
            }
        }

        let commit_votes: Vec<(NodeId, ConsensusMessage<String>)> = (0..4)
            .map(|i| (NodeId::from(i), ConsensusMessage::new(view, seq, ConsensusMessageKind::Commit(digest))))
            .collect();

        let mut last_status = None;
        for replica in all.iter_mut() {
            for (from, msg) in commit_votes.iter() {
                let status = replica.on_commit(view, msg.clone(), *from, |op| op.clone());
                if matches!(status, ConsensusStatus::Decided { .. }) {
                    last_status = Some(status);
                }
            }
        }

        match last_status {
            Some(ConsensusStatus::Decided { reply, client_id, .. }) => {
                assert_eq!(reply, "op".to_string());
                assert_eq!(client_id, NodeId::from(10));
            }
            _ => panic!("expected a committed reply"),
        }
    }
}
