//! The replica's message log: per-sequence log entries, the
//! prepare/commit/checkpoint tally maps, and the garbage collection
//! machinery that keeps them bounded to the current watermark window.
//!
//! This module owns storage and quorum bookkeeping; the protocol
//! decisions built on top of it (when a phase actually advances, when
//! a view-change fires) live in [`crate::bft::consensus`].

use crate::bft::collections::HashMap;
use crate::bft::communication::message::{PreparedCertificate, RequestMessage};
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::ordering::{Orderable, SeqNo, View};

/// The watermark window size, `K`, measured in sequence numbers: a
/// replica accepts messages in `[low_water, low_water + K]`.
///
/// Suggested by the spec as twice the checkpoint interval.
pub const WATERMARK_WINDOW: u32 = 2 * CHECKPOINT_INTERVAL;

/// Checkpoint period: every `CHECKPOINT_INTERVAL` committed sequence
/// numbers, a replica proposes a new stable checkpoint.
pub const CHECKPOINT_INTERVAL: u32 = 10;

/// The phase of a [`LogEntry`], following the three-phase agreement
/// protocol. Phases only ever advance forward.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub enum Phase {
    PrePrepared,
    Prepared,
    Committed,
}

/// A single entry in the replica's log, tracking the agreement state
/// of one sequence number.
#[derive(Clone)]
pub struct LogEntry<O, P> {
    seq: SeqNo,
    view: View,
    phase: Phase,
    request: RequestMessage<O>,
    digest: Digest,
    reply: Option<P>,
}

impl<O, P> Orderable for LogEntry<O, P> {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

impl<O, P> LogEntry<O, P> {
    fn new(seq: SeqNo, view: View, digest: Digest, request: RequestMessage<O>) -> Self {
        Self {
            seq,
            view,
            phase: Phase::PrePrepared,
            request,
            digest,
            reply: None,
        }
    }

    /// Returns the view this entry was pre-prepared under.
    pub fn view(&self) -> View {
        self.view
    }

    /// Returns the current phase of this log entry.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns the digest agreed upon for this sequence number.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Returns a reference to the logged request.
    pub fn request(&self) -> &RequestMessage<O> {
        &self.request
    }

    /// Returns the cached reply, once the entry has committed.
    pub fn reply(&self) -> Option<&P> {
        self.reply.as_ref()
    }
}

/// Per-sequence tally of votes (replica id -> claimed digest) for one
/// of the three broadcast phases.
#[derive(Clone, Default)]
struct Tally {
    votes: HashMap<NodeId, Digest>,
}

impl Tally {
    fn record(&mut self, replica_id: NodeId, digest: Digest) {
        // duplicate votes from the same replica must not inflate the count;
        // a `HashMap` enforces this by construction
        self.votes.insert(replica_id, digest);
    }

    /// Returns the digest that has reached at least `quorum` distinct
    /// votes, if any.
    fn quorum_digest(&self, quorum: usize) -> Option<Digest> {
        let mut counts: HashMap<Digest, usize> = HashMap::default();
        for digest in self.votes.values() {
            *counts.entry(*digest).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .find(|&(_, count)| count >= quorum)
            .map(|(digest, _)| digest)
    }

    fn voters(&self) -> Vec<(NodeId, Digest)> {
        self.votes.iter().map(|(&id, &d)| (id, d)).collect()
    }
}

/// A stable checkpoint: a sequence number and the digest of the
/// application state after applying every request up to and including
/// it.
#[derive(Debug, Copy, Clone)]
pub struct Checkpoint {
    seq: SeqNo,
    digest: Digest,
}

impl Orderable for Checkpoint {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

impl Checkpoint {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

/// The replica's message log, owning [`LogEntry`] storage, the
/// per-phase tally maps, stable-checkpoint tracking, and the reply
/// cache used to deduplicate re-submitted client requests.
pub struct Log<O, P> {
    f: usize,
    entries: HashMap<SeqNo, LogEntry<O, P>>,
    prepare_tally: HashMap<SeqNo, Tally>,
    commit_tally: HashMap<SeqNo, Tally>,
    checkpoint_tally: HashMap<SeqNo, Tally>,
    low_water: SeqNo,
    last_stable_checkpoint: Option<Checkpoint>,
    max_committed: SeqNo,
    next_to_apply: SeqNo,
    reply_cache: HashMap<(NodeId, u64), P>,
}

/// Reported by [`Log::advance_commit`], telling the caller whether a
/// new checkpoint should now be proposed.
pub enum Info {
    Nil,
    BeginCheckpoint { seq: SeqNo },
}

impl<O, P> Log<O, P>
where
    O: Clone,
    P: Clone,
{
    /// Creates a new, empty log for a replica group tolerating `f` faults.
    pub fn new(f: usize) -> Self {
        Self {
            f,
            entries: HashMap::default(),
            prepare_tally: HashMap::default(),
            commit_tally: HashMap::default(),
            checkpoint_tally: HashMap::default(),
            low_water: SeqNo::ZERO,
            last_stable_checkpoint: None,
            max_committed: SeqNo::ZERO,
            next_to_apply: SeqNo::ZERO.next(),
            reply_cache: HashMap::default(),
        }
    }

    fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    /// The low watermark: the sequence number of the last stable
    /// checkpoint, or zero if none has formed yet.
    pub fn low_water(&self) -> SeqNo {
        self.low_water
    }

    /// The high watermark: `low_water + K`.
    pub fn high_water(&self) -> SeqNo {
        self.low_water.advance(WATERMARK_WINDOW)
    }

    /// The highest sequence number committed so far.
    pub fn max_committed(&self) -> SeqNo {
        self.max_committed
    }

    /// Whether `seq` falls within the accepted window
    /// `[low_water, high_water]`.
    pub fn in_window(&self, seq: SeqNo) -> bool {
        seq >= self.low_water && seq <= self.high_water()
    }

    /// Returns the last stable checkpoint, if one has formed.
    pub fn last_stable_checkpoint(&self) -> Option<&Checkpoint> {
        self.last_stable_checkpoint.as_ref()
    }

    /// Returns a reference to the log entry at `seq`, if any.
    pub fn entry(&self, seq: SeqNo) -> Option<&LogEntry<O, P>> {
        self.entries.get(&seq)
    }

    /// Looks up a cached reply for a given client request, used to
    /// resend the answer to a duplicate submission without
    /// re-allocating a sequence number.
    pub fn cached_reply(&self, client_id: NodeId, timestamp: u64) -> Option<&P> {
        self.reply_cache.get(&(client_id, timestamp))
    }

    /// Inserts a fresh log entry in the `PrePrepared` phase. Returns an
    /// error if a *different* digest is already logged for `seq` under
    /// the same `view` — a sign of an equivocating primary.
    pub fn insert_pre_prepare(
        &mut self,
        seq: SeqNo,
        view: View,
        digest: Digest,
        request: RequestMessage<O>,
    ) -> Result<()> {
        if let Some(existing) = self.entries.get(&seq) {
            if existing.view == view && existing.digest != digest {
                return Err("Conflicting digest already logged for this (view, seq)")
                    .wrapped(ErrorKind::Log);
            }
            if existing.view == view {
                // duplicate pre-prepare, idempotent
                return Ok(());
            }
        }
        self.entries.insert(seq, LogEntry::new(seq, view, digest, request));
        Ok(())
    }

    /// Records a `PREPARE` vote from `replica_id` for `digest` at `seq`.
    pub fn record_prepare(&mut self, seq: SeqNo, replica_id: NodeId, digest: Digest) {
        self.prepare_tally.entry(seq).or_default().record(replica_id, digest);
    }

    /// Records a `COMMIT` vote from `replica_id` for `digest` at `seq`.
    pub fn record_commit(&mut self, seq: SeqNo, replica_id: NodeId, digest: Digest) {
        self.commit_tally.entry(seq).or_default().record(replica_id, digest);
    }

    /// Records a `CHECKPOINT` vote from `replica_id` for `digest` at `seq`.
    pub fn record_checkpoint(&mut self, seq: SeqNo, replica_id: NodeId, digest: Digest) {
        self.checkpoint_tally.entry(seq).or_default().record(replica_id, digest);
    }

    /// If `prepare_tally[seq]` has a Byzantine quorum on the entry's own
    /// digest, transitions the entry to `Prepared` and returns `true`.
    ///
    /// No-ops (returning `false`) if the entry isn't `PrePrepared`, or
    /// no quorum has formed yet.
    pub fn advance_prepare(&mut self, seq: SeqNo) -> bool {
        let quorum = self.quorum();
        let digest = match self.entries.get(&seq) {
            Some(entry) if entry.phase == Phase::PrePrepared => entry.digest,
            _ => return false,
        };
        let tally = match self.prepare_tally.get(&seq) {
            Some(t) => t,
            None => return false,
        };
        match tally.quorum_digest(quorum) {
            Some(d) if d == digest => {
                self.entries.get_mut(&seq).unwrap().phase = Phase::Prepared;
                true
            }
            _ => false,
        }
    }

    /// Builds the [`PreparedCertificate`] for `seq`, once it has
    /// reached at least the `Prepared` phase.
    pub fn prepared_certificate(&self, seq: SeqNo) -> Option<PreparedCertificate<O>> {
        let entry = self.entries.get(&seq)?;
        if entry.phase < Phase::Prepared {
            return None;
        }
        let tally = self.prepare_tally.get(&seq)?;
        Some(PreparedCertificate::new(
            entry.view,
            entry.seq,
            entry.digest,
            entry.request.clone(),
            tally.voters(),
        ))
    }

    /// If `commit_tally[seq]` has a Byzantine quorum on the entry's own
    /// digest, transitions the entry to `Committed`. Returns the reply
    /// to send to the client, if this call caused the transition.
    pub fn advance_commit(&mut self, seq: SeqNo, apply: impl FnOnce(&O) -> P) -> Option<P> {
        let quorum = self.quorum();
        let digest = match self.entries.get(&seq) {
            Some(entry) if entry.phase == Phase::Prepared => entry.digest,
            _ => return None,
        };
        let tally = self.commit_tally.get(&seq)?;
        match tally.quorum_digest(quorum) {
            Some(d) if d == digest => {
                let entry = self.entries.get_mut(&seq).unwrap();
                entry.phase = Phase::Committed;
                let reply = apply(entry.request.operation());
                entry.reply = Some(reply.clone());
                if seq > self.max_committed {
                    self.max_committed = seq;
                }
                self.reply_cache.insert(
                    (entry.request.client_id(), entry.request.timestamp()),
                    reply.clone(),
                );
                Some(reply)
            }
            _ => None,
        }
    }

    /// Whether a new checkpoint should be proposed, per §4.2: the
    /// highest committed sequence has pulled `CHECKPOINT_INTERVAL` or
    /// more sequence numbers ahead of the last stable checkpoint.
    pub fn should_checkpoint(&self) -> Info {
        let last = self.last_stable_checkpoint.map(|c| c.seq).unwrap_or(SeqNo::ZERO);
        let ahead = u32::from(self.max_committed).saturating_sub(u32::from(last));
        if ahead >= CHECKPOINT_INTERVAL {
            Info::BeginCheckpoint { seq: self.max_committed }
        } else {
            Info::Nil
        }
    }

    /// Records a checkpoint vote and, once a Byzantine quorum agrees on
    /// a digest for `seq`, stabilizes the checkpoint, slides the low
    /// watermark and garbage collects everything at or below it.
    ///
    /// Returns `true` if the checkpoint became stable as a result of
    /// this call.
    pub fn on_checkpoint_vote(&mut self, seq: SeqNo, replica_id: NodeId, digest: Digest) -> bool {
        self.record_checkpoint(seq, replica_id, digest);

        let already_stable = self
            .last_stable_checkpoint
            .map(|c| seq <= c.seq)
            .unwrap_or(false);
        if already_stable {
            return false;
        }

        let quorum = self.quorum();
        let stabilized = match self.checkpoint_tally.get(&seq) {
            Some(tally) => tally.quorum_digest(quorum),
            None => None,
        };

        match stabilized {
            Some(digest) => {
                log::info!("checkpoint stable at seq {:?}, low watermark advanced", u32::from(seq));
                self.last_stable_checkpoint = Some(Checkpoint { seq, digest });
                self.low_water = seq;
                self.garbage_collect(seq);
                true
            }
            None => false,
        }
    }

    /// Deletes every tally entry with sequence `<= seq`, and every log
    /// entry `<= seq` that did not reach `Committed` (discarded
    /// outright) or did (kept only for reply deduplication).
    ///
    /// Each tally structure is collected against its own keyspace —
    /// never against another structure's.
    fn garbage_collect(&mut self, seq: SeqNo) {
        self.prepare_tally.retain(|&s, _| s > seq);
        self.commit_tally.retain(|&s, _| s > seq);
        self.checkpoint_tally.retain(|&s, _| s > seq);
        self.entries.retain(|&s, entry| s > seq || entry.phase == Phase::Committed);
    }

    /// Applies every log entry that has committed, in strict sequence
    /// order, starting from `next_to_apply`, stopping at the first gap.
    ///
    /// Returns the sequence numbers applied, in order.
    pub fn drain_committed_in_order(&mut self) -> Vec<SeqNo> {
        let mut applied = Vec::new();
        loop {
            let seq = self.next_to_apply;
            match self.entries.get(&seq) {
                Some(entry) if entry.phase == Phase::Committed => {
                    applied.push(seq);
                    self.next_to_apply = seq.next();
                }
                _ => break,
            }
        }
        applied
    }

    /// Returns every [`PreparedCertificate`] currently reconstructible
    /// from the log, i.e. one for every entry that has reached at
    /// least the `Prepared` phase. Used to build the `prepared_set`
    /// broadcast in a `ViewChange`.
    pub fn prepared_certificates(&self) -> Vec<PreparedCertificate<O>> {
        let mut out = Vec::new();
        for (&seq, entry) in self.entries.iter() {
            if entry.phase >= Phase::Prepared {
                if let Some(cert) = self.prepared_certificate(seq) {
                    out.push(cert);
                }
            }
        }
        out
    }

    /// Discards the log entry, and its tallies, at `seq` — used when
    /// installing a new view's reconstructed pre-prepares over
    /// whatever was previously logged.
    pub fn discard(&mut self, seq: SeqNo) {
        self.entries.remove(&seq);
        self.prepare_tally.remove(&seq);
        self.commit_tally.remove(&seq);
    }
}
