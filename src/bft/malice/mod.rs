//! Fault-injection harness.
//!
//! Lets a deployment configure, per outbound message kind, whether a
//! replica behaves correctly, crashes silently, or equivocates to some
//! or all recipients. Used to exercise the safety properties of the
//! agreement protocol under a bounded number of Byzantine replicas.

use crate::bft::collections::HashMap;
use crate::bft::communication::message::SystemMessage;
use crate::bft::communication::{NodeId, Transport};
use crate::bft::error::*;

/// The outbound message kinds a [`MaliceTable`] can target.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageKind {
    PrePrepare,
    Prepare,
    Commit,
    Checkpoint,
    ViewChange,
    NewView,
}

impl MessageKind {
    const ALL: [MessageKind; 6] = [
        MessageKind::PrePrepare,
        MessageKind::Prepare,
        MessageKind::Commit,
        MessageKind::Checkpoint,
        MessageKind::ViewChange,
        MessageKind::NewView,
    ];
}

/// The behavior a replica exhibits when broadcasting a given message kind.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MaliceMode {
    /// Send the real payload to every replica.
    Normal,
    /// Suppress the broadcast entirely, simulating a crash for this
    /// message kind.
    Silent,
    /// Send a corrupted payload to the first `k` recipients, the real
    /// payload to the rest.
    PartialFake(usize),
    /// Send a corrupted payload to every recipient.
    FullFake,
}

/// Per-message-kind malice configuration for a single replica.
pub struct MaliceTable {
    modes: HashMap<MessageKind, MaliceMode>,
}

impl MaliceTable {
    /// Creates a table where every message kind behaves normally.
    pub fn new() -> Self {
        let mut modes = HashMap::default();
        for kind in MessageKind::ALL {
            modes.insert(kind, MaliceMode::Normal);
        }
        Self { modes }
    }

    /// Returns the configured mode for `kind`.
    pub fn mode(&self, kind: MessageKind) -> MaliceMode {
        self.modes.get(&kind).copied().unwrap_or(MaliceMode::Normal)
    }

    /// Sets the mode for `kind` (or every kind, if `kind` is `None`),
    /// validating `PartialFake`'s `k` against the replica group size `n`.
    pub fn set_mode(&mut self, kind: Option<MessageKind>, mode: MaliceMode, n: usize) -> Result<()> {
        if let MaliceMode::PartialFake(k) = mode {
            if k > n {
                return Err("partial_k exceeds the replica group size")
                    .wrapped(ErrorKind::Config);
            }
        }
        match kind {
            Some(kind) => {
                self.modes.insert(kind, mode);
            }
            None => {
                for kind in MessageKind::ALL {
                    self.modes.insert(kind, mode);
                }
            }
        }
        Ok(())
    }
}

impl Default for MaliceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcasts `message` according to the configured [`MaliceMode`] for
/// `kind`, using `corrupt` to build the equivocated payload on demand.
///
/// Corruption is message-kind specific — e.g. a faked pre-prepare
/// keeps `(view, seq)` but substitutes a sentinel digest and
/// operation — so the caller supplies it as a closure rather than this
/// module trying to synthesize one generically.
pub fn broadcast<O, P, T, F>(
    table: &MaliceTable,
    kind: MessageKind,
    transport: &T,
    from: NodeId,
    message: SystemMessage<O, P>,
    corrupt: F,
) where
    T: Transport<O, P>,
    O: Clone,
    P: Clone,
    F: FnOnce(&SystemMessage<O, P>) -> SystemMessage<O, P>,
{
    match table.mode(kind) {
        MaliceMode::Normal => transport.broadcast(from, message),
        MaliceMode::Silent => {
            log::warn!("replica {:?} suppressing {:?} broadcast (malice: silent)", from, kind);
        }
        MaliceMode::FullFake => {
            log::warn!("replica {:?} equivocating {:?} to every recipient (malice: full fake)", from, kind);
            transport.broadcast(from, corrupt(&message));
        }
        MaliceMode::PartialFake(k) => {
            log::warn!("replica {:?} equivocating {:?} to {} of {} recipients (malice: partial fake)", from, kind, k, transport.targets().len());
            let fake = corrupt(&message);
            for (i, &target) in transport.targets().iter().enumerate() {
                let payload = if i < k { fake.clone() } else { message.clone() };
                transport.send(from, target, payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_normal_for_every_kind() {
        let table = MaliceTable::new();
        assert_eq!(table.mode(MessageKind::Prepare), MaliceMode::Normal);
        assert_eq!(table.mode(MessageKind::NewView), MaliceMode::Normal);
    }

    #[test]
    fn rejects_partial_fake_beyond_group_size() {
        let mut table = MaliceTable::new();
        let err = table.set_mode(Some(MessageKind::Commit), MaliceMode::PartialFake(5), 4);
        assert!(err.is_err());
    }

    #[test]
    fn set_all_overrides_every_kind() {
        let mut table = MaliceTable::new();
        table.set_mode(None, MaliceMode::Silent, 4).unwrap();
        assert_eq!(table.mode(MessageKind::Checkpoint), MaliceMode::Silent);
        assert_eq!(table.mode(MessageKind::ViewChange), MaliceMode::Silent);
    }
}
