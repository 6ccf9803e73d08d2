//! Module to order messages exchanged during a consensus instance,
//! as well as views of the replica group.

use std::cmp::{
    PartialOrd,
    PartialEq,
    Ordering,
};

use either::{
    Left,
    Right,
    Either,
};

use crate::bft::log;

#[cfg(feature = "serialize_serde")]
use serde::{Serialize, Deserialize};

/// Trait implemented by types which carry a sequence number,
/// that can be used to order them relative to one another.
pub trait Orderable {
    /// Returns the sequence number of this message, or entity.
    fn sequence_number(&self) -> SeqNo;
}

/// Represents a sequence number attributed to a client request
/// during a consensus instance.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, Eq, PartialEq, Hash)]
pub struct SeqNo(i32);

pub(crate) enum InvalidSeqNo {
    Small,
    Big,
}

impl From<u32> for SeqNo {
    #[inline]
    fn from(sequence_number: u32) -> SeqNo {
        SeqNo(sequence_number as i32)
    }
}

impl From<SeqNo> for u32 {
    #[inline]
    fn from(sequence_number: SeqNo) -> u32 {
        sequence_number.0 as u32
    }
}

impl PartialOrd for SeqNo {
    fn partial_cmp(&self, other: &SeqNo) -> Option<Ordering> {
        match self.index(*other) {
            Right(0) => Some(Ordering::Equal),
            Left(InvalidSeqNo::Small) => Some(Ordering::Less),
            _ => Some(Ordering::Greater),
        }
    }
}

impl SeqNo {
    /// The sequence number that precedes all others; used as the
    /// initial low watermark of a fresh replica.
    pub const ZERO: SeqNo = SeqNo(0);

    /// Returns the following sequence number.
    #[inline]
    pub fn next(self) -> SeqNo {
        let (next, overflow) = (self.0).overflowing_add(1);
        SeqNo(if overflow { 0 } else { next })
    }

    /// Returns the sequence number `n` positions ahead of `self`.
    #[inline]
    pub fn advance(self, n: u32) -> SeqNo {
        SeqNo((self.0).wrapping_add(n as i32))
    }

    /// Return an appropriate value to index the out-of-order message
    /// buffers, relative to `other`.
    #[inline]
    pub(crate) fn index(self, other: SeqNo) -> Either<InvalidSeqNo, usize> {
        const OVERFLOW_THRES_POS: i32 = 10000;
        const OVERFLOW_THRES_NEG: i32 = -OVERFLOW_THRES_POS;
        const DROP_SEQNO_THRES: i32 = (log::WATERMARK_WINDOW + (log::WATERMARK_WINDOW >> 1)) as i32;

        let index = {
            let index = (self.0).wrapping_sub(other.0);
            if index < OVERFLOW_THRES_NEG || index > OVERFLOW_THRES_POS {
                i32::MAX
                    .wrapping_add(index)
                    .wrapping_add(1)
            } else {
                index
            }
        };

        if index < 0 || index > DROP_SEQNO_THRES {
            Left(if index < 0 {
                InvalidSeqNo::Small
            } else {
                InvalidSeqNo::Big
            })
        } else {
            Right(index as usize)
        }
    }

    /// Whether this sequence number falls on a checkpoint boundary,
    /// i.e. is a positive multiple of the checkpoint interval.
    #[inline]
    pub fn is_checkpoint_boundary(self) -> bool {
        let n = self.0;
        n > 0 && (n as u32) % log::CHECKPOINT_INTERVAL == 0
    }
}

/// Represents a view number of the replica group.
///
/// Each view determines which replica acts as primary: the replica
/// whose id equals `view mod n`.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct View {
    seq: SeqNo,
    n: usize,
    f: usize,
}

impl Orderable for View {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

impl View {
    /// Creates the initial view (number zero) of a group of `n` replicas.
    ///
    /// `n` must be at least `3f + 1` for the supplied `f`.
    pub fn new(n: usize, f: usize) -> Self {
        Self { seq: SeqNo::ZERO, n, f }
    }

    /// Returns the numeric identifier of this view.
    pub fn number(&self) -> u32 {
        u32::from(self.seq)
    }

    /// Returns the next view, following this one.
    pub fn next_view(&self) -> Self {
        Self { seq: self.seq.next(), n: self.n, f: self.f }
    }

    /// Returns the total number of replicas in the group.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Returns the maximum number of faulty replicas tolerated.
    pub fn f(&self) -> usize {
        self.f
    }

    /// Returns the size of a Byzantine quorum, i.e. `2f + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    /// Returns the id of the replica elected primary in this view.
    pub fn leader(&self) -> u32 {
        (self.number() as usize % self.n) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_ordering_wraps_around_window() {
        let a = SeqNo::from(5);
        let b = SeqNo::from(7);
        assert!(a < b);
        assert_eq!(a.next(), SeqNo::from(6));
    }

    #[test]
    fn checkpoint_boundary_is_multiple_of_interval() {
        let boundary = SeqNo::from(log::CHECKPOINT_INTERVAL);
        assert!(boundary.is_checkpoint_boundary());
        assert!(!SeqNo::from(1).is_checkpoint_boundary());
        assert!(!SeqNo::ZERO.is_checkpoint_boundary());
    }

    #[test]
    fn view_leader_rotates_with_view_number() {
        let v0 = View::new(4, 1);
        assert_eq!(v0.leader(), 0);
        assert_eq!(v0.quorum(), 3);
        let v1 = v0.next_view();
        assert_eq!(v1.leader(), 1);
        assert_eq!(v1.number(), 1);
    }
}
