//! `castellan` is a Practical Byzantine Fault Tolerant (PBFT) replication
//! core: the three-phase pre-prepare/prepare/commit agreement protocol,
//! checkpoint-driven garbage collection, and the view-change/new-view
//! handshake that lets a fixed group of replicas agree on a linear
//! sequence of client operations in the presence of up to `f` Byzantine
//! participants.
//!
//! The transport, the concrete digest/MAC scheme, the replicated
//! application, and process bootstrap are external collaborators; this
//! crate only consumes the [`bft::communication::Transport`] and
//! [`bft::crypto::hash::DigestScheme`] capabilities and exposes inbound
//! message handlers plus a `submit` call.

pub mod bft;
