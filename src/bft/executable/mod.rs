//! User application execution business logic.
//!
//! The replicated application itself — its state, the meaning of its
//! operations, and how it fingerprints its state for checkpoints — is
//! an external collaborator. This module only describes the capability
//! the protocol core drives it through.

use crate::bft::communication::serialize::SharedData;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;

/// State type of the `Application`.
pub type State<S> = <<S as Application>::Data as SharedData>::State;

/// Request type of the `Application`.
pub type Request<S> = <<S as Application>::Data as SharedData>::Request;

/// Reply type of the `Application`.
pub type Reply<S> = <<S as Application>::Data as SharedData>::Reply;

/// A user defined application, replicated by the protocol core.
///
/// The core never inspects `Request` or `Reply` payloads; it only
/// needs `apply` to be deterministic across correct replicas, so that
/// agreement on the sequence of requests implies agreement on the
/// resulting state.
pub trait Application {
    /// The data types used by the application and the SMR protocol.
    type Data: SharedData;

    /// Returns the initial state of the application.
    fn initial_state(&mut self) -> Result<State<Self>>;

    /// Process a user request, producing a matching reply, meanwhile
    /// updating the application state.
    fn update(&mut self, state: &mut State<Self>, request: Request<Self>) -> Reply<Self>;

    /// Computes a collision-resistant fingerprint of the application
    /// state, used to agree on checkpoints.
    fn fingerprint(&self, state: &State<Self>) -> Digest;
}
