//! Describes the data types carried by a particular deployment of the
//! replication core.
//!
//! The concrete application, its state representation, and the wire
//! encoding of requests and replies are external collaborators; this
//! module only names the associated types the rest of the crate is
//! generic over.

/// Bundles together the state, request and reply types of a
/// particular [`crate::bft::executable::Application`].
pub trait SharedData {
    /// The type of the application's replicated state.
    type State: Send + Clone;
    /// The type of a client operation.
    type Request: Send + Clone;
    /// The type of the result of applying a client operation.
    type Reply: Send;
}
