//! A one-shot, cancellable timer service.
//!
//! Per §5 of the replica's concurrency model, a fired timer is
//! delivered as an inbound event on the replica's own message channel,
//! rather than mutating replica state from whatever task the timer
//! happens to run on. This keeps the single-mutex discipline intact:
//! the replica actor is the only task that ever touches its log,
//! tallies, or timer map.

use std::time::Duration;

use crate::bft::async_runtime as rt;
use crate::bft::communication::channel::MessageChannelTx;
use crate::bft::communication::message::Message;
use crate::bft::communication::NodeId;

/// Identifies what a fired timer is about.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TimeoutKind {
    /// The per-request liveness timer, armed when a replica first sees
    /// a client request (or a pre-prepare for it), and cancelled once
    /// that request commits. Expiry drives a view-change.
    Request { client_id: NodeId, timestamp: u64 },
}

/// A handle to a scheduled timer. Dropping it without calling
/// [`Self::cancel`] leaves the timer running.
pub struct TimerHandle {
    cancel_tx: oneshot::Sender<()>,
}

impl TimerHandle {
    /// Cancels the timer. A timer that fires concurrently with its own
    /// cancellation is a benign race: the event, if already queued,
    /// must be treated as a no-op by the replica.
    pub fn cancel(self) {
        let _ = self.cancel_tx.send(());
    }
}

/// Schedules timers that deliver [`TimeoutKind`] events back onto a
/// replica's message channel.
pub struct TimeoutsHandle<O, P> {
    system_tx: MessageChannelTx<O, P>,
}

impl<O, P> Clone for TimeoutsHandle<O, P> {
    fn clone(&self) -> Self {
        Self { system_tx: self.system_tx.clone() }
    }
}

impl<O, P> TimeoutsHandle<O, P>
where
    O: Send + 'static,
    P: Send + 'static,
{
    /// Creates a new `TimeoutsHandle`, delivering expired timers onto
    /// `system_tx`.
    pub fn new(system_tx: MessageChannelTx<O, P>) -> Self {
        Self { system_tx }
    }

    /// Schedules a new timer of the given `kind`, to fire after `duration`.
    pub fn schedule(&self, duration: Duration, kind: TimeoutKind) -> TimerHandle {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let system_tx = self.system_tx.clone();

        rt::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    let _ = system_tx.send(Message::Timeout(kind)).await;
                }
                _ = cancel_rx => {
                    // cancelled before firing, nothing to deliver
                }
            }
        });

        TimerHandle { cancel_tx }
    }
}
