//! Channel abstractions used to deliver [`Message`]s between the
//! asynchronous tasks that make up a replica process.
//!
//! [`Message`]: crate::bft::communication::message::Message

use tokio::sync::mpsc;

use crate::bft::error::*;

/// The sending half of a message channel.
pub struct MessageChannelTx<O, P> {
    inner: mpsc::Sender<super::message::Message<O, P>>,
}

/// The receiving half of a message channel.
pub struct MessageChannelRx<O, P> {
    inner: mpsc::Receiver<super::message::Message<O, P>>,
}

impl<O, P> Clone for MessageChannelTx<O, P> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<O, P> MessageChannelTx<O, P> {
    /// Queues a message for delivery to the owning task.
    pub async fn send(&self, message: super::message::Message<O, P>) -> Result<()> {
        self.inner
            .send(message)
            .await
            .simple(ErrorKind::Communication)
    }

    /// Non-blocking variant of [`Self::send`]; fails immediately if the
    /// channel is full rather than awaiting capacity.
    pub fn try_send(&self, message: super::message::Message<O, P>) -> Result<()> {
        self.inner
            .try_send(message)
            .simple(ErrorKind::Communication)
    }
}

impl<O, P> MessageChannelRx<O, P> {
    /// Awaits the next message delivered to this channel.
    pub async fn recv(&mut self) -> Result<super::message::Message<O, P>> {
        self.inner
            .recv()
            .await
            .ok_or(())
            .simple(ErrorKind::Communication)
    }
}

/// Creates a new bounded message channel with the given capacity.
pub fn new_message_channel<O, P>(bound: usize) -> (MessageChannelTx<O, P>, MessageChannelRx<O, P>) {
    let (tx, rx) = mpsc::channel(bound);
    (MessageChannelTx { inner: tx }, MessageChannelRx { inner: rx })
}
