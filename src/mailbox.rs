//! Cloneable handle to a single broker.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{Broker, QueueBroker, Subscriber};
use crate::error::{MailboxError, TryPutError};
use crate::event::{Envelope, Message};

/// Facade over exactly one [`Broker`].
///
/// Every method delegates; clones share the same underlying queue. The
/// broker can be swapped (push or pull, bounded or not) without touching
/// producers.
///
/// # Examples
///
/// ```
/// use askeda::{Mailbox, PullBroker};
/// use askeda::domain::AppEvent;
///
/// let mailbox: Mailbox<AppEvent> = Mailbox::new(PullBroker::new(16));
/// assert_eq!(mailbox.volume(), 16);
/// assert!(!mailbox.supports_broadcast());
/// ```
pub struct Mailbox<E: Message> {
    broker: Arc<dyn Broker<E>>,
}

impl<E: Message> Clone for Mailbox<E> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
        }
    }
}

impl<E: Message> fmt::Debug for Mailbox<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("len", &self.len())
            .field("volume", &self.volume())
            .finish_non_exhaustive()
    }
}

impl<E: Message> Mailbox<E> {
    /// Wrap `broker`.
    pub fn new(broker: impl Broker<E> + 'static) -> Self {
        Self {
            broker: Arc::new(broker),
        }
    }

    /// Wrap an already shared broker.
    pub fn from_arc(broker: Arc<dyn Broker<E>>) -> Self {
        Self { broker }
    }

    /// A mailbox over an unbounded [`QueueBroker`].
    pub fn unbounded() -> Self {
        Self::new(QueueBroker::unbounded())
    }

    /// See [`Broker::put`].
    ///
    /// # Errors
    ///
    /// [`MailboxError::Timeout`] or [`MailboxError::Closed`].
    pub async fn put(
        &self,
        envelope: Envelope<E>,
        timeout: Option<Duration>,
    ) -> Result<(), MailboxError> {
        self.broker.put(envelope, timeout).await
    }

    /// See [`Broker::try_put`].
    ///
    /// # Errors
    ///
    /// Hands the envelope back when the queue is full or closed.
    pub fn try_put(&self, envelope: Envelope<E>) -> Result<(), TryPutError<Envelope<E>>> {
        self.broker.try_put(envelope)
    }

    /// See [`Broker::get`].
    ///
    /// # Errors
    ///
    /// [`MailboxError::Timeout`] or [`MailboxError::Closed`].
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Envelope<E>, MailboxError> {
        self.broker.get(timeout).await
    }

    /// See [`Broker::try_get`].
    pub fn try_get(&self) -> Option<Envelope<E>> {
        self.broker.try_get()
    }

    /// See [`Broker::register`].
    pub fn register(&self, subscriber: Arc<dyn Subscriber<E>>) -> bool {
        self.broker.register(subscriber)
    }

    /// See [`Broker::broadcast`].
    ///
    /// # Errors
    ///
    /// [`MailboxError::Delivery`] or [`MailboxError::BroadcastUnsupported`].
    pub async fn broadcast(&self) -> Result<usize, MailboxError> {
        self.broker.broadcast().await
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.broker.len()
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.broker.is_empty()
    }

    /// Capacity of the underlying broker; `0` means unbounded.
    pub fn volume(&self) -> usize {
        self.broker.maxsize()
    }

    /// See [`Broker::close`].
    pub fn close(&self) {
        self.broker.close();
    }

    /// Returns `true` once the mailbox was closed.
    pub fn is_closed(&self) -> bool {
        self.broker.is_closed()
    }

    /// Whether the underlying broker implements broadcast.
    pub fn supports_broadcast(&self) -> bool {
        self.broker.supports_broadcast()
    }
}
