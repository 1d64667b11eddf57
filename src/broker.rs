//! Message brokers: thread-safe FIFO queues of sealed envelopes plus a
//! subscriber registry.
//!
//! Two implementations share one queue core:
//!
//! - [`QueueBroker`] is push-capable: [`broadcast`](Broker::broadcast)
//!   drains the queue into every registered subscriber.
//! - [`PullBroker`] is pull-only: consumers poll [`get`](Broker::get), and
//!   `broadcast` answers [`MailboxError::BroadcastUnsupported`].
//!
//! `put` and `get` are the only suspension points. Both take an optional
//! timeout and are cancel-safe: dropping the future before it resolves leaves
//! the queue exactly as it was.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, TryAcquireError};

use crate::error::{DeliveryError, HandlerError, HandlerFailure, MailboxError, TryPutError};
use crate::event::{Envelope, Message};

/// A receiver of broadcast messages.
///
/// Subscribers are identified by the address of their `Arc`; registering
/// the same `Arc` twice is a no-op.
#[async_trait]
pub trait Subscriber<E: Message>: Send + Sync {
    /// Name used in logs and [`HandlerFailure`] reports.
    fn name(&self) -> &str;

    /// Handle one message. Errors are collected by the broadcaster; they do
    /// not stop delivery to the remaining subscribers.
    async fn receive(&self, envelope: &Envelope<E>) -> Result<(), HandlerError>;
}

/// Queue contract shared by every broker.
///
/// `timeout: None` waits indefinitely. A [`MailboxError::Timeout`] always
/// leaves the queue unchanged.
#[async_trait]
pub trait Broker<E: Message>: Send + Sync {
    /// Enqueue, waiting for space while a bounded queue is full.
    ///
    /// # Errors
    ///
    /// [`MailboxError::Timeout`] when no slot freed up in time,
    /// [`MailboxError::Closed`] when the queue is closed.
    async fn put(&self, envelope: Envelope<E>, timeout: Option<Duration>)
    -> Result<(), MailboxError>;

    /// Enqueue without waiting.
    ///
    /// # Errors
    ///
    /// Hands the envelope back in [`TryPutError`] when the queue is full or
    /// closed.
    fn try_put(&self, envelope: Envelope<E>) -> Result<(), TryPutError<Envelope<E>>>;

    /// Dequeue the oldest message, waiting while the queue is empty.
    ///
    /// After [`close`](Broker::close), remaining messages are still returned;
    /// once drained every call fails with [`MailboxError::Closed`].
    ///
    /// # Errors
    ///
    /// [`MailboxError::Timeout`] or [`MailboxError::Closed`].
    async fn get(&self, timeout: Option<Duration>) -> Result<Envelope<E>, MailboxError>;

    /// Dequeue the oldest message if there is one.
    fn try_get(&self) -> Option<Envelope<E>>;

    /// Add a subscriber. Returns `false` if it was already registered or the
    /// broker does not deliver to subscribers.
    fn register(&self, subscriber: Arc<dyn Subscriber<E>>) -> bool;

    /// Drain the queue, delivering each message to the subscribers registered
    /// at the moment it was dequeued, in registration order.
    ///
    /// Returns the number of messages delivered by this call.
    ///
    /// # Errors
    ///
    /// [`MailboxError::Delivery`] listing every subscriber failure, reported
    /// after the drain completes. [`MailboxError::BroadcastUnsupported`] on
    /// pull-only brokers.
    async fn broadcast(&self) -> Result<usize, MailboxError>;

    /// Number of queued messages.
    fn len(&self) -> usize;

    /// Returns `true` when nothing is queued.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity; `0` means unbounded.
    fn maxsize(&self) -> usize;

    /// Close the queue. Blocked callers wake with [`MailboxError::Closed`];
    /// queued messages stay drainable.
    fn close(&self);

    /// Returns `true` once [`close`](Broker::close) was called.
    fn is_closed(&self) -> bool;

    /// Whether [`broadcast`](Broker::broadcast) is implemented.
    fn supports_broadcast(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Queue core
// ---------------------------------------------------------------------------

/// Bounded or unbounded FIFO guarded by two semaphores.
///
/// `filled` holds one permit per queued item; `slots` (bounded queues only)
/// holds one permit per free slot. A permit is always taken before the
/// matching mutation, so the item count never drops below `filled`'s permits.
struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    filled: Semaphore,
    slots: Option<Semaphore>,
    capacity: usize,
    closed: AtomicBool,
}

impl<T> Queue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            filled: Semaphore::new(0),
            slots: (capacity > 0).then(|| Semaphore::new(capacity)),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    async fn put(&self, item: T, timeout: Option<Duration>) -> Result<(), MailboxError> {
        if self.is_closed() {
            return Err(MailboxError::Closed);
        }
        if let Some(slots) = &self.slots {
            acquire(slots, timeout).await?;
        }
        self.push(item);
        Ok(())
    }

    fn try_put(&self, item: T) -> Result<(), TryPutError<T>> {
        if self.is_closed() {
            return Err(TryPutError::Closed(item));
        }
        if let Some(slots) = &self.slots {
            match slots.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(TryAcquireError::NoPermits) => {
                    return Err(TryPutError::QueueFull {
                        message: item,
                        capacity: self.capacity,
                    });
                }
                Err(TryAcquireError::Closed) => return Err(TryPutError::Closed(item)),
            }
        }
        self.push(item);
        Ok(())
    }

    async fn get(&self, timeout: Option<Duration>) -> Result<T, MailboxError> {
        if self.is_closed() {
            return self.pop().ok_or(MailboxError::Closed);
        }
        match acquire(&self.filled, timeout).await {
            Ok(()) | Err(MailboxError::Closed) => self.pop().ok_or(MailboxError::Closed),
            Err(e) => Err(e),
        }
    }

    fn try_get(&self) -> Option<T> {
        if self.is_closed() {
            return self.pop();
        }
        match self.filled.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.pop()
            }
            Err(TryAcquireError::Closed) => self.pop(),
            Err(TryAcquireError::NoPermits) => None,
        }
    }

    fn push(&self, item: T) {
        self.lock().push_back(item);
        self.filled.add_permits(1);
    }

    fn pop(&self) -> Option<T> {
        let item = self.lock().pop_front();
        if item.is_some()
            && let Some(slots) = &self.slots
        {
            slots.add_permits(1);
        }
        item
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.filled.close();
        if let Some(slots) = &self.slots {
            slots.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // The critical sections never panic midway, so a poisoned lock still
    // guards a consistent deque.
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Take one permit from `sem` and forget it, honoring `timeout`.
async fn acquire(sem: &Semaphore, timeout: Option<Duration>) -> Result<(), MailboxError> {
    let permit = match timeout {
        Some(limit) => tokio::time::timeout(limit, sem.acquire())
            .await
            .map_err(|_| MailboxError::Timeout(limit))?,
        None => sem.acquire().await,
    };
    permit.map_err(|_| MailboxError::Closed)?.forget();
    Ok(())
}

// ---------------------------------------------------------------------------
// QueueBroker
// ---------------------------------------------------------------------------

/// Push-capable broker: a FIFO queue plus an ordered set of subscribers.
///
/// At most one [`broadcast`](Broker::broadcast) pass runs at a time. A call
/// made while another pass is running returns `Ok(0)` at once; the running
/// pass re-checks the queue before it finishes and delivers the newcomer's
/// messages too. This also makes it safe for a subscriber to enqueue and
/// broadcast from inside `receive`.
///
/// # Examples
///
/// ```
/// use askeda::{Broker, Envelope, QueueBroker};
/// use askeda::domain::customer::CustomerEvent;
///
/// let broker = QueueBroker::<CustomerEvent>::new(1);
/// let env = Envelope::new("c1", CustomerEvent::CustomerIsPreferred { customer_id: "c1".into() });
/// broker.try_put(env.clone()).expect("first put should succeed");
/// assert!(broker.try_put(env).is_err(), "capacity is one");
/// assert_eq!(broker.len(), 1);
/// ```
pub struct QueueBroker<E: Message> {
    queue: Queue<Envelope<E>>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber<E>>>>,
    in_flight: tokio::sync::Mutex<()>,
}

impl<E: Message> QueueBroker<E> {
    /// Create a broker holding at most `maxsize` messages (`0` = unbounded).
    pub fn new(maxsize: usize) -> Self {
        Self {
            queue: Queue::new(maxsize),
            subscribers: RwLock::new(Vec::new()),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Create an unbounded broker.
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Snapshot of the registered subscribers, in registration order.
    pub fn subscribers(&self) -> Vec<Arc<dyn Subscriber<E>>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn deliver(&self, envelope: &Envelope<E>, failures: &mut Vec<HandlerFailure>) {
        for subscriber in self.subscribers() {
            if let Err(e) = subscriber.receive(envelope).await {
                tracing::error!(
                    subscriber = subscriber.name(),
                    message_type = envelope.message_type(),
                    entity_id = envelope.entity_id(),
                    version = envelope.version(),
                    error = %e,
                    "subscriber failed"
                );
                failures.push(HandlerFailure {
                    handler: subscriber.name().to_string(),
                    message_type: envelope.message_type().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

impl<E: Message> fmt::Debug for QueueBroker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueBroker")
            .field("len", &self.queue.len())
            .field("maxsize", &self.queue.capacity)
            .field("closed", &self.queue.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<E: Message> Broker<E> for QueueBroker<E> {
    async fn put(
        &self,
        envelope: Envelope<E>,
        timeout: Option<Duration>,
    ) -> Result<(), MailboxError> {
        self.queue.put(envelope, timeout).await
    }

    fn try_put(&self, envelope: Envelope<E>) -> Result<(), TryPutError<Envelope<E>>> {
        self.queue.try_put(envelope)
    }

    async fn get(&self, timeout: Option<Duration>) -> Result<Envelope<E>, MailboxError> {
        self.queue.get(timeout).await
    }

    fn try_get(&self) -> Option<Envelope<E>> {
        self.queue.try_get()
    }

    fn register(&self, subscriber: Arc<dyn Subscriber<E>>) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let id = Arc::as_ptr(&subscriber).cast::<()>();
        if subscribers
            .iter()
            .any(|s| std::ptr::eq(Arc::as_ptr(s).cast::<()>(), id))
        {
            return false;
        }
        tracing::debug!(subscriber = subscriber.name(), "subscriber registered");
        subscribers.push(subscriber);
        true
    }

    async fn broadcast(&self) -> Result<usize, MailboxError> {
        let mut delivered = 0;
        let mut failures = Vec::new();

        loop {
            let Ok(guard) = self.in_flight.try_lock() else {
                tracing::debug!("broadcast already in flight");
                break;
            };
            while let Some(envelope) = self.queue.try_get() {
                self.deliver(&envelope, &mut failures).await;
                delivered += 1;
            }
            drop(guard);
            if self.queue.len() == 0 {
                break;
            }
        }

        if failures.is_empty() {
            Ok(delivered)
        } else {
            Err(DeliveryError { failures }.into())
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn maxsize(&self) -> usize {
        self.queue.capacity
    }

    fn close(&self) {
        self.queue.close();
    }

    fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    fn supports_broadcast(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// PullBroker
// ---------------------------------------------------------------------------

/// Pull-only broker: consumers poll [`get`](Broker::get).
///
/// There is no subscriber registry. [`register`](Broker::register) logs a
/// warning and returns `false`; [`broadcast`](Broker::broadcast) fails with
/// [`MailboxError::BroadcastUnsupported`].
pub struct PullBroker<E: Message> {
    queue: Queue<Envelope<E>>,
}

impl<E: Message> PullBroker<E> {
    /// Create a broker holding at most `maxsize` messages (`0` = unbounded).
    pub fn new(maxsize: usize) -> Self {
        Self {
            queue: Queue::new(maxsize),
        }
    }
}

impl<E: Message> fmt::Debug for PullBroker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullBroker")
            .field("len", &self.queue.len())
            .field("maxsize", &self.queue.capacity)
            .field("closed", &self.queue.is_closed())
            .finish()
    }
}

#[async_trait]
impl<E: Message> Broker<E> for PullBroker<E> {
    async fn put(
        &self,
        envelope: Envelope<E>,
        timeout: Option<Duration>,
    ) -> Result<(), MailboxError> {
        self.queue.put(envelope, timeout).await
    }

    fn try_put(&self, envelope: Envelope<E>) -> Result<(), TryPutError<Envelope<E>>> {
        self.queue.try_put(envelope)
    }

    async fn get(&self, timeout: Option<Duration>) -> Result<Envelope<E>, MailboxError> {
        self.queue.get(timeout).await
    }

    fn try_get(&self) -> Option<Envelope<E>> {
        self.queue.try_get()
    }

    fn register(&self, subscriber: Arc<dyn Subscriber<E>>) -> bool {
        tracing::warn!(
            subscriber = subscriber.name(),
            "pull broker ignores subscribers; poll get() instead"
        );
        false
    }

    async fn broadcast(&self) -> Result<usize, MailboxError> {
        Err(MailboxError::BroadcastUnsupported)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn maxsize(&self) -> usize {
        self.queue.capacity
    }

    fn close(&self) {
        self.queue.close();
    }

    fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::domain::customer::CustomerEvent;

    fn env(n: u64) -> Envelope<CustomerEvent> {
        Envelope::new(
            format!("c{n}"),
            CustomerEvent::CustomerIsPreferred {
                customer_id: format!("c{n}"),
            },
        )
    }

    /// Records the entity IDs it sees, optionally failing on each.
    struct Recorder {
        name: String,
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().expect("lock should succeed").clone()
        }
    }

    #[async_trait]
    impl Subscriber<CustomerEvent> for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn receive(&self, envelope: &Envelope<CustomerEvent>) -> Result<(), HandlerError> {
            self.seen
                .lock()
                .expect("lock should succeed")
                .push(envelope.entity_id().to_string());
            if self.fail {
                return Err("boom".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn get_is_fifo() {
        let broker = QueueBroker::unbounded();
        for n in 1..=3 {
            broker.put(env(n), None).await.expect("put should succeed");
        }
        assert_eq!(broker.len(), 3);
        for n in 1..=3 {
            let got = broker.get(None).await.expect("get should succeed");
            assert_eq!(got.entity_id(), format!("c{n}"));
        }
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn bounded_put_times_out_and_leaves_queue_unchanged() {
        let broker = QueueBroker::new(1);
        broker.put(env(1), None).await.expect("put should succeed");

        let err = broker
            .put(env(2), Some(Duration::from_millis(20)))
            .await
            .expect_err("second put must time out");
        assert!(matches!(err, MailboxError::Timeout(_)));
        assert_eq!(broker.len(), 1);
        assert_eq!(
            broker.try_get().expect("item should remain").entity_id(),
            "c1"
        );
    }

    #[tokio::test]
    async fn blocked_put_resumes_when_space_frees() {
        let broker = Arc::new(QueueBroker::new(1));
        broker.put(env(1), None).await.expect("put should succeed");

        let producer = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.put(env(2), None).await })
        };
        tokio::task::yield_now().await;
        let first = broker.get(None).await.expect("get should succeed");
        assert_eq!(first.entity_id(), "c1");

        producer
            .await
            .expect("task should join")
            .expect("blocked put should succeed");
        let second = broker.get(None).await.expect("get should succeed");
        assert_eq!(second.entity_id(), "c2");
    }

    #[tokio::test]
    async fn get_times_out_on_empty_queue() {
        let broker = QueueBroker::<CustomerEvent>::unbounded();
        let err = broker
            .get(Some(Duration::from_millis(10)))
            .await
            .expect_err("empty get must time out");
        assert!(matches!(err, MailboxError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancelled_get_loses_nothing() {
        let broker = QueueBroker::unbounded();
        {
            let pending = broker.get(None);
            let outcome = tokio::time::timeout(Duration::from_millis(10), pending).await;
            assert!(outcome.is_err(), "get should still be waiting");
        }
        broker.put(env(1), None).await.expect("put should succeed");
        let got = broker.get(None).await.expect("get should succeed");
        assert_eq!(got.entity_id(), "c1");
    }

    #[test]
    fn try_put_reports_queue_full_and_returns_message() {
        let broker = QueueBroker::new(1);
        broker.try_put(env(1)).expect("first put should succeed");
        let err = broker.try_put(env(2)).expect_err("queue is full");
        assert!(matches!(err, TryPutError::QueueFull { capacity: 1, .. }));
        assert_eq!(err.into_inner().entity_id(), "c2");
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_keeps_backlog() {
        let broker = Arc::new(QueueBroker::<CustomerEvent>::unbounded());
        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.get(None).await })
        };
        tokio::task::yield_now().await;
        broker.close();
        let err = waiter
            .await
            .expect("task should join")
            .expect_err("closed get must fail");
        assert!(matches!(err, MailboxError::Closed));

        let backlog = QueueBroker::unbounded();
        backlog.put(env(1), None).await.expect("put should succeed");
        backlog.close();
        assert!(matches!(
            backlog.put(env(2), None).await,
            Err(MailboxError::Closed)
        ));
        let drained = backlog.get(None).await.expect("backlog should drain");
        assert_eq!(drained.entity_id(), "c1");
        assert!(matches!(backlog.get(None).await, Err(MailboxError::Closed)));
    }

    #[test]
    fn register_is_idempotent() {
        let broker = QueueBroker::<CustomerEvent>::unbounded();
        let a = Recorder::new("a", false);
        assert!(broker.register(a.clone()));
        assert!(!broker.register(a));
        assert_eq!(broker.subscribers().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_delivers_in_registration_order_and_drains() {
        let broker = QueueBroker::unbounded();
        let a = Recorder::new("a", false);
        let b = Recorder::new("b", false);
        broker.register(a.clone());
        broker.register(b.clone());

        broker.put(env(1), None).await.expect("put should succeed");
        broker.put(env(2), None).await.expect("put should succeed");
        let delivered = broker.broadcast().await.expect("broadcast should succeed");

        assert_eq!(delivered, 2);
        assert!(broker.is_empty());
        assert_eq!(a.seen(), vec!["c1", "c2"]);
        assert_eq!(b.seen(), vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn broadcast_continues_past_failures_and_reports_them() {
        let broker = QueueBroker::unbounded();
        let bad = Recorder::new("bad", true);
        let good = Recorder::new("good", false);
        broker.register(bad.clone());
        broker.register(good.clone());

        broker.put(env(1), None).await.expect("put should succeed");
        broker.put(env(2), None).await.expect("put should succeed");
        let err = broker.broadcast().await.expect_err("failures must be reported");

        let MailboxError::Delivery(delivery) = err else {
            panic!("expected delivery error, got {err:?}");
        };
        assert_eq!(delivery.failures.len(), 2);
        assert_eq!(delivery.failures[0].handler, "bad");
        assert_eq!(good.seen(), vec!["c1", "c2"]);
        assert!(broker.is_empty());
    }

    /// Subscriber that registers another subscriber while receiving.
    struct Registrar {
        broker: Arc<QueueBroker<CustomerEvent>>,
        late: Arc<Recorder>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Subscriber<CustomerEvent> for Registrar {
        fn name(&self) -> &str {
            "registrar"
        }

        async fn receive(&self, _: &Envelope<CustomerEvent>) -> Result<(), HandlerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.broker.register(self.late.clone());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn late_subscriber_misses_already_dequeued_message() {
        let broker = Arc::new(QueueBroker::unbounded());
        let late = Recorder::new("late", false);
        broker.register(Arc::new(Registrar {
            broker: Arc::clone(&broker),
            late: late.clone(),
            calls: AtomicUsize::new(0),
        }));

        broker.put(env(1), None).await.expect("put should succeed");
        broker.put(env(2), None).await.expect("put should succeed");
        broker.broadcast().await.expect("broadcast should succeed");

        assert_eq!(late.seen(), vec!["c2"]);
    }

    #[tokio::test]
    async fn pull_broker_refuses_broadcast() {
        let broker = PullBroker::new(0);
        assert!(!broker.supports_broadcast());
        assert!(!broker.register(Recorder::new("a", false)));

        broker.put(env(1), None).await.expect("put should succeed");
        assert!(matches!(
            broker.broadcast().await,
            Err(MailboxError::BroadcastUnsupported)
        ));
        assert_eq!(broker.len(), 1, "queue untouched by refused broadcast");
        assert_eq!(broker.maxsize(), 0);
    }

    #[tokio::test]
    async fn concurrent_producers_and_consumers_lose_nothing() {
        let broker = Arc::new(QueueBroker::new(4));
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    for i in 0..25 {
                        broker
                            .put(env(p * 100 + i), None)
                            .await
                            .expect("put should succeed");
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    let mut got = Vec::new();
                    for _ in 0..50 {
                        got.push(
                            broker
                                .get(None)
                                .await
                                .expect("get should succeed")
                                .entity_id()
                                .to_string(),
                        );
                    }
                    got
                })
            })
            .collect();

        for p in producers {
            p.await.expect("producer should join");
        }
        let mut all = Vec::new();
        for c in consumers {
            all.extend(c.await.expect("consumer should join"));
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 100);
        assert!(broker.is_empty());
    }
}
