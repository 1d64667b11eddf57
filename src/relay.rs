//! Background relay that pumps the mailbox into the dispatcher.
//!
//! Used with `delivery = "relay"` (and any pull-style broker): commits only
//! enqueue, and this loop takes messages off the mailbox one at a time and
//! publishes each through the [`Dispatcher`]. Handler failures are logged
//! and counted against the message; they never stop the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tokio::task::JoinError;

use crate::dispatch::Dispatcher;
use crate::error::MailboxError;
use crate::event::Message;
use crate::mailbox::Mailbox;

/// Handle for controlling a running relay.
///
/// Dropping the handle does **not** stop the relay. Call
/// [`shutdown`](RelayHandle::shutdown) to stop it after the message it is
/// currently delivering.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct RelayHandle {
    /// Sends `true` to signal the loop to stop.
    shutdown_tx: Arc<watch::Sender<bool>>,
    /// Messages taken off the mailbox and published, failed or not.
    delivered: Arc<AtomicU64>,
    /// The spawned background task. Wrapped in `Option` so it can be
    /// taken and awaited exactly once by [`shutdown`](RelayHandle::shutdown).
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("delivered", &self.delivered())
            .field("running", &self.is_running())
            .finish()
    }
}

impl RelayHandle {
    /// Number of messages the relay has published so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    /// Returns `false` once the relay has been told to stop or its task
    /// ended because the mailbox closed.
    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow() && self.shutdown_tx.receiver_count() > 0
    }

    /// Signal the relay to stop and wait for it to finish.
    ///
    /// A message already taken off the mailbox is published before the
    /// loop exits; everything still queued stays on the mailbox.
    ///
    /// Calling `shutdown` more than once is safe -- subsequent calls
    /// return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns the [`JoinError`] if the relay task panicked.
    pub async fn shutdown(&self) -> Result<(), JoinError> {
        self.shutdown_tx.send_replace(true);

        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle.await,
            None => Ok(()),
        }
    }
}

/// Spawn the relay loop for `mailbox` on the current runtime.
pub(crate) fn spawn_relay<E: Message>(
    mailbox: Mailbox<E>,
    dispatcher: Arc<Dispatcher<E>>,
) -> RelayHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let delivered = Arc::new(AtomicU64::new(0));
    let task = tokio::spawn(run_relay(
        mailbox,
        dispatcher,
        Arc::clone(&delivered),
        shutdown_rx,
    ));
    RelayHandle {
        shutdown_tx: Arc::new(shutdown_tx),
        delivered,
        task: Arc::new(tokio::sync::Mutex::new(Some(task))),
    }
}

/// Run the relay loop until shutdown is signaled or the mailbox closes.
///
/// # Arguments
///
/// * `mailbox` - Source of published messages.
/// * `dispatcher` - Routes each message to its handlers.
/// * `delivered` - Counter bumped after every published message.
/// * `shutdown_rx` - Watch receiver that signals the loop to stop.
async fn run_relay<E: Message>(
    mailbox: Mailbox<E>,
    dispatcher: Arc<Dispatcher<E>>,
    delivered: Arc<AtomicU64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::info!(volume = mailbox.volume(), "relay started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // `get` is cancel-safe: losing the race to shutdown leaves the
        // message on the mailbox.
        let envelope = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            got = mailbox.get(None) => got,
        };

        match envelope {
            Ok(envelope) => {
                if let Err(e) = dispatcher.publish(&envelope).await {
                    tracing::error!(
                        message_type = envelope.message_type(),
                        entity_id = envelope.entity_id(),
                        version = envelope.version(),
                        error = %e,
                        "relay: delivery failed"
                    );
                }
                delivered.fetch_add(1, Ordering::AcqRel);
            }
            Err(MailboxError::Closed) => {
                tracing::info!("relay: mailbox closed");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "relay: get failed");
                break;
            }
        }
    }

    tracing::info!(
        delivered = delivered.load(Ordering::Acquire),
        "relay stopped"
    );
}
