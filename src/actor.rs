//! Actor loop that owns one aggregate instance and processes its commands.
//!
//! The actor runs as a tokio task and handles messages from an `mpsc`
//! channel one at a time, so commands for the same entity never interleave
//! inside the process. It keeps the rehydrated [`AggregateRoot`] warm between
//! commands and catches up on records written by anyone else before each
//! decision, so the store's optimistic check stays the real arbiter.
//!
//! Public API: [`AggregateHandle`] (cloneable async handle), obtained from
//! [`Context::actor`](crate::Context::actor).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::command::CommandContext;
use crate::context::{Core, Flush, Relief};
use crate::error::{ExecuteError, StateError};
use crate::event::{Envelope, Message};

/// Bound of the command channel between handles and the actor.
const MAILBOX_DEPTH: usize = 32;

/// Result type of [`AggregateHandle::execute`].
type ExecuteResult<A> = Result<
    Vec<Envelope<<A as Aggregate>::Event>>,
    ExecuteError<<A as Aggregate>::Error>,
>;

/// Sent back through the `Execute` reply channel: the sealed envelopes,
/// already on the mailbox, plus any broadcasts spawned to make room there.
type Enqueued<A> = Result<
    (Vec<Envelope<<A as Aggregate>::Event>>, Vec<Relief>),
    ExecuteError<<A as Aggregate>::Error>,
>;

/// Messages sent from `AggregateHandle` to the actor loop.
///
/// Each variant carries a `oneshot::Sender` for the actor to reply on
/// once the operation completes.
pub(crate) enum ActorMessage<A: Aggregate> {
    /// Execute a command against the aggregate.
    Execute {
        /// The domain command to execute.
        cmd: A::Command,
        /// Cross-cutting metadata (actor identity, correlation ID, etc.).
        ctx: CommandContext,
        /// Channel to send back the enqueued envelopes or an error.
        reply: oneshot::Sender<Enqueued<A>>,
    },

    /// Retrieve the current aggregate state.
    GetState {
        /// Channel to send back a clone of the current state or an error.
        reply: oneshot::Sender<Result<A, StateError>>,
    },

    /// Stop the loop after the messages already queued ahead of this one.
    Shutdown,
}

/// Runs the aggregate actor loop.
///
/// The loop exits when the channel closes (all handles dropped), a
/// `Shutdown` message arrives, the context signals shutdown, or the idle
/// timeout elapses with no messages.
///
/// # Arguments
///
/// * `core` - Store, mailbox, and settings shared with the context.
/// * `root` - The rehydrated aggregate this actor owns.
/// * `rx` - Receiving end of the channel carrying `ActorMessage`s.
/// * `shutdown_rx` - Context-wide shutdown flag.
/// * `idle_timeout` - How long to wait for a message before exiting.
async fn run_actor<A, E>(
    core: Arc<Core<E>>,
    mut root: AggregateRoot<A>,
    mut rx: mpsc::Receiver<ActorMessage<A>>,
    mut shutdown_rx: watch::Receiver<bool>,
    idle_timeout: Duration,
) where
    A: Aggregate,
    A::Event: Into<E>,
    E: Message,
{
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let msg = tokio::select! {
            biased;
            // Either a shutdown signal or the context went away.
            _ = shutdown_rx.changed() => break,
            msg = tokio::time::timeout(idle_timeout, rx.recv()) => msg,
        };

        match msg {
            Ok(Some(ActorMessage::Execute { cmd, ctx, reply })) => {
                let span = tracing::info_span!(
                    "execute",
                    aggregate_type = A::AGGREGATE_TYPE,
                    entity_id = root.entity_id(),
                );
                // Broadcasting runs on the caller's task after the reply, so
                // handlers may send commands back to this actor.
                let result = async {
                    let sealed = core.execute_on(&mut root, cmd, &ctx).await?;
                    let relief = core.enqueue(&sealed).await.map_err(|source| {
                        ExecuteError::Delivery {
                            committed: sealed.len(),
                            source,
                        }
                    })?;
                    Ok::<_, ExecuteError<A::Error>>((sealed, relief))
                }
                .instrument(span.clone())
                .await;
                if let Ok((sealed, _)) = &result
                    && !sealed.is_empty()
                {
                    tracing::info!(
                        parent: &span,
                        count = sealed.len(),
                        version = root.version(),
                        "events committed"
                    );
                }
                // The caller may have stopped waiting; nothing to do then.
                let _ = reply.send(result);
            }
            Ok(Some(ActorMessage::GetState { reply })) => {
                let result = core
                    .refresh(&mut root)
                    .await
                    .map(|()| root.state().clone());
                let _ = reply.send(result);
            }
            Ok(Some(ActorMessage::Shutdown)) | Ok(None) => break,
            Err(_elapsed) => {
                tracing::info!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    entity_id = root.entity_id(),
                    "actor idle, shutting down"
                );
                break;
            }
        }
    }
    tracing::debug!(
        aggregate_type = A::AGGREGATE_TYPE,
        entity_id = root.entity_id(),
        version = root.version(),
        "actor stopped"
    );
}

/// Async handle to a running aggregate actor.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the actor
/// task over a bounded channel.
///
/// # Type Parameters
///
/// * `A` - The [`Aggregate`] type this handle controls.
pub struct AggregateHandle<A: Aggregate> {
    sender: mpsc::Sender<ActorMessage<A>>,
    entity_id: Arc<str>,
    /// Finishes delivery of what the actor enqueued.
    flush: Arc<dyn Flush>,
}

// Manual `Clone`: the derive would bound on `A` instead of the fields.
impl<A: Aggregate> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            entity_id: Arc::clone(&self.entity_id),
            flush: Arc::clone(&self.flush),
        }
    }
}

impl<A: Aggregate> fmt::Debug for AggregateHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateHandle")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("entity_id", &self.entity_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    /// Send a command to the aggregate and wait for the result.
    ///
    /// The actor appends the events and puts them on the mailbox; in
    /// `broadcast` mode the broadcast then runs on the calling task. A
    /// handler may therefore execute further commands on this same handle.
    ///
    /// # Arguments
    ///
    /// * `cmd` - The domain command to execute against the aggregate.
    /// * `ctx` - Cross-cutting metadata (actor identity, correlation ID, etc.).
    ///
    /// # Returns
    ///
    /// The sealed envelopes of the events the command produced (possibly
    /// none).
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] -- the aggregate rejected the command.
    /// * [`ExecuteError::Conflict`] -- concurrency retries were exhausted.
    /// * [`ExecuteError::Delivery`] -- committed, but publishing failed.
    /// * [`ExecuteError::ActorGone`] -- the actor task has exited.
    pub async fn execute(&self, cmd: A::Command, ctx: CommandContext) -> ExecuteResult<A> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Execute {
                cmd,
                ctx,
                reply: tx,
            })
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        let (sealed, relief) = rx.await.map_err(|_| ExecuteError::ActorGone)??;
        if !sealed.is_empty() {
            self.flush
                .flush(relief)
                .await
                .map_err(|source| ExecuteError::Delivery {
                    committed: sealed.len(),
                    source,
                })?;
        }
        Ok(sealed)
    }

    /// Read the current aggregate state, caught up with the store.
    ///
    /// # Errors
    ///
    /// * [`StateError::Store`] / [`StateError::UnknownEvent`] -- catching up
    ///   failed.
    /// * [`StateError::ActorGone`] -- the actor task has exited.
    pub async fn state(&self) -> Result<A, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ActorGone)?
    }

    /// Ask the actor to stop once the messages ahead of this one are done.
    ///
    /// Does nothing if the actor has already exited.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown).await;
    }

    /// The entity this actor owns.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Check whether the actor backing this handle is still running.
    ///
    /// Returns `false` once the actor has exited (idle timeout or shutdown).
    /// The context uses this to evict stale handles from its cache and
    /// respawn the actor on the next request.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Rehydrate `entity_id` and start an actor task owning it.
///
/// # Errors
///
/// [`StateError`] if the history cannot be loaded or applied.
pub(crate) async fn spawn_actor<A, E>(
    core: Arc<Core<E>>,
    entity_id: &str,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<AggregateHandle<A>, StateError>
where
    A: Aggregate,
    A::Event: Into<E>,
    E: Message,
{
    let records = core.store.load(entity_id).await?;
    let root = AggregateRoot::<A>::rehydrate(entity_id, &records)?;
    let idle_timeout = core.settings.actor.idle_timeout();
    let (tx, rx) = mpsc::channel::<ActorMessage<A>>(MAILBOX_DEPTH);
    let flush: Arc<dyn Flush> = core.clone();

    tokio::spawn(run_actor::<A, E>(core, root, rx, shutdown_rx, idle_timeout));

    Ok(AggregateHandle {
        sender: tx,
        entity_id: Arc::from(entity_id),
        flush,
    })
}
