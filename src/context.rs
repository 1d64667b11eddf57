//! The application context: owns the event store, the mailbox, and the
//! dispatcher, and runs the load-decide-commit unit of work.
//!
//! A [`Context`] is built explicitly with a [`ContextBuilder`] and passed to
//! whoever needs it; nothing here is global. `Clone` is cheap.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::actor::{AggregateHandle, spawn_actor};
use crate::aggregate::{Aggregate, AggregateRoot};
use crate::broker::{Broker, QueueBroker, Subscriber};
use crate::command::CommandContext;
use crate::config::{Delivery, Settings};
use crate::dispatch::{Dispatcher, DispatcherBuilder, Handler};
use crate::error::{
    BuildError, ConfigError, DeliveryError, ExecuteError, MailboxError, StateError, StoreError,
    TryPutError,
};
use crate::event::{Envelope, Message, encode};
use crate::mailbox::Mailbox;
use crate::projection::{Projection, ProjectionRunner};
use crate::relay::{RelayHandle, spawn_relay};
use crate::storage::StoreLayout;
use crate::store::{EventStore, ExpectedVersion, LocalEventStore};

/// Type-erased handle cache keyed by `(TypeId, entity_id)`.
///
/// `TypeId` identifies the aggregate type at runtime; downcasting the boxed
/// value recovers the typed [`AggregateHandle`].
type HandleCache = HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>;

/// A broadcast spawned to make room on a full queue.
pub(crate) type Relief = JoinHandle<Result<usize, MailboxError>>;

/// Settles delivery of envelopes already put on the mailbox.
///
/// Object-safe and independent of the event union, so an
/// [`AggregateHandle`] can finish delivery on its caller's task.
#[async_trait]
pub(crate) trait Flush: Send + Sync {
    /// Wait for `relief` broadcasts, then broadcast what is still queued
    /// when delivery mode is `broadcast`.
    ///
    /// Handler failures from every broadcast are reported together.
    async fn flush(&self, relief: Vec<Relief>) -> Result<(), MailboxError>;
}

/// Collaborators shared by the context and every actor it spawns.
///
/// Actors hold an `Arc<Core>` rather than the whole context so that the
/// handle cache never ends up owning itself.
pub(crate) struct Core<E: Message> {
    pub(crate) store: Arc<dyn EventStore>,
    pub(crate) mailbox: Mailbox<E>,
    pub(crate) settings: Settings,
}

impl<E: Message> Core<E> {
    /// Fold any records appended since `root` was last loaded.
    pub(crate) async fn refresh<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
    ) -> Result<(), StateError> {
        let records = self
            .store
            .load_from(root.entity_id(), root.version() + 1)
            .await?;
        root.replay(&records)?;
        Ok(())
    }

    /// Drain `root`'s pending events, append them, and seal them.
    ///
    /// Nothing is put on the mailbox.
    async fn append<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
        ctx: &CommandContext,
    ) -> Result<Vec<Envelope<A::Event>>, ExecuteError<A::Error>> {
        let events = root.drain_events();
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let envelopes: Vec<Envelope<A::Event>> = events
            .into_iter()
            .map(|e| Envelope::new(root.entity_id(), e).with_context(ctx.clone()))
            .collect();
        let proposed = envelopes
            .iter()
            .map(encode)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;

        let records = self
            .store
            .append_all(
                root.entity_id(),
                ExpectedVersion::Exact(root.version()),
                proposed,
            )
            .await?;
        if let Some(last) = records.last() {
            root.set_version(last.version);
        }

        Ok(envelopes
            .into_iter()
            .zip(&records)
            .map(|(env, rec)| env.sealed(rec.version, rec.position))
            .collect())
    }

    /// Put committed envelopes on the mailbox in commit order.
    ///
    /// In broadcast mode the broadcast is the queue's only consumer, so a
    /// full queue gets a broadcast spawned to drain it before the put
    /// waits for a slot. The spawned broadcasts are returned for
    /// [`Flush::flush`] to settle.
    pub(crate) async fn enqueue<Ev>(
        &self,
        sealed: &[Envelope<Ev>],
    ) -> Result<Vec<Relief>, MailboxError>
    where
        Ev: Message + Into<E>,
    {
        let timeout = self.settings.mailbox.put_timeout();
        let broadcast = self.settings.delivery == Delivery::Broadcast;
        let mut relief = Vec::new();
        for env in sealed {
            let env = env.clone().map_payload(Into::into);
            if !broadcast {
                self.mailbox.put(env, timeout).await?;
                continue;
            }
            match self.mailbox.try_put(env) {
                Ok(()) => {}
                Err(TryPutError::QueueFull { message, capacity }) => {
                    tracing::debug!(capacity, "mailbox full, broadcasting to make room");
                    let mailbox = self.mailbox.clone();
                    relief.push(tokio::spawn(async move { mailbox.broadcast().await }));
                    self.mailbox.put(message, timeout).await?;
                }
                Err(TryPutError::Closed(_)) => return Err(MailboxError::Closed),
            }
        }
        Ok(relief)
    }

    /// Enqueue and flush `sealed`, reporting failures as
    /// [`ExecuteError::Delivery`].
    async fn deliver<Ev, D>(&self, sealed: &[Envelope<Ev>]) -> Result<(), ExecuteError<D>>
    where
        Ev: Message + Into<E>,
        D: std::error::Error + Send + Sync + 'static,
    {
        if sealed.is_empty() {
            return Ok(());
        }
        let outcome = match self.enqueue(sealed).await {
            Ok(relief) => self.flush(relief).await,
            Err(e) => Err(e),
        };
        outcome.map_err(|source| ExecuteError::Delivery {
            committed: sealed.len(),
            source,
        })
    }

    /// Append `root`'s pending events, then put them on the mailbox and
    /// broadcast if configured.
    pub(crate) async fn commit<A>(
        &self,
        root: &mut AggregateRoot<A>,
        ctx: &CommandContext,
    ) -> Result<Vec<Envelope<A::Event>>, ExecuteError<A::Error>>
    where
        A: Aggregate,
        A::Event: Into<E>,
    {
        let sealed = self.append(root, ctx).await?;
        self.deliver::<_, A::Error>(&sealed).await?;
        Ok(sealed)
    }

    /// Decide and append against `root`, retrying on concurrency conflicts.
    ///
    /// Returns the sealed envelopes without delivering them; callers
    /// enqueue and flush. `root` is only replaced once an append succeeds,
    /// so a rejected or failed command leaves it as it was (apart from
    /// catching up).
    pub(crate) async fn execute_on<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
        cmd: A::Command,
        ctx: &CommandContext,
    ) -> Result<Vec<Envelope<A::Event>>, ExecuteError<A::Error>> {
        let max_attempts = self.settings.max_retries + 1;
        let mut attempts = 0;
        loop {
            attempts += 1;
            self.refresh(root).await?;

            let mut candidate = root.clone();
            candidate
                .execute(cmd.clone())
                .map_err(ExecuteError::Domain)?;
            if candidate.pending().is_empty() {
                return Ok(Vec::new());
            }

            match self.append(&mut candidate, ctx).await {
                Ok(sealed) => {
                    *root = candidate;
                    return Ok(sealed);
                }
                Err(ExecuteError::Store(StoreError::ConcurrencyConflict { actual, .. })) => {
                    if attempts >= max_attempts {
                        return Err(ExecuteError::Conflict {
                            entity_id: root.entity_id().to_owned(),
                            attempts,
                        });
                    }
                    tracing::warn!(
                        entity_id = root.entity_id(),
                        attempt = attempts,
                        actual,
                        "concurrency conflict, reloading"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<E: Message> Flush for Core<E> {
    async fn flush(&self, relief: Vec<Relief>) -> Result<(), MailboxError> {
        let mut outcomes = Vec::with_capacity(relief.len() + 1);
        for task in relief {
            match task.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                // Cancelled: the runtime is shutting down.
                Err(_) => {}
            }
        }
        if self.settings.delivery == Delivery::Broadcast {
            outcomes.push(self.mailbox.broadcast().await);
        }

        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(_) => {}
                Err(MailboxError::Delivery(e)) => failures.extend(e.failures),
                Err(e) => return Err(e),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DeliveryError { failures }.into())
        }
    }
}

/// Explicitly constructed application context.
///
/// Generic over `E`, the application-wide event union that flows through
/// the mailbox and dispatcher. Each aggregate's events must convert into it
/// (`A::Event: Into<E>`).
///
/// # Examples
///
/// ```
/// use askeda::{CommandContext, Context};
/// use askeda::domain::AppEvent;
/// use askeda::domain::customer::{Customer, CustomerCommand};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let ctx = Context::<AppEvent>::builder().build()?;
/// ctx.execute::<Customer>(
///     "c1",
///     CustomerCommand::Create { customer_id: "c1".into(), name: "Ada".into() },
///     CommandContext::default(),
/// )
/// .await?;
///
/// let root = ctx.load::<Customer>("c1").await?;
/// assert_eq!(root.version(), 1);
/// # Ok(())
/// # }
/// ```
pub struct Context<E: Message> {
    core: Arc<Core<E>>,
    dispatcher: Arc<Dispatcher<E>>,
    cache: Arc<tokio::sync::RwLock<HandleCache>>,
    /// Flipped to `true` by [`Context::shutdown`]; every actor watches it.
    shutdown_tx: Arc<watch::Sender<bool>>,
    relay: Arc<tokio::sync::Mutex<Option<RelayHandle>>>,
}

impl<E: Message> Clone for Context<E> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            dispatcher: Arc::clone(&self.dispatcher),
            cache: Arc::clone(&self.cache),
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            relay: Arc::clone(&self.relay),
        }
    }
}

// Manual `Debug` because `dyn Any` is not `Debug` and we don't want to
// expose cache internals.
impl<E: Message> fmt::Debug for Context<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("project_name", &self.core.settings.project_name)
            .field("delivery", &self.core.settings.delivery)
            .field("mailbox", &self.core.mailbox)
            .finish_non_exhaustive()
    }
}

impl<E: Message> Context<E> {
    /// Start building a context.
    pub fn builder() -> ContextBuilder<E> {
        ContextBuilder::new()
    }

    /// The event store.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.core.store
    }

    /// The mailbox committed events are published to.
    pub fn mailbox(&self) -> &Mailbox<E> {
        &self.core.mailbox
    }

    /// The dispatcher handling published events.
    pub fn dispatcher(&self) -> &Arc<Dispatcher<E>> {
        &self.dispatcher
    }

    /// The settings this context was built with.
    pub fn settings(&self) -> &Settings {
        &self.core.settings
    }

    /// Rehydrate an aggregate from its stored history.
    ///
    /// An entity with no history comes back fresh at version 0.
    ///
    /// # Errors
    ///
    /// [`StateError::Store`] if loading fails, [`StateError::UnknownEvent`]
    /// if the history holds an event `A` does not recognize.
    pub async fn load<A: Aggregate>(&self, entity_id: &str) -> Result<AggregateRoot<A>, StateError> {
        let records = self.core.store.load(entity_id).await?;
        Ok(AggregateRoot::rehydrate(entity_id, &records)?)
    }

    /// Commit `root`'s pending events.
    ///
    /// Drains the pending events, appends them expecting the stream to be at
    /// `root.version()`, seals them with their assigned versions, puts them
    /// on the mailbox, and broadcasts when delivery mode is `broadcast`.
    /// The sealed envelopes are returned.
    ///
    /// Pending events are drained even if the append fails; reload the
    /// aggregate and run the operation again in that case.
    ///
    /// # Errors
    ///
    /// - [`ExecuteError::Store`] with a concurrency conflict if the stream
    ///   moved since `root` was loaded. Nothing was written.
    /// - [`ExecuteError::Delivery`] if the events were appended but putting
    ///   them on the mailbox or broadcasting failed. Do not retry.
    pub async fn commit<A>(
        &self,
        root: &mut AggregateRoot<A>,
        ctx: &CommandContext,
    ) -> Result<Vec<Envelope<A::Event>>, ExecuteError<A::Error>>
    where
        A: Aggregate,
        A::Event: Into<E>,
    {
        self.core.commit(root, ctx).await
    }

    /// Load, decide, and commit `cmd` as one unit of work.
    ///
    /// On a concurrency conflict the aggregate is reloaded and the command
    /// decided again, up to `settings.max_retries` extra times.
    ///
    /// # Errors
    ///
    /// - [`ExecuteError::Domain`] if the aggregate rejected the command.
    /// - [`ExecuteError::Conflict`] once retries are exhausted.
    /// - [`ExecuteError::Delivery`] if events were committed but not
    ///   delivered.
    /// - [`ExecuteError::Store`] / [`ExecuteError::UnknownEvent`] otherwise.
    pub async fn execute<A>(
        &self,
        entity_id: &str,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<Vec<Envelope<A::Event>>, ExecuteError<A::Error>>
    where
        A: Aggregate,
        A::Event: Into<E>,
    {
        let span = tracing::info_span!(
            "execute",
            project = %self.core.settings.project_name,
            aggregate_type = A::AGGREGATE_TYPE,
            entity_id,
        );
        async {
            let mut root = AggregateRoot::<A>::new(entity_id);
            let sealed = self.core.execute_on(&mut root, cmd, &ctx).await?;
            self.core.deliver::<_, A::Error>(&sealed).await?;
            Ok::<_, ExecuteError<A::Error>>(sealed)
        }
        .instrument(span)
        .await
    }

    /// Get a handle to the actor owning `entity_id`, spawning it if needed.
    ///
    /// Handles are cached; an actor that shut down after its idle timeout is
    /// transparently respawned and rehydrated.
    ///
    /// # Errors
    ///
    /// [`StateError`] if rehydrating a newly spawned actor fails.
    pub async fn actor<A>(&self, entity_id: &str) -> Result<AggregateHandle<A>, StateError>
    where
        A: Aggregate,
        A::Event: Into<E>,
    {
        let key = (TypeId::of::<A>(), entity_id.to_owned());

        // Fast path: check cache with read lock.
        {
            let cache = self.cache.read().await;
            if let Some(boxed) = cache.get(&key)
                && let Some(handle) = boxed.downcast_ref::<AggregateHandle<A>>()
                && handle.is_alive()
            {
                return Ok(handle.clone());
            }
        }

        // Slow path under the write lock so two callers cannot both spawn.
        let mut cache = self.cache.write().await;
        if let Some(boxed) = cache.get(&key)
            && let Some(handle) = boxed.downcast_ref::<AggregateHandle<A>>()
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            entity_id,
            "spawning actor"
        );
        let handle = spawn_actor::<A, E>(
            Arc::clone(&self.core),
            entity_id,
            self.shutdown_tx.subscribe(),
        )
        .await?;
        cache.insert(key, Box::new(handle.clone()));
        Ok(handle)
    }

    /// Start the background relay that pumps the mailbox into the
    /// dispatcher. Calling it again returns the running relay's handle.
    pub async fn start_relay(&self) -> RelayHandle {
        let mut slot = self.relay.lock().await;
        if let Some(handle) = slot.as_ref()
            && handle.is_running()
        {
            return handle.clone();
        }
        let handle = spawn_relay(self.core.mailbox.clone(), Arc::clone(&self.dispatcher));
        *slot = Some(handle.clone());
        handle
    }

    /// A projection runner for `P`, checkpointed under the store's data
    /// directory when one is configured.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] if an existing checkpoint cannot be read.
    pub fn projection<P: Projection>(&self) -> Result<ProjectionRunner<P>, StoreError> {
        match &self.core.settings.store.data_dir {
            Some(dir) => ProjectionRunner::with_checkpoint_dir(
                StoreLayout::new(dir).projection_dir(P::NAME),
            ),
            None => Ok(ProjectionRunner::new()),
        }
    }

    /// Stop the relay (waiting for its in-flight message) and every actor.
    ///
    /// Queued messages stay on the mailbox. Actors requested after shutdown
    /// are born stopped and answer with `ActorGone`. Safe to call more than
    /// once.
    pub async fn shutdown(&self) {
        let relay = self.relay.lock().await.take();
        if let Some(relay) = relay
            && let Err(e) = relay.shutdown().await
        {
            tracing::error!(error = %e, "relay task failed");
        }

        self.shutdown_tx.send_replace(true);
        let actors = {
            let mut cache = self.cache.write().await;
            let n = cache.len();
            cache.clear();
            n
        };
        tracing::info!(
            project = %self.core.settings.project_name,
            actors,
            "context shut down"
        );
    }
}

/// Builder for a [`Context`].
pub struct ContextBuilder<E: Message> {
    settings: Settings,
    store: Option<Arc<dyn EventStore>>,
    broker: Option<Arc<dyn Broker<E>>>,
    routes: DispatcherBuilder<E>,
}

impl<E: Message> Default for ContextBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Message> ContextBuilder<E> {
    /// Default settings, in-memory store, unbounded push broker, no handlers.
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            store: None,
            broker: None,
            routes: DispatcherBuilder::new(),
        }
    }

    /// Use `settings` instead of the defaults.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Use `store` instead of the one described by `settings.store`.
    pub fn store(mut self, store: impl EventStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Use `broker` instead of a [`QueueBroker`] sized by
    /// `settings.mailbox.capacity`.
    pub fn broker(mut self, broker: impl Broker<E> + 'static) -> Self {
        self.broker = Some(Arc::new(broker));
        self
    }

    /// Route `kind` to `handler`. See [`DispatcherBuilder::on`].
    pub fn on(mut self, kind: impl Into<E::Kind>, handler: impl Handler<E> + 'static) -> Self {
        self.routes = self.routes.on(kind, handler);
        self
    }

    /// Route `kind` to a shared handler. See [`DispatcherBuilder::on_shared`].
    pub fn on_shared(mut self, kind: impl Into<E::Kind>, handler: Arc<dyn Handler<E>>) -> Self {
        self.routes = self.routes.on_shared(kind, handler);
        self
    }

    /// Validate the configuration and wire the collaborators together.
    ///
    /// In `broadcast` delivery mode the dispatcher is registered as a
    /// mailbox subscriber.
    ///
    /// # Errors
    ///
    /// - [`BuildError::Config`] if the settings are invalid or ask for
    ///   broadcast delivery over a pull-only broker.
    /// - [`BuildError::Store`] if the persistent store cannot be opened.
    pub fn build(self) -> Result<Context<E>, BuildError> {
        let settings = self.settings;
        settings.validate()?;

        let broker: Arc<dyn Broker<E>> = match self.broker {
            Some(broker) => broker,
            None => Arc::new(QueueBroker::new(settings.mailbox.capacity)),
        };
        if settings.delivery == Delivery::Broadcast && !broker.supports_broadcast() {
            return Err(ConfigError::Invalid(
                "delivery = \"broadcast\" needs a push broker; use \"relay\" with a pull broker"
                    .into(),
            )
            .into());
        }

        let store: Arc<dyn EventStore> = match (self.store, &settings.store.data_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(LocalEventStore::open(dir)?),
            (None, None) => Arc::new(LocalEventStore::in_memory()),
        };

        let dispatcher = Arc::new(self.routes.strict(settings.dispatch.strict).build());
        let mailbox = Mailbox::from_arc(broker);
        if settings.delivery == Delivery::Broadcast {
            let subscriber: Arc<dyn Subscriber<E>> = dispatcher.clone();
            mailbox.register(subscriber);
        }

        tracing::debug!(
            project = %settings.project_name,
            delivery = ?settings.delivery,
            volume = mailbox.volume(),
            "context built"
        );

        Ok(Context {
            core: Arc::new(Core {
                store,
                mailbox,
                settings,
            }),
            dispatcher,
            cache: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            shutdown_tx: Arc::new(watch::channel(false).0),
            relay: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }
}
