//! Routing of published messages to handlers by variant tag.
//!
//! A [`Dispatcher`] is built once from a [`DispatcherBuilder`] and is
//! immutable afterwards. It is itself a [`Subscriber`], so it can sit on a
//! mailbox and receive every broadcast message.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::Subscriber;
use crate::error::{DeliveryError, DispatchError, HandlerError, HandlerFailure};
use crate::event::{Envelope, Message};

/// Reacts to one kind of published message.
///
/// Handlers run on the publishing task and are awaited to completion before
/// `publish` returns.
#[async_trait]
pub trait Handler<E: Message>: Send + Sync {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str;

    /// Handle one message.
    async fn handle(&self, envelope: &Envelope<E>) -> Result<(), HandlerError>;
}

/// A [`Handler`] built from a closure with [`handler_fn`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Adapt an async closure into a [`Handler`].
///
/// The closure receives its own copy of the envelope, so the returned future
/// need not borrow from the caller.
///
/// # Examples
///
/// ```
/// use askeda::{Dispatcher, Envelope, HandlerError, handler_fn};
/// use askeda::domain::customer::{CustomerEvent, CustomerEventKind};
///
/// let dispatcher = Dispatcher::<CustomerEvent>::builder()
///     .on(
///         CustomerEventKind::CustomerIsPreferred,
///         handler_fn("welcome", |env: Envelope<CustomerEvent>| async move {
///             println!("{} is preferred", env.entity_id());
///             Ok::<(), HandlerError>(())
///         }),
///     )
///     .build();
/// assert!(dispatcher.handles(CustomerEventKind::CustomerIsPreferred));
/// ```
pub fn handler_fn<E, F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    E: Message,
    F: Fn(Envelope<E>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<E, F, Fut> Handler<E> for FnHandler<F>
where
    E: Message,
    F: Fn(Envelope<E>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, envelope: &Envelope<E>) -> Result<(), HandlerError> {
        (self.f)(envelope.clone()).await
    }
}

/// Immutable table from message variant to handlers.
pub struct Dispatcher<E: Message> {
    routes: HashMap<E::Kind, Vec<Arc<dyn Handler<E>>>>,
    strict: bool,
}

impl<E: Message> fmt::Debug for Dispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("kinds", &self.routes.keys().collect::<Vec<_>>())
            .field("strict", &self.strict)
            .finish()
    }
}

impl<E: Message> Dispatcher<E> {
    /// Start building a dispatcher.
    pub fn builder() -> DispatcherBuilder<E> {
        DispatcherBuilder::new()
    }

    /// Returns `true` if at least one handler is registered for `kind`.
    pub fn handles(&self, kind: impl Into<E::Kind>) -> bool {
        self.routes.contains_key(&kind.into())
    }

    /// Whether unhandled messages are reported instead of dropped.
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Run every handler registered for the envelope's variant, in
    /// registration order, and return how many ran.
    ///
    /// A failing handler does not stop the ones after it; all failures are
    /// returned together once every handler has run.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Failed`] if any handler failed.
    /// - [`DispatchError::Unhandled`] in strict mode when nothing is
    ///   registered for the variant. Otherwise such a message is dropped.
    pub async fn publish(&self, envelope: &Envelope<E>) -> Result<usize, DispatchError> {
        let Some(handlers) = self.routes.get(&envelope.kind()) else {
            if self.strict {
                return Err(DispatchError::Unhandled {
                    message_type: envelope.message_type().to_string(),
                });
            }
            tracing::debug!(
                message_type = envelope.message_type(),
                entity_id = envelope.entity_id(),
                "no handler registered, message dropped"
            );
            return Ok(0);
        };

        let mut failures = Vec::new();
        for handler in handlers {
            if let Err(e) = handler.handle(envelope).await {
                tracing::error!(
                    handler = handler.name(),
                    message_type = envelope.message_type(),
                    entity_id = envelope.entity_id(),
                    version = envelope.version(),
                    error = %e,
                    "handler failed"
                );
                failures.push(HandlerFailure {
                    handler: handler.name().to_string(),
                    message_type: envelope.message_type().to_string(),
                    error: e.to_string(),
                });
            }
        }

        if failures.is_empty() {
            Ok(handlers.len())
        } else {
            Err(DeliveryError { failures }.into())
        }
    }
}

#[async_trait]
impl<E: Message> Subscriber<E> for Dispatcher<E> {
    fn name(&self) -> &str {
        "dispatcher"
    }

    async fn receive(&self, envelope: &Envelope<E>) -> Result<(), HandlerError> {
        self.publish(envelope).await?;
        Ok(())
    }
}

/// Collects routes for a [`Dispatcher`].
pub struct DispatcherBuilder<E: Message> {
    routes: HashMap<E::Kind, Vec<Arc<dyn Handler<E>>>>,
    strict: bool,
}

impl<E: Message> Default for DispatcherBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Message> DispatcherBuilder<E> {
    /// An empty, non-strict builder.
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            strict: false,
        }
    }

    /// Route `kind` to `handler`. Several handlers may share a kind; they run
    /// in the order they were added.
    pub fn on(self, kind: impl Into<E::Kind>, handler: impl Handler<E> + 'static) -> Self {
        self.on_shared(kind, Arc::new(handler))
    }

    /// Like [`on`](DispatcherBuilder::on), for a handler shared between
    /// several kinds.
    pub fn on_shared(mut self, kind: impl Into<E::Kind>, handler: Arc<dyn Handler<E>>) -> Self {
        self.routes.entry(kind.into()).or_default().push(handler);
        self
    }

    /// Report messages that have no handler as [`DispatchError::Unhandled`].
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Freeze the routing table.
    pub fn build(self) -> Dispatcher<E> {
        Dispatcher {
            routes: self.routes,
            strict: self.strict,
        }
    }
}
