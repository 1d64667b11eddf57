//! Event-sourced aggregates, an append-only event store with optimistic
//! concurrency, and mailbox-based event dispatch.
//!
//! The pieces, bottom-up:
//!
//! - [`Envelope`], [`encode`] and [`decode`] wrap and persist messages.
//! - [`AggregateRoot`] records pending events for an [`Aggregate`].
//! - [`EventStore`] appends them atomically per entity and rejects stale
//!   writers with a concurrency conflict; [`LocalEventStore`] is the
//!   in-memory or JSON-lines backed implementation.
//! - [`Mailbox`] queues committed events over a pluggable [`Broker`] and
//!   broadcasts them to [`Subscriber`]s, one broadcast at a time.
//! - [`Dispatcher`] routes each event to the [`Handler`]s registered for
//!   its variant.
//! - [`Context`] wires all of the above from [`Settings`] and runs the
//!   load-decide-commit unit of work, with per-entity actors
//!   ([`AggregateHandle`]), a background [`RelayHandle`], and checkpointed
//!   [`ProjectionRunner`]s on top.

mod actor;
mod aggregate;
mod broker;
mod command;
mod config;
mod context;
mod dispatch;
pub mod domain;
mod error;
mod event;
mod mailbox;
mod projection;
mod relay;
mod storage;
mod store;

pub use actor::AggregateHandle;
pub use aggregate::{Aggregate, AggregateRoot};
pub use broker::{Broker, PullBroker, QueueBroker, Subscriber};
pub use command::CommandContext;
pub use config::{
    ActorSettings, Delivery, DispatchSettings, MailboxSettings, Settings, StoreSettings,
};
pub use context::{Context, ContextBuilder};
pub use dispatch::{Dispatcher, DispatcherBuilder, FnHandler, Handler, handler_fn};
pub use error::{
    BuildError, ConfigError, DeliveryError, DispatchError, ExecuteError, HandlerError,
    HandlerFailure, MailboxError, StateError, StoreError, TryPutError, UnknownEventError,
};
pub use event::{DomainEvent, Envelope, EventRecord, Message, ProposedEvent, decode, encode};
pub use mailbox::Mailbox;
pub use projection::{Projection, ProjectionRunner};
pub use relay::RelayHandle;
pub use storage::StoreLayout;
pub use store::{EventStore, ExpectedVersion, LocalEventStore};
