//! Aggregate trait and the [`AggregateRoot`] wrapper that tracks version and
//! pending events.

use crate::error::UnknownEventError;
use crate::event::{DomainEvent, EventRecord, decode};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through the [`apply`](Aggregate::apply) method.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O, no side effects.
///   It validates a command against the current state and returns zero or more events.
///   A command that would violate a domain invariant in an idempotent way (doing
///   what is already done) returns `Ok(vec![])` rather than an error, so replays
///   and retries stay safe.
/// - [`apply`](Aggregate::apply) must be a pure, total function over
///   `Self::Event`. Unrecognized stored events never reach it: decoding fails
///   first with [`UnknownEventError`].
pub trait Aggregate: Default + Clone + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. "customer").
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Clone + Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type Event: DomainEvent;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::Event) -> Self;
}

/// An aggregate instance with its identity, version, and unpublished events.
///
/// The root never performs I/O. Business operations record events here; the
/// collaborator that owns persistence drains them exactly once at commit time
/// (see [`Context::commit`](crate::Context::commit)).
///
/// Callers serialize access per entity.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    entity_id: String,
    state: A,
    version: u64,
    pending: Vec<A::Event>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A fresh aggregate with default state and no history.
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: A::default(),
            version: 0,
            pending: Vec::new(),
        }
    }

    /// Rebuild an aggregate by folding its stored history in version order.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownEventError`] on the first record `A::Event` cannot
    /// represent. Nothing is skipped.
    pub fn rehydrate<'a>(
        entity_id: impl Into<String>,
        records: impl IntoIterator<Item = &'a EventRecord>,
    ) -> Result<Self, UnknownEventError> {
        let mut root = Self::new(entity_id);
        root.replay(records)?;
        Ok(root)
    }

    /// Fold further stored records into this aggregate.
    ///
    /// Records at or below the current version are ignored, so callers may
    /// pass an overlapping suffix of the history.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownEventError`] on the first record `A::Event` cannot
    /// represent; the aggregate keeps the records applied before it.
    pub fn replay<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a EventRecord>,
    ) -> Result<(), UnknownEventError> {
        for record in records {
            if record.version <= self.version {
                continue;
            }
            let envelope = decode::<A::Event>(record)?;
            self.state = std::mem::take(&mut self.state).apply(envelope.payload());
            self.version = record.version;
        }
        Ok(())
    }

    /// Run a business operation: decide, apply, and record the resulting events.
    ///
    /// Returns the events that were recorded (possibly none).
    ///
    /// # Errors
    ///
    /// Returns the aggregate's domain error; state and pending events are
    /// untouched in that case.
    pub fn execute(&mut self, cmd: A::Command) -> Result<&[A::Event], A::Error> {
        let events = self.state.handle(cmd)?;
        let start = self.pending.len();
        for event in events {
            self.record(event);
        }
        Ok(&self.pending[start..])
    }

    /// Apply an event to the state and append it to the pending list.
    pub fn record(&mut self, event: A::Event) {
        self.state = std::mem::take(&mut self.state).apply(&event);
        self.pending.push(event);
    }

    /// Remove and return all pending events.
    pub fn drain_events(&mut self) -> Vec<A::Event> {
        std::mem::take(&mut self.pending)
    }

    /// Events recorded since the last drain.
    pub fn pending(&self) -> &[A::Event] {
        &self.pending
    }

    /// The aggregate's identity.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Current business state, including pending events.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Version of the last persisted event folded into this aggregate.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Advance the version after the pending events were appended.
    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
