//! Crate-level error types for storage, delivery, dispatch, and command execution.

use std::fmt;
use std::time::Duration;

use crate::store::ExpectedVersion;

/// Boxed error returned by handlers and subscribers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by an [`EventStore`](crate::EventStore) operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The caller's expected version no longer matches the stream.
    ///
    /// Recoverable by reloading the aggregate and retrying the operation.
    /// The store never retries on its own.
    #[error(
        "concurrency conflict on entity '{entity_id}': expected {expected}, stream is at version {actual}"
    )]
    ConcurrencyConflict {
        /// Entity whose stream was contended.
        entity_id: String,
        /// The version the caller expected.
        expected: ExpectedVersion,
        /// The version the stream was actually at.
        actual: u64,
    },

    /// A batch contained an event addressed to a different entity.
    #[error("event for entity '{found}' submitted in a batch for '{entity_id}'")]
    ForeignEvent {
        /// Entity the batch was submitted for.
        entity_id: String,
        /// Entity named by the offending event.
        found: String,
    },

    /// Disk I/O failure in a persistent backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An event could not be encoded into, or decoded from, its stored form.
    #[error("event codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A line of the on-disk log is unreadable.
    #[error("corrupt event log at line {line}: {reason}")]
    Corrupt {
        /// One-based line number in the log file.
        line: usize,
        /// Parser message.
        reason: String,
    },
}

/// A stored event that the aggregate does not recognize.
///
/// Fatal to rehydration: skipping the record would corrupt derived state.
#[derive(Debug, thiserror::Error)]
#[error("unknown event '{event_type}' at version {version} of entity '{entity_id}': {reason}")]
pub struct UnknownEventError {
    /// Entity whose history contains the record.
    pub entity_id: String,
    /// Version of the offending record.
    pub version: u64,
    /// Discriminator found in the record.
    pub event_type: String,
    /// Why decoding failed.
    pub reason: String,
}

/// One failed handler or subscriber invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Name of the handler or subscriber that failed.
    pub handler: String,
    /// Discriminator of the message being delivered.
    pub message_type: String,
    /// Rendered error.
    pub error: String,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed on '{}': {}",
            self.handler, self.message_type, self.error
        )
    }
}

/// Aggregate of handler failures collected while delivering messages.
///
/// Delivery continues past a failing handler so one bad subscriber cannot
/// suppress the others; the failures are reported together afterwards.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} handler(s) failed, first: {}", .failures.len(), first_failure(.failures))]
pub struct DeliveryError {
    /// Every failure, in the order it happened.
    pub failures: Vec<HandlerFailure>,
}

fn first_failure(failures: &[HandlerFailure]) -> String {
    failures
        .first()
        .map(ToString::to_string)
        .unwrap_or_default()
}

/// Error returned by a [`Broker`](crate::Broker) or [`Mailbox`](crate::Mailbox).
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    /// The caller-specified wait elapsed. The queue is unchanged.
    #[error("mailbox operation timed out after {0:?}")]
    Timeout(Duration),

    /// The queue was closed while the caller waited, or before it arrived.
    #[error("mailbox is closed")]
    Closed,

    /// `broadcast` was called on a pull-style broker.
    #[error("broadcast is not implemented by pull-style brokers")]
    BroadcastUnsupported,

    /// One or more subscribers failed during a broadcast.
    #[error("broadcast delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Error returned by a non-blocking put. Hands the message back to the caller.
pub enum TryPutError<M> {
    /// The bounded queue is saturated.
    QueueFull {
        /// The rejected message.
        message: M,
        /// Configured capacity of the queue.
        capacity: usize,
    },
    /// The queue has been closed.
    Closed(M),
}

impl<M> TryPutError<M> {
    /// Recover the rejected message.
    pub fn into_inner(self) -> M {
        match self {
            Self::QueueFull { message, .. } | Self::Closed(message) => message,
        }
    }
}

// Manual `Debug` so `M` need not be `Debug`.
impl<M> fmt::Debug for TryPutError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { capacity, .. } => f
                .debug_struct("QueueFull")
                .field("capacity", capacity)
                .finish_non_exhaustive(),
            Self::Closed(_) => f.debug_tuple("Closed").finish_non_exhaustive(),
        }
    }
}

impl<M> fmt::Display for TryPutError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { capacity, .. } => write!(f, "queue is full (capacity {capacity})"),
            Self::Closed(_) => f.write_str("mailbox is closed"),
        }
    }
}

impl<M> std::error::Error for TryPutError<M> {}

/// Error returned by [`Dispatcher::publish`](crate::Dispatcher::publish).
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// Strict mode only: no handler is registered for the message's variant.
    #[error("no handler registered for '{message_type}'")]
    Unhandled {
        /// Discriminator of the dropped message.
        message_type: String,
    },

    /// Every handler ran; at least one failed.
    #[error(transparent)]
    Failed(#[from] DeliveryError),
}

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    #[error(transparent)]
    Domain(E),

    /// Optimistic concurrency retries exhausted.
    #[error("optimistic concurrency conflict on '{entity_id}': gave up after {attempts} attempt(s)")]
    Conflict {
        /// Entity whose stream kept moving.
        entity_id: String,
        /// How many load-decide-commit attempts were made.
        attempts: u32,
    },

    /// The event store failed.
    #[error(transparent)]
    Store(StoreError),

    /// The aggregate's history contains an event it cannot apply.
    #[error(transparent)]
    UnknownEvent(#[from] UnknownEventError),

    /// Events were durably appended, but publishing them failed.
    ///
    /// Do not retry the command: its events are already in the store.
    #[error("{committed} event(s) committed but delivery failed: {source}")]
    Delivery {
        /// Number of events that were appended before delivery failed.
        committed: usize,
        /// The mailbox failure.
        #[source]
        source: MailboxError,
    },

    /// The actor owning this aggregate has shut down.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

impl<E: std::error::Error + Send + Sync + 'static> From<StoreError> for ExecuteError<E> {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<StateError> for ExecuteError<E> {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Store(e) => Self::Store(e),
            StateError::UnknownEvent(e) => Self::UnknownEvent(e),
            StateError::ActorGone => Self::ActorGone,
        }
    }
}

/// Error returned when loading or reading the current state of an aggregate fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The event store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The aggregate's history contains an event it cannot apply.
    #[error(transparent)]
    UnknownEvent(#[from] UnknownEventError),

    /// The actor owning this aggregate has shut down.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

/// Error returned while loading [`Settings`](crate::Settings).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("cannot read settings: {0}")]
    Io(#[from] std::io::Error),

    /// The settings file is not valid TOML for [`Settings`](crate::Settings).
    #[error("invalid settings: {0}")]
    Parse(#[from] toml::de::Error),

    /// The settings are well-formed but inconsistent.
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Error returned by [`ContextBuilder::build`](crate::ContextBuilder::build).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The configuration is inconsistent with the supplied collaborators.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The event store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal domain error for testing `ExecuteError<E>`.
    #[derive(Debug, thiserror::Error)]
    #[error("test domain error")]
    struct TestDomainError;

    #[test]
    fn execute_error_domain_displays_inner() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Domain(TestDomainError);
        assert_eq!(err.to_string(), "test domain error");
    }

    #[test]
    fn execute_error_conflict_display() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Conflict {
            entity_id: "c1".into(),
            attempts: 4,
        };
        assert_eq!(
            err.to_string(),
            "optimistic concurrency conflict on 'c1': gave up after 4 attempt(s)"
        );
    }

    #[test]
    fn store_conflict_names_both_versions() {
        let err = StoreError::ConcurrencyConflict {
            entity_id: "c1".into(),
            expected: ExpectedVersion::Exact(1),
            actual: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("'c1'"), "got: {msg}");
        assert!(msg.contains("version 1"), "got: {msg}");
        assert!(msg.contains("version 2"), "got: {msg}");
    }

    #[test]
    fn state_error_converts_into_execute_error() {
        let err: ExecuteError<TestDomainError> = StateError::ActorGone.into();
        assert!(matches!(err, ExecuteError::ActorGone));

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "log missing");
        let err: ExecuteError<TestDomainError> = StateError::Store(io_err.into()).into();
        assert!(err.to_string().contains("log missing"));
    }

    #[test]
    fn delivery_error_reports_count_and_first_failure() {
        let err = DeliveryError {
            failures: vec![
                HandlerFailure {
                    handler: "audit".into(),
                    message_type: "customer_created".into(),
                    error: "disk full".into(),
                },
                HandlerFailure {
                    handler: "mailer".into(),
                    message_type: "customer_created".into(),
                    error: "smtp down".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "2 handler(s) failed, first: audit failed on 'customer_created': disk full"
        );
    }

    #[test]
    fn try_put_error_returns_message() {
        let err = TryPutError::QueueFull {
            message: "hello",
            capacity: 1,
        };
        assert_eq!(err.to_string(), "queue is full (capacity 1)");
        assert_eq!(err.into_inner(), "hello");
    }

    #[test]
    fn timeout_is_distinct_from_closed() {
        let timeout = MailboxError::Timeout(Duration::from_millis(5));
        assert!(timeout.to_string().contains("timed out"));
        assert!(!matches!(timeout, MailboxError::Closed));
    }

    // Verify `Send + Sync` bounds are satisfied so errors can cross task
    // boundaries, which is required for use with `tokio` channels.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ExecuteError<TestDomainError>>();
            assert_send_sync::<StateError>();
            assert_send_sync::<StoreError>();
            assert_send_sync::<MailboxError>();
            assert_send_sync::<DispatchError>();
        }
    };
}
