//! Message envelopes and the event codec shared by the store, mailbox, and
//! dispatcher.
//!
//! Domain events are adjacently tagged enums (`#[serde(tag = "type", content =
//! "data", rename_all = "snake_case")]`). The `"type"` tag becomes the stored
//! `event_type` and the `"data"` content becomes the opaque `event_body`. No
//! I/O happens here.

use std::fmt::Debug;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::command::CommandContext;
use crate::error::UnknownEventError;

/// A message that crosses a component boundary: an event or a command.
///
/// Every message family is a tagged enum with a static discriminator.
/// [`kind`](Message::kind) returns the variant tag used for routing, and
/// [`message_type`](Message::message_type) returns its stable string form used
/// for persistence. Both are usually derived with `strum`:
///
/// ```ignore
/// #[derive(Clone, Debug, EnumDiscriminants, IntoStaticStr)]
/// #[strum_discriminants(name(CounterEventKind), derive(Hash))]
/// #[strum(serialize_all = "snake_case")]
/// enum CounterEvent { Incremented, Added { amount: u64 } }
/// ```
pub trait Message: Clone + Debug + Send + Sync + 'static {
    /// Variant tag of this message family.
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// The variant tag of this message.
    fn kind(&self) -> Self::Kind;

    /// Stable, refactoring-proof discriminator (e.g. `"customer_created"`).
    fn message_type(&self) -> &'static str;
}

/// A message that is persisted in the event store.
///
/// The serde tag of each variant must equal its
/// [`message_type`](Message::message_type); [`encode`] rejects events where
/// the two disagree.
pub trait DomainEvent: Message + Serialize + DeserializeOwned {}

impl<T: Message + Serialize + DeserializeOwned> DomainEvent for T {}

/// Immutable wrapper around an event or command.
///
/// Carries identity, ordering, and timestamp metadata. `version` is `0` and
/// `position` is `None` until the event store seals the envelope on append;
/// producers never choose versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    message_id: Uuid,
    entity_id: String,
    message_type: String,
    version: u64,
    position: Option<u64>,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "CommandContext::is_empty")]
    context: CommandContext,
    payload: M,
}

impl<M: Message> Envelope<M> {
    /// Wrap `payload` for `entity_id`, generating a fresh message ID and
    /// stamping the current UTC time.
    pub fn new(entity_id: impl Into<String>, payload: M) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            message_type: payload.message_type().to_string(),
            version: 0,
            position: None,
            timestamp: Utc::now(),
            context: CommandContext::default(),
            payload,
        }
    }

    /// Attach the command context that caused this message.
    pub fn with_context(mut self, context: CommandContext) -> Self {
        self.context = context;
        self
    }

    /// Variant tag of the payload.
    pub fn kind(&self) -> M::Kind {
        self.payload.kind()
    }
}

impl<M> Envelope<M> {
    /// Unique identifier generated at construction.
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// The aggregate this message concerns.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Stable string discriminator of the payload.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Per-entity version, `0` while unsealed.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Global append position, `None` while unsealed.
    pub fn position(&self) -> Option<u64> {
        self.position
    }

    /// Creation time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The command context stamped on this message.
    pub fn context(&self) -> &CommandContext {
        &self.context
    }

    /// The wrapped event or command.
    pub fn payload(&self) -> &M {
        &self.payload
    }

    /// Unwrap the payload.
    pub fn into_payload(self) -> M {
        self.payload
    }

    /// Returns `true` once the store has assigned a version.
    pub fn is_sealed(&self) -> bool {
        self.version > 0
    }

    /// Convert the payload, keeping every piece of metadata.
    ///
    /// Used to lift an aggregate's own event family into the application-wide
    /// event union before publishing.
    pub fn map_payload<N>(self, f: impl FnOnce(M) -> N) -> Envelope<N> {
        Envelope {
            message_id: self.message_id,
            entity_id: self.entity_id,
            message_type: self.message_type,
            version: self.version,
            position: self.position,
            timestamp: self.timestamp,
            context: self.context,
            payload: f(self.payload),
        }
    }

    /// Return a copy sealed with the version and position assigned by the store.
    pub(crate) fn sealed(self, version: u64, position: u64) -> Self {
        Self {
            version,
            position: Some(position),
            ..self
        }
    }
}

/// An event ready to be appended, produced by [`encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEvent {
    /// Message ID carried over from the envelope.
    pub id: Uuid,
    /// Stream the event belongs to.
    pub entity_id: String,
    /// Stable discriminator.
    pub event_type: String,
    /// JSON body (the `"data"` part of the adjacently tagged event).
    pub event_body: Value,
    /// Command context persisted with the event.
    pub metadata: CommandContext,
    /// Envelope creation time.
    pub created_at: DateTime<Utc>,
}

/// The durable projection of an envelope.
///
/// One row of the append-only log: `(id, event_type, event_body, entity_id,
/// version, created_at)` plus the global `position` and the command context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Message ID.
    pub id: Uuid,
    /// Stable discriminator.
    pub event_type: String,
    /// Opaque JSON body whose schema is owned by the event type.
    pub event_body: Value,
    /// Stream the event belongs to.
    pub entity_id: String,
    /// One-based version within the entity's stream.
    pub version: u64,
    /// One-based position in the global log.
    pub position: u64,
    /// Command context persisted with the event.
    #[serde(default, skip_serializing_if = "CommandContext::is_empty")]
    pub metadata: CommandContext,
    /// Envelope creation time.
    pub created_at: DateTime<Utc>,
}

impl ProposedEvent {
    /// Turn this proposal into a stored record at the given coordinates.
    pub(crate) fn into_record(self, version: u64, position: u64) -> EventRecord {
        EventRecord {
            id: self.id,
            event_type: self.event_type,
            event_body: self.event_body,
            entity_id: self.entity_id,
            version,
            position,
            metadata: self.metadata,
            created_at: self.created_at,
        }
    }
}

/// Encode an event envelope into a [`ProposedEvent`].
///
/// Serializes the adjacently tagged payload, extracts the `"type"` tag and
/// the `"data"` content (absent for fieldless variants, stored as `null`).
///
/// # Errors
///
/// Returns `serde_json::Error` if the payload cannot be serialized, does not
/// serialize to a tagged object, or its tag disagrees with
/// [`Message::message_type`].
pub fn encode<E: DomainEvent>(envelope: &Envelope<E>) -> serde_json::Result<ProposedEvent> {
    use serde::ser::Error as _;

    let value = serde_json::to_value(envelope.payload())?;
    let Value::Object(mut obj) = value else {
        return Err(serde_json::Error::custom(
            "domain event must serialize to an adjacently tagged object",
        ));
    };

    let tag = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| serde_json::Error::custom("domain event is missing its \"type\" tag"))?;
    if tag != envelope.message_type() {
        return Err(serde_json::Error::custom(format!(
            "serde tag '{tag}' does not match message type '{}'",
            envelope.message_type()
        )));
    }

    let event_body = obj.remove("data").unwrap_or(Value::Null);

    Ok(ProposedEvent {
        id: envelope.message_id(),
        entity_id: envelope.entity_id().to_string(),
        event_type: envelope.message_type().to_string(),
        event_body,
        metadata: envelope.context().clone(),
        created_at: envelope.timestamp(),
    })
}

/// Decode a stored record back into a sealed envelope.
///
/// # Errors
///
/// Returns [`UnknownEventError`] if `E` has no variant for the record's
/// `event_type`, or the body does not match that variant's shape.
pub fn decode<E: DomainEvent>(record: &EventRecord) -> Result<Envelope<E>, UnknownEventError> {
    let tagged = if record.event_body.is_null() {
        serde_json::json!({ "type": record.event_type })
    } else {
        serde_json::json!({ "type": record.event_type, "data": record.event_body })
    };

    let payload: E = serde_json::from_value(tagged).map_err(|e| UnknownEventError {
        entity_id: record.entity_id.clone(),
        version: record.version,
        event_type: record.event_type.clone(),
        reason: e.to_string(),
    })?;

    Ok(Envelope {
        message_id: record.id,
        entity_id: record.entity_id.clone(),
        message_type: record.event_type.clone(),
        version: record.version,
        position: Some(record.position),
        timestamp: record.created_at,
        context: record.metadata.clone(),
        payload,
    })
}
