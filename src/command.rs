//! Cross-cutting command metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries audit trail, correlation, and tracing information without
/// polluting the command or event types. Stamped on every [`Envelope`]
/// produced while executing the command and persisted with each event.
///
/// [`Envelope`]: crate::Envelope
///
/// # Examples
///
/// ```
/// use askeda::CommandContext;
/// use serde_json::json;
///
/// let ctx = CommandContext::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_metadata(json!({"source": "api"}));
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert!(ctx.metadata.is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of the actor issuing the command (e.g. a user ID).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across aggregates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Arbitrary metadata persisted next to the event body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl CommandContext {
    /// Set the actor identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set arbitrary metadata.
    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }

    /// Returns `true` when no field is set.
    pub fn is_empty(&self) -> bool {
        self.actor.is_none() && self.correlation_id.is_none() && self.metadata.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_context_is_empty() {
        let ctx = CommandContext::default();
        assert!(ctx.is_empty());
        assert_eq!(ctx.actor, None);
        assert_eq!(ctx.correlation_id, None);
        assert_eq!(ctx.metadata, None);
    }

    #[test]
    fn builder_chains_all_fields() {
        let ctx = CommandContext::default()
            .with_actor("admin")
            .with_correlation_id("req-abc")
            .with_metadata(json!({"source": "test"}));

        assert!(!ctx.is_empty());
        assert_eq!(ctx.actor.as_deref(), Some("admin"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc"));
        assert_eq!(ctx.metadata, Some(json!({"source": "test"})));
    }

    #[test]
    fn builder_accepts_string_owned() {
        let ctx = CommandContext::default()
            .with_actor(String::from("svc-gpt"))
            .with_correlation_id(String::from("id-007"));

        assert_eq!(ctx.actor.as_deref(), Some("svc-gpt"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("id-007"));
    }

    #[test]
    fn empty_context_serializes_to_empty_object() {
        let json = serde_json::to_value(CommandContext::default())
            .expect("serialization should succeed");
        assert_eq!(json, json!({}));

        let back: CommandContext =
            serde_json::from_value(json).expect("deserialization should succeed");
        assert!(back.is_empty());
    }
}
