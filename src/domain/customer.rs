//! Customer aggregate.
//!
//! A customer is created once, can be marked preferred, and carries a
//! locale. Marking an already-preferred customer is a no-op that raises no
//! event, which keeps retries and replays safe.

use serde::{Deserialize, Serialize};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::aggregate::Aggregate;
use crate::event::Message;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// A customer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Customer {
    /// Set by `customer_created`; `None` until the customer exists.
    pub customer_id: Option<String>,
    /// Display name.
    pub name: String,
    /// Whether the customer gets preferred treatment.
    pub is_preferred: bool,
    /// BCP 47 locale tag, if one was chosen.
    pub locale: Option<String>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands accepted by the [`Customer`] aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumDiscriminants, IntoStaticStr)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
#[strum_discriminants(name(CustomerCommandKind), derive(Hash))]
#[strum(serialize_all = "snake_case")]
pub enum CustomerCommand {
    /// Register a new customer.
    Create { customer_id: String, name: String },
    /// Grant preferred status.
    MakePreferred,
    /// Switch the customer's locale.
    ChangeLocale { locale: String },
}

impl Message for CustomerCommand {
    type Kind = CustomerCommandKind;

    fn kind(&self) -> CustomerCommandKind {
        self.into()
    }

    fn message_type(&self) -> &'static str {
        self.into()
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Domain events produced by the [`Customer`] aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumDiscriminants, IntoStaticStr)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
#[strum_discriminants(name(CustomerEventKind), derive(Hash))]
#[strum(serialize_all = "snake_case")]
pub enum CustomerEvent {
    /// A customer was registered.
    CustomerCreated { customer_id: String, name: String },
    /// The customer became preferred.
    CustomerIsPreferred { customer_id: String },
    /// The customer's locale changed.
    CustomerLocaleChanged { customer_id: String, locale: String },
}

impl Message for CustomerEvent {
    type Kind = CustomerEventKind;

    fn kind(&self) -> CustomerEventKind {
        self.into()
    }

    fn message_type(&self) -> &'static str {
        self.into()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur when handling a [`CustomerCommand`].
#[derive(Debug, thiserror::Error)]
pub enum CustomerError {
    /// The customer ID must not be empty.
    #[error("customer id must not be empty")]
    EmptyId,
    /// Attempted to create a customer that already exists.
    #[error("customer already exists")]
    AlreadyCreated,
    /// Attempted to modify a customer that has not been created.
    #[error("customer does not exist")]
    NotCreated,
    /// The locale must not be empty.
    #[error("locale must not be empty")]
    EmptyLocale,
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

impl Customer {
    fn require_id(&self) -> Result<&str, CustomerError> {
        self.customer_id.as_deref().ok_or(CustomerError::NotCreated)
    }
}

impl Aggregate for Customer {
    const AGGREGATE_TYPE: &'static str = "customer";
    type Command = CustomerCommand;
    type Event = CustomerEvent;
    type Error = CustomerError;

    fn handle(&self, cmd: CustomerCommand) -> Result<Vec<CustomerEvent>, CustomerError> {
        match cmd {
            CustomerCommand::Create { customer_id, name } => {
                if customer_id.trim().is_empty() {
                    return Err(CustomerError::EmptyId);
                }
                if self.customer_id.is_some() {
                    return Err(CustomerError::AlreadyCreated);
                }
                Ok(vec![CustomerEvent::CustomerCreated { customer_id, name }])
            }
            CustomerCommand::MakePreferred => {
                let customer_id = self.require_id()?;
                if self.is_preferred {
                    return Ok(vec![]);
                }
                Ok(vec![CustomerEvent::CustomerIsPreferred {
                    customer_id: customer_id.to_string(),
                }])
            }
            CustomerCommand::ChangeLocale { locale } => {
                let customer_id = self.require_id()?;
                if locale.trim().is_empty() {
                    return Err(CustomerError::EmptyLocale);
                }
                if self.locale.as_deref() == Some(locale.as_str()) {
                    return Ok(vec![]);
                }
                Ok(vec![CustomerEvent::CustomerLocaleChanged {
                    customer_id: customer_id.to_string(),
                    locale,
                }])
            }
        }
    }

    fn apply(mut self, event: &CustomerEvent) -> Self {
        match event {
            CustomerEvent::CustomerCreated { customer_id, name } => {
                self.customer_id = Some(customer_id.clone());
                self.name = name.clone();
            }
            CustomerEvent::CustomerIsPreferred { .. } => {
                self.is_preferred = true;
            }
            CustomerEvent::CustomerLocaleChanged { locale, .. } => {
                self.locale = Some(locale.clone());
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created() -> Customer {
        Customer::default().apply(&CustomerEvent::CustomerCreated {
            customer_id: "c1".into(),
            name: "Ada".into(),
        })
    }

    #[test]
    fn create_emits_created() {
        let events = Customer::default()
            .handle(CustomerCommand::Create {
                customer_id: "c1".into(),
                name: "Ada".into(),
            })
            .expect("create should succeed");
        assert_eq!(
            events,
            vec![CustomerEvent::CustomerCreated {
                customer_id: "c1".into(),
                name: "Ada".into()
            }]
        );
    }

    #[test]
    fn create_twice_is_rejected() {
        let result = created().handle(CustomerCommand::Create {
            customer_id: "c1".into(),
            name: "Ada".into(),
        });
        assert!(matches!(result, Err(CustomerError::AlreadyCreated)));
    }

    #[test]
    fn create_requires_id() {
        let result = Customer::default().handle(CustomerCommand::Create {
            customer_id: "  ".into(),
            name: "Ada".into(),
        });
        assert!(matches!(result, Err(CustomerError::EmptyId)));
    }

    #[test]
    fn make_preferred_is_idempotent() {
        let customer = created();
        let events = customer
            .handle(CustomerCommand::MakePreferred)
            .expect("make preferred should succeed");
        assert_eq!(events.len(), 1);

        let preferred = events.iter().fold(customer, |s, e| s.apply(e));
        let again = preferred
            .handle(CustomerCommand::MakePreferred)
            .expect("repeat should succeed");
        assert!(again.is_empty());
    }

    #[test]
    fn same_locale_is_a_no_op() {
        let customer = created().apply(&CustomerEvent::CustomerLocaleChanged {
            customer_id: "c1".into(),
            locale: "de-DE".into(),
        });
        let events = customer
            .handle(CustomerCommand::ChangeLocale {
                locale: "de-DE".into(),
            })
            .expect("change locale should succeed");
        assert!(events.is_empty());
    }

    #[test]
    fn serde_tag_matches_message_type() {
        let events = [
            CustomerEvent::CustomerCreated {
                customer_id: "c1".into(),
                name: "Ada".into(),
            },
            CustomerEvent::CustomerIsPreferred {
                customer_id: "c1".into(),
            },
            CustomerEvent::CustomerLocaleChanged {
                customer_id: "c1".into(),
                locale: "en".into(),
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).expect("serialize should succeed");
            assert_eq!(json["type"], event.message_type());
        }
    }

    #[test]
    fn kinds_are_distinct_per_variant() {
        assert_eq!(
            CustomerCommand::MakePreferred.kind(),
            CustomerCommandKind::MakePreferred
        );
        assert_eq!(CustomerCommand::MakePreferred.message_type(), "make_preferred");
        assert_ne!(
            CustomerEventKind::CustomerCreated,
            CustomerEventKind::CustomerIsPreferred
        );
    }
}
