//! Reference domains and the application-wide event union.
//!
//! Each aggregate owns its own event family. [`AppEvent`] folds them into the
//! one message type that flows through the mailbox and dispatcher, so a
//! single context can publish events from every aggregate.

pub mod ask;
pub mod customer;

use serde::{Deserialize, Serialize};

use crate::event::Message;
use ask::{AskEvent, AskEventKind};
use customer::{CustomerEvent, CustomerEventKind};

/// Every domain event the application publishes.
///
/// Serialized untagged: the inner families are already tagged with
/// `"type"`/`"data"`, and their tags are disjoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AppEvent {
    Customer(CustomerEvent),
    Ask(AskEvent),
}

/// Variant tag of an [`AppEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppEventKind {
    Customer(CustomerEventKind),
    Ask(AskEventKind),
}

impl Message for AppEvent {
    type Kind = AppEventKind;

    fn kind(&self) -> AppEventKind {
        match self {
            Self::Customer(e) => AppEventKind::Customer(e.kind()),
            Self::Ask(e) => AppEventKind::Ask(e.kind()),
        }
    }

    fn message_type(&self) -> &'static str {
        match self {
            Self::Customer(e) => e.message_type(),
            Self::Ask(e) => e.message_type(),
        }
    }
}

impl From<CustomerEvent> for AppEvent {
    fn from(event: CustomerEvent) -> Self {
        Self::Customer(event)
    }
}

impl From<AskEvent> for AppEvent {
    fn from(event: AskEvent) -> Self {
        Self::Ask(event)
    }
}

impl From<CustomerEventKind> for AppEventKind {
    fn from(kind: CustomerEventKind) -> Self {
        Self::Customer(kind)
    }
}

impl From<AskEventKind> for AppEventKind {
    fn from(kind: AskEventKind) -> Self {
        Self::Ask(kind)
    }
}
