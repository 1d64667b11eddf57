//! Ask-history aggregate -- the questions a user put to the assistant and the
//! answers that came back, in the order they were asked.

use serde::{Deserialize, Serialize};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::aggregate::Aggregate;
use crate::event::Message;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// A single question and, once available, its answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ask {
    pub ask_id: String,
    pub question: String,
    pub answer: Option<String>,
}

impl Ask {
    /// Returns `true` once an answer was recorded.
    pub fn is_answered(&self) -> bool {
        self.answer.is_some()
    }
}

/// Speaker of a [`ChatTurn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of conversation handed to the inference collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Conversation history of one user session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AskHistory {
    /// Asks in the order they were raised.
    pub asks: Vec<Ask>,
}

impl AskHistory {
    /// Look up an ask by ID.
    pub fn query_ask(&self, ask_id: &str) -> Option<&Ask> {
        self.asks.iter().find(|a| a.ask_id == ask_id)
    }

    /// Flatten the history into chat turns: each question as a user turn,
    /// followed by its answer as an assistant turn when there is one.
    pub fn as_context(&self) -> Vec<ChatTurn> {
        let mut turns = Vec::with_capacity(self.asks.len() * 2);
        for ask in &self.asks {
            turns.push(ChatTurn {
                role: Role::User,
                content: ask.question.clone(),
            });
            if let Some(answer) = &ask.answer {
                turns.push(ChatTurn {
                    role: Role::Assistant,
                    content: answer.clone(),
                });
            }
        }
        turns
    }

    fn query_ask_mut(&mut self, ask_id: &str) -> Option<&mut Ask> {
        self.asks.iter_mut().find(|a| a.ask_id == ask_id)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands accepted by the [`AskHistory`] aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumDiscriminants, IntoStaticStr)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
#[strum_discriminants(name(AskCommandKind), derive(Hash))]
#[strum(serialize_all = "snake_case")]
pub enum AskCommand {
    /// Put a new question on the record.
    Ask { ask_id: String, question: String },
    /// Record the answer to a pending question.
    Answer { ask_id: String, answer: String },
}

impl Message for AskCommand {
    type Kind = AskCommandKind;

    fn kind(&self) -> AskCommandKind {
        self.into()
    }

    fn message_type(&self) -> &'static str {
        self.into()
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Domain events produced by the [`AskHistory`] aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumDiscriminants, IntoStaticStr)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
#[strum_discriminants(name(AskEventKind), derive(Hash))]
#[strum(serialize_all = "snake_case")]
pub enum AskEvent {
    /// A question was asked.
    QuestionAsked { ask_id: String, question: String },
    /// A question received its answer.
    QuestionAnswered { ask_id: String, answer: String },
}

impl Message for AskEvent {
    type Kind = AskEventKind;

    fn kind(&self) -> AskEventKind {
        self.into()
    }

    fn message_type(&self) -> &'static str {
        self.into()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur when handling an [`AskCommand`].
#[derive(Debug, thiserror::Error)]
pub enum AskError {
    #[error("question must not be empty")]
    EmptyQuestion,
    #[error("ask '{0}' already exists with a different question")]
    DuplicateAsk(String),
    #[error("ask '{0}' not found")]
    UnknownAsk(String),
    #[error("ask '{0}' was already answered differently")]
    AlreadyAnswered(String),
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

impl Aggregate for AskHistory {
    const AGGREGATE_TYPE: &'static str = "ask_history";
    type Command = AskCommand;
    type Event = AskEvent;
    type Error = AskError;

    fn handle(&self, cmd: AskCommand) -> Result<Vec<AskEvent>, AskError> {
        match cmd {
            AskCommand::Ask { ask_id, question } => {
                if question.trim().is_empty() {
                    return Err(AskError::EmptyQuestion);
                }
                if let Some(existing) = self.query_ask(&ask_id) {
                    if existing.question == question {
                        return Ok(vec![]);
                    }
                    return Err(AskError::DuplicateAsk(ask_id));
                }
                Ok(vec![AskEvent::QuestionAsked { ask_id, question }])
            }
            AskCommand::Answer { ask_id, answer } => {
                let ask = self
                    .query_ask(&ask_id)
                    .ok_or_else(|| AskError::UnknownAsk(ask_id.clone()))?;
                match &ask.answer {
                    Some(existing) if *existing == answer => Ok(vec![]),
                    Some(_) => Err(AskError::AlreadyAnswered(ask_id)),
                    None => Ok(vec![AskEvent::QuestionAnswered { ask_id, answer }]),
                }
            }
        }
    }

    fn apply(mut self, event: &AskEvent) -> Self {
        match event {
            AskEvent::QuestionAsked { ask_id, question } => {
                self.asks.push(Ask {
                    ask_id: ask_id.clone(),
                    question: question.clone(),
                    answer: None,
                });
            }
            AskEvent::QuestionAnswered { ask_id, answer } => {
                if let Some(ask) = self.query_ask_mut(ask_id) {
                    ask.answer = Some(answer.clone());
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ask(id: &str, question: &str) -> AskCommand {
        AskCommand::Ask {
            ask_id: id.into(),
            question: question.into(),
        }
    }

    fn fold(state: AskHistory, events: &[AskEvent]) -> AskHistory {
        events.iter().fold(state, |s, e| s.apply(e))
    }

    #[test]
    fn ask_then_answer_builds_context() {
        let state = AskHistory::default();
        let events = state
            .handle(ask("a1", "What is CQRS?"))
            .expect("ask should succeed");
        let state = fold(state, &events);

        let events = state
            .handle(AskCommand::Answer {
                ask_id: "a1".into(),
                answer: "Command query responsibility segregation.".into(),
            })
            .expect("answer should succeed");
        let state = fold(state, &events);

        let events = state
            .handle(ask("a2", "And event sourcing?"))
            .expect("second ask should succeed");
        let state = fold(state, &events);

        let turns = state.as_context();
        let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(turns[0].content, "What is CQRS?");
        assert_eq!(turns[2].content, "And event sourcing?");
        assert!(state.query_ask("a1").is_some_and(Ask::is_answered));
        assert!(!state.query_ask("a2").is_some_and(Ask::is_answered));
    }

    #[test]
    fn empty_question_is_rejected() {
        let result = AskHistory::default().handle(ask("a1", "   "));
        assert!(matches!(result, Err(AskError::EmptyQuestion)));
    }

    #[test]
    fn repeating_an_ask_is_a_no_op() {
        let state = fold(
            AskHistory::default(),
            &AskHistory::default()
                .handle(ask("a1", "Why?"))
                .expect("ask should succeed"),
        );
        let events = state.handle(ask("a1", "Why?")).expect("repeat should succeed");
        assert!(events.is_empty());

        let result = state.handle(ask("a1", "Why not?"));
        assert!(matches!(result, Err(AskError::DuplicateAsk(id)) if id == "a1"));
    }

    #[test]
    fn answering_unknown_ask_fails() {
        let result = AskHistory::default().handle(AskCommand::Answer {
            ask_id: "nope".into(),
            answer: "42".into(),
        });
        assert!(matches!(result, Err(AskError::UnknownAsk(_))));
    }

    #[test]
    fn conflicting_answer_fails() {
        let state = AskHistory {
            asks: vec![Ask {
                ask_id: "a1".into(),
                question: "Q".into(),
                answer: Some("A".into()),
            }],
        };
        let same = state
            .handle(AskCommand::Answer {
                ask_id: "a1".into(),
                answer: "A".into(),
            })
            .expect("same answer should succeed");
        assert!(same.is_empty());

        let result = state.handle(AskCommand::Answer {
            ask_id: "a1".into(),
            answer: "B".into(),
        });
        assert!(matches!(result, Err(AskError::AlreadyAnswered(_))));
    }

    #[test]
    fn chat_turn_serializes_lowercase_role() {
        let turn = ChatTurn {
            role: Role::Assistant,
            content: "hi".into(),
        };
        let json = serde_json::to_value(&turn).expect("serialize should succeed");
        assert_eq!(json, serde_json::json!({"role": "assistant", "content": "hi"}));
    }
}
