//! Clarification sessions: the multi-turn disambiguation protocol.
//!
//! A session is created when scoring cannot separate candidates. It carries
//! menu-style questions with numeric keys; 0 always cancels and 9 accepts
//! free text. Sessions become immutable once they reach a terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::query::{ExtractedTerms, Query};

/// Reserved numeric keys for escape options
pub const KEY_CANCEL: u8 = 0;
pub const KEY_OTHER: u8 = 9;

/// Session lifecycle. Only forward transitions are legal;
/// `Resolved` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    AwaitingAnswer,
    Answered,
    Resolved,
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Expired)
    }
}

/// A selectable option in a clarification question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    /// Numeric key (1-8 for candidates, 0=cancel, 9=other)
    pub key: u8,
    /// Display label ("ceiling light", "office")
    pub label: String,
    /// Entity this option stands for, when it names one directly
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

impl QuestionOption {
    pub fn new(key: u8, label: impl Into<String>) -> Self {
        Self {
            key,
            label: label.into(),
            entity_id: None,
        }
    }

    pub fn for_entity(key: u8, label: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            key,
            label: label.into(),
            entity_id: Some(entity_id.into()),
        }
    }

    pub fn cancel() -> Self {
        Self::new(KEY_CANCEL, "Cancel")
    }

    pub fn other() -> Self {
        Self::new(KEY_OTHER, "Other (specify)")
    }
}

/// One clarification question emitted to the (external) UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub text: String,
    /// Options sorted by key, escape options last
    pub options: Vec<QuestionOption>,
}

impl Question {
    /// Build a question, appending the reserved escape options.
    pub fn new(text: impl Into<String>, mut options: Vec<QuestionOption>) -> Self {
        options.retain(|o| o.key != KEY_CANCEL && o.key != KEY_OTHER);
        options.sort_by_key(|o| o.key);
        options.push(QuestionOption::cancel());
        options.push(QuestionOption::other());
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            options,
        }
    }

    pub fn option_for_key(&self, key: u8) -> Option<&QuestionOption> {
        self.options.iter().find(|o| o.key == key)
    }
}

/// A submitted answer, keyed by question id. Either a menu key or free text
/// (for the "other" escape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_key: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Answer {
    pub fn key(question_id: Uuid, key: u8) -> Self {
        Self {
            question_id,
            selected_key: Some(key),
            text: None,
        }
    }

    pub fn free_text(question_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            question_id,
            selected_key: Some(KEY_OTHER),
            text: Some(text.into()),
        }
    }

    pub fn is_cancel(&self) -> bool {
        self.selected_key == Some(KEY_CANCEL)
    }
}

/// One question/answer round in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub question: Question,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<Answer>,
}

/// Persisted clarification session record.
///
/// The `version` field is an optimistic concurrency token: every store write
/// must present the version it read, and bumps it on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationSession {
    pub id: Uuid,
    pub origin_query_id: Uuid,
    /// Raw text of the origin query; follow-up queries reuse it
    pub raw_text: String,
    /// Terms the origin query resolved with, the base for answer merging
    pub origin_terms: ExtractedTerms,
    pub status: SessionStatus,
    pub exchanges: Vec<Exchange>,
    /// Completed clarification rounds
    pub round: u32,
    /// Entity ids from the origin query's blocking pass. Re-resolution is
    /// scoped to this pool and never re-expanded.
    pub candidate_pool: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followup_query_id: Option<Uuid>,
    /// Final entity set, filled only when status is `Resolved`
    #[serde(default)]
    pub resolved_entities: Vec<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClarificationSession {
    pub fn new(origin: &Query, candidate_pool: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            origin_query_id: origin.id,
            raw_text: origin.raw_text.clone(),
            origin_terms: origin.terms(),
            status: SessionStatus::Created,
            exchanges: vec![],
            round: 0,
            candidate_pool,
            followup_query_id: None,
            resolved_entities: vec![],
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reconstructed origin query, for building follow-ups.
    pub fn origin_query(&self) -> Query {
        Query {
            id: self.origin_query_id,
            raw_text: self.raw_text.clone(),
            device_terms: self.origin_terms.device_terms.clone(),
            location_term: self.origin_terms.location_term.clone(),
            created_at: self.created_at,
        }
    }

    /// The question currently waiting for an answer, if any.
    pub fn open_question(&self) -> Option<&Question> {
        self.exchanges
            .iter()
            .rev()
            .find(|e| e.answer.is_none())
            .map(|e| &e.question)
    }

    /// Emit a question set and move to `AwaitingAnswer`.
    /// Illegal from a terminal state.
    pub fn ask(&mut self, question: Question) -> Result<(), crate::ResolveError> {
        self.check_mutable()?;
        self.exchanges.push(Exchange {
            question,
            answer: None,
        });
        self.status = SessionStatus::AwaitingAnswer;
        self.touch();
        Ok(())
    }

    /// Record an answer against the open question and move to `Answered`.
    pub fn record_answer(&mut self, answer: Answer) -> Result<(), crate::ResolveError> {
        self.check_mutable()?;
        if self.status != SessionStatus::AwaitingAnswer {
            return Err(crate::ResolveError::SessionConflict {
                session_id: self.id,
            });
        }
        let open = self
            .exchanges
            .iter_mut()
            .rev()
            .find(|e| e.answer.is_none())
            .ok_or(crate::ResolveError::SessionConflict {
                session_id: self.id,
            })?;
        if open.question.id != answer.question_id {
            return Err(crate::ResolveError::SessionConflict {
                session_id: self.id,
            });
        }
        open.answer = Some(answer);
        self.status = SessionStatus::Answered;
        self.round += 1;
        self.touch();
        Ok(())
    }

    /// Terminal transition: resolution succeeded.
    pub fn resolve(&mut self, entities: Vec<String>) -> Result<(), crate::ResolveError> {
        self.check_mutable()?;
        self.status = SessionStatus::Resolved;
        self.resolved_entities = entities;
        self.touch();
        Ok(())
    }

    /// Terminal transition: round limit, idle timeout or cancellation.
    pub fn expire(&mut self) -> Result<(), crate::ResolveError> {
        self.check_mutable()?;
        self.status = SessionStatus::Expired;
        self.touch();
        Ok(())
    }

    pub fn idle_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.updated_at).num_seconds()
    }

    fn check_mutable(&self) -> Result<(), crate::ResolveError> {
        if self.status.is_terminal() {
            return Err(crate::ResolveError::SessionExpired {
                session_id: self.id,
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
