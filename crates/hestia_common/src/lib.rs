//! Shared typed contracts for the Hestia resolution core.
//!
//! Everything that crosses a component boundary lives here: the device
//! inventory model, queries, clarification sessions, automation plans,
//! safety verdicts, learned knowledge entries and the error taxonomy.

pub mod entity;
pub mod error;
pub mod knowledge;
pub mod outcome;
pub mod plan;
pub mod query;
pub mod session;
pub mod verdict;

pub use entity::{Domain, EntityRecord, StateSnapshot};
pub use error::ResolveError;
pub use knowledge::{KnowledgeEntry, KnowledgeOutcome};
pub use outcome::{ResolveOutcome, UnresolvedReason};
pub use plan::{Action, AutomationPlan, Condition, Trigger, ValidatedPlan};
pub use query::Query;
pub use session::{
    Answer, ClarificationSession, Exchange, Question, QuestionOption, SessionStatus, KEY_CANCEL,
    KEY_OTHER,
};
pub use verdict::{RuleId, RuleSeverity, ValidationVerdict};
