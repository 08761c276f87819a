//! Error taxonomy for the resolution core.
//!
//! Every failure is a typed result to the caller, never a silent default.

use thiserror::Error;
use uuid::Uuid;

use crate::verdict::ValidationVerdict;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolveError {
    /// Term extraction produced nothing usable; degrades to `unresolved`,
    /// surfaced as an error only when the caller supplied no terms at all.
    #[error("no usable terms could be extracted from the query")]
    ExtractionFailure,

    /// The device registry could not be reached for any candidate.
    /// The whole cycle fails closed; the caller may retry.
    #[error("device registry unavailable: {reason}")]
    RegistryUnavailable { reason: String },

    /// A concurrent answer is already being processed for this session.
    #[error("session {session_id} is already processing an answer")]
    SessionConflict { session_id: Uuid },

    /// The session reached a terminal state; a new query is required.
    #[error("session {session_id} is expired or resolved")]
    SessionExpired { session_id: Uuid },

    #[error("session {session_id} not found")]
    SessionNotFound { session_id: Uuid },

    /// The safety validator rejected the plan. Itemized reasons attached;
    /// nothing was deployed.
    #[error("plan rejected by safety validation ({} failed rule(s))", verdicts.iter().filter(|v| !v.passed).count())]
    ValidationHardFail { verdicts: Vec<ValidationVerdict> },

    /// Session or knowledge persistence failed.
    #[error("store error: {reason}")]
    Store { reason: String },
}

impl ResolveError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store {
            reason: err.to_string(),
        }
    }

    pub fn registry(err: impl std::fmt::Display) -> Self {
        Self::RegistryUnavailable {
            reason: err.to_string(),
        }
    }
}
