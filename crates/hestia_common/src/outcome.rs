//! The three-way resolution result exposed to the surface layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityRecord;
use crate::session::Question;

/// Why a cycle ended without a resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// No usable terms were extracted from the sentence
    NoTerms,
    /// Blocking or verification left no candidates
    NoCandidates,
    /// The clarification round limit was reached without separation
    RoundLimit,
    /// The user cancelled the clarification dialog
    Cancelled,
}

impl std::fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoTerms => "no usable terms",
            Self::NoCandidates => "no matching devices",
            Self::RoundLimit => "clarification round limit reached",
            Self::Cancelled => "cancelled by user",
        };
        f.write_str(s)
    }
}

/// Result of `resolve` / `answer`. `Resolved` entities have all passed
/// ground-truth verification within the cycle that produced this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ResolveOutcome {
    Resolved {
        query_id: Uuid,
        entities: Vec<EntityRecord>,
    },
    Ambiguous {
        session_id: Uuid,
        questions: Vec<Question>,
    },
    Unresolved {
        reason: UnresolvedReason,
    },
}

impl ResolveOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    /// Resolved entity ids, empty unless `Resolved`.
    pub fn entity_ids(&self) -> Vec<&str> {
        match self {
            Self::Resolved { entities, .. } => {
                entities.iter().map(|e| e.entity_id.as_str()).collect()
            }
            _ => vec![],
        }
    }
}
