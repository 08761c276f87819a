//! Learned resolutions: the knowledge store's append-only entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether the user confirmed or rejected the resolution this entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeOutcome {
    Approved,
    Rejected,
}

/// One learned resolution. Immutable once written; only appended after the
/// user confirmed (or explicitly rejected) the resolution, and only evicted
/// by the age/size maintenance pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: Uuid,
    /// Raw text of the query this was learned from
    pub query_text: String,
    /// Embedding of that query
    pub embedding: Vec<f32>,
    /// Entity set the query resolved to
    pub entity_ids: Vec<String>,
    pub outcome: KnowledgeOutcome,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    pub fn new(
        query_text: impl Into<String>,
        embedding: Vec<f32>,
        entity_ids: Vec<String>,
        outcome: KnowledgeOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            query_text: query_text.into(),
            embedding,
            entity_ids,
            outcome,
            created_at: Utc::now(),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.outcome == KnowledgeOutcome::Approved
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrips_through_json() {
        let e = KnowledgeEntry::new(
            "office light show",
            vec![0.1, 0.2, 0.3],
            vec!["light.office".into()],
            KnowledgeOutcome::Approved,
        );
        let json = serde_json::to_string(&e).unwrap();
        let back: KnowledgeEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
        assert!(back.is_approved());
    }
}
