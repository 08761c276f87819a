//! Immutable resolution queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terms extracted from the raw sentence by the (external) term extractor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedTerms {
    /// Device-describing terms ("office", "light", "ceiling")
    pub device_terms: Vec<String>,
    /// Location term, if one was found ("office")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_term: Option<String>,
}

impl ExtractedTerms {
    pub fn is_empty(&self) -> bool {
        self.device_terms.is_empty() && self.location_term.is_none()
    }
}

/// One inbound resolution request. Created once, never mutated; a
/// clarification answer produces a *new* follow-up query instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: Uuid,
    /// Raw user text ("flash the office lights")
    pub raw_text: String,
    /// Extracted device terms
    pub device_terms: Vec<String>,
    /// Extracted location term, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_term: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Query {
    pub fn new(raw_text: impl Into<String>, terms: ExtractedTerms) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw_text: raw_text.into(),
            device_terms: terms.device_terms,
            location_term: terms.location_term,
            created_at: Utc::now(),
        }
    }

    /// Follow-up query for a clarification round: same raw text, merged terms.
    pub fn follow_up(&self, terms: ExtractedTerms) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw_text: self.raw_text.clone(),
            device_terms: terms.device_terms,
            location_term: terms.location_term,
            created_at: Utc::now(),
        }
    }

    pub fn terms(&self) -> ExtractedTerms {
        ExtractedTerms {
            device_terms: self.device_terms.clone(),
            location_term: self.location_term.clone(),
        }
    }

    /// Whether the request targets every matching device ("all lights",
    /// "every lamp", "both bedroom lights").
    pub fn wants_all(&self) -> bool {
        let raw = self.raw_text.to_lowercase();
        ["all ", "every ", "both "]
            .iter()
            .any(|kw| raw.contains(kw))
            || raw.ends_with(" all")
    }

    /// Device terms joined into one needle for fuzzy matching.
    pub fn joined_terms(&self) -> String {
        self.device_terms.join(" ").to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(text: &str) -> Query {
        Query::new(
            text,
            ExtractedTerms {
                device_terms: vec!["light".into()],
                location_term: None,
            },
        )
    }

    #[test]
    fn wants_all_detection() {
        assert!(q("turn off all the lights").wants_all());
        assert!(q("every lamp on").wants_all());
        assert!(q("both bedroom lights please").wants_all());
        assert!(!q("the office light").wants_all());
    }

    #[test]
    fn follow_up_keeps_text_new_id() {
        let first = q("the light");
        let next = first.follow_up(ExtractedTerms {
            device_terms: vec!["light".into(), "ceiling".into()],
            location_term: Some("office".into()),
        });
        assert_eq!(next.raw_text, first.raw_text);
        assert_ne!(next.id, first.id);
        assert_eq!(next.location_term.as_deref(), Some("office"));
    }
}
