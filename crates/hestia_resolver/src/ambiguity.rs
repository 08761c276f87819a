//! Ambiguity detector / confidence calculator.
//!
//! Applies the threshold/margin decision rule to the verified shortlist.
//! Thresholds come from configuration so safety-relevant domains can demand
//! higher confidence.

use tracing::debug;

use hestia_common::{Domain, Query};

use crate::config::ThresholdConfig;
use crate::scoring::CandidateScore;
use crate::verify::VerificationReport;

/// Decision over a verified, scored shortlist.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Confident match: the entity ids to bind
    Resolved(Vec<String>),
    /// Uncertain: the top candidates to clarify among, best first
    Ambiguous(Vec<CandidateScore>),
    /// Nothing survived blocking and verification
    Unresolved,
}

/// Decide between direct resolution, clarification and giving up.
///
/// Only verified candidates participate. `max_options` caps the candidate
/// list carried into a clarification round.
pub fn decide(
    scores: &[CandidateScore],
    report: &VerificationReport,
    query: &Query,
    thresholds: &ThresholdConfig,
    max_options: usize,
) -> Decision {
    let verified: Vec<&CandidateScore> = scores
        .iter()
        .filter(|s| report.is_verified(&s.entity_id))
        .collect();

    let Some(top) = verified.first() else {
        return Decision::Unresolved;
    };

    let domain = Domain::from_entity_id(&top.entity_id);
    let confidence = thresholds.confidence_for(domain);
    let margin = verified
        .get(1)
        .map(|second| top.total - second.total)
        .unwrap_or(f32::MAX);

    debug!(
        top = %top.entity_id,
        score = top.total,
        margin,
        confidence,
        "ambiguity decision inputs"
    );

    if query.wants_all() {
        // "all office lights": return every verified candidate that clears
        // the confidence bar; margin between set members is irrelevant.
        let set: Vec<String> = verified
            .iter()
            .filter(|s| s.total >= confidence)
            .map(|s| s.entity_id.clone())
            .collect();
        if !set.is_empty() {
            return Decision::Resolved(set);
        }
    } else if top.total >= confidence && margin >= thresholds.separation {
        return Decision::Resolved(vec![top.entity_id.clone()]);
    }

    Decision::Ambiguous(
        verified
            .into_iter()
            .take(max_options.max(2))
            .cloned()
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::SignalScores;
    use crate::verify::{VerificationReport, VerifiedEntity};
    use chrono::Utc;
    use hestia_common::query::ExtractedTerms;
    use hestia_common::StateSnapshot;

    fn score(id: &str, total: f32) -> CandidateScore {
        CandidateScore {
            entity_id: id.into(),
            signals: SignalScores::default(),
            total,
            rank: 0,
        }
    }

    fn verified(ids: &[&str]) -> VerificationReport {
        VerificationReport {
            verified: ids
                .iter()
                .map(|id| VerifiedEntity {
                    entity_id: id.to_string(),
                    state: StateSnapshot::new("on", Utc::now()),
                })
                .collect(),
            dropped: vec![],
        }
    }

    fn query(raw: &str) -> Query {
        Query::new(
            raw,
            ExtractedTerms {
                device_terms: vec!["light".into()],
                location_term: None,
            },
        )
    }

    #[test]
    fn confident_separated_top_resolves() {
        let scores = vec![score("light.a", 0.88), score("light.b", 0.40)];
        let d = decide(
            &scores,
            &verified(&["light.a", "light.b"]),
            &query("office light"),
            &ThresholdConfig::default(),
            4,
        );
        assert_eq!(d, Decision::Resolved(vec!["light.a".into()]));
    }

    #[test]
    fn narrow_margin_is_ambiguous() {
        let scores = vec![score("light.a", 0.85), score("light.b", 0.82)];
        let d = decide(
            &scores,
            &verified(&["light.a", "light.b"]),
            &query("bedroom light"),
            &ThresholdConfig::default(),
            4,
        );
        match d {
            Decision::Ambiguous(options) => assert_eq!(options.len(), 2),
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn low_top_score_is_ambiguous() {
        let scores = vec![score("light.a", 0.55), score("light.b", 0.20)];
        let d = decide(
            &scores,
            &verified(&["light.a", "light.b"]),
            &query("light"),
            &ThresholdConfig::default(),
            4,
        );
        assert!(matches!(d, Decision::Ambiguous(_)));
    }

    #[test]
    fn empty_verified_shortlist_is_unresolved() {
        let scores = vec![score("light.a", 0.95)];
        let d = decide(
            &scores,
            &verified(&[]),
            &query("light"),
            &ThresholdConfig::default(),
            4,
        );
        assert_eq!(d, Decision::Unresolved);
    }

    #[test]
    fn single_verified_candidate_has_infinite_margin() {
        let scores = vec![score("light.a", 0.85)];
        let d = decide(
            &scores,
            &verified(&["light.a"]),
            &query("light"),
            &ThresholdConfig::default(),
            4,
        );
        assert_eq!(d, Decision::Resolved(vec!["light.a".into()]));
    }

    #[test]
    fn wants_all_returns_the_confident_set() {
        let scores = vec![
            score("light.a", 0.88),
            score("light.b", 0.85),
            score("light.c", 0.30),
        ];
        let d = decide(
            &scores,
            &verified(&["light.a", "light.b", "light.c"]),
            &query("all bedroom lights"),
            &ThresholdConfig::default(),
            4,
        );
        assert_eq!(
            d,
            Decision::Resolved(vec!["light.a".into(), "light.b".into()])
        );
    }

    #[test]
    fn per_domain_override_raises_the_bar() {
        let mut thresholds = ThresholdConfig::default();
        thresholds
            .per_domain_confidence
            .insert("lock".into(), 0.95);
        let scores = vec![score("lock.front", 0.88)];
        let d = decide(
            &scores,
            &verified(&["lock.front"]),
            &query("front lock"),
            &thresholds,
            4,
        );
        assert!(matches!(d, Decision::Ambiguous(_)));
    }

    #[test]
    fn unverified_top_candidate_is_ignored() {
        let scores = vec![score("light.ghost", 0.99), score("light.real", 0.85)];
        let d = decide(
            &scores,
            &verified(&["light.real"]),
            &query("light"),
            &ThresholdConfig::default(),
            4,
        );
        assert_eq!(d, Decision::Resolved(vec!["light.real".into()]));
    }
}
