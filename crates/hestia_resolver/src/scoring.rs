//! Multi-signal candidate scorer.
//!
//! Each scoring signal is one entry in an ordered table of the same function
//! shape; the total is their weighted sum. Deterministic for a fixed
//! snapshot and query: no randomness, and a missing embedding scores 0 on
//! the embedding signal instead of erroring.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use hestia_common::{EntityRecord, Query};

use crate::vector::cosine_unit;

/// Everything one signal may look at.
pub struct SignalInput<'a> {
    pub query: &'a Query,
    pub entity: &'a EntityRecord,
    pub query_embedding: Option<&'a [f32]>,
}

/// The five named subscores, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SignalScores {
    pub embedding: f32,
    pub exact: f32,
    pub fuzzy: f32,
    pub numbered: f32,
    pub location: f32,
}

impl SignalScores {
    /// Tie-break ordering: exact > embedding > fuzzy > numbered > location.
    fn priority_key(&self) -> [f32; 5] {
        [
            self.exact,
            self.embedding,
            self.fuzzy,
            self.numbered,
            self.location,
        ]
    }
}

/// Scored candidate, ranked within one query. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScore {
    pub entity_id: String,
    pub signals: SignalScores,
    pub total: f32,
    /// 1-based rank after sorting
    pub rank: usize,
}

type SignalFn = fn(&SignalInput<'_>) -> f32;

/// The ordered signal table. Weights sum to 1.0.
const SIGNALS: &[(&str, f32, SignalFn)] = &[
    ("embedding", 0.35, signal_embedding),
    ("exact", 0.30, signal_exact),
    ("fuzzy", 0.15, signal_fuzzy),
    ("numbered", 0.15, signal_numbered),
    ("location", 0.05, signal_location),
];

fn signal_embedding(input: &SignalInput<'_>) -> f32 {
    match (input.query_embedding, input.entity.embedding.as_deref()) {
        (Some(q), Some(e)) => cosine_unit(q, e),
        _ => 0.0,
    }
}

fn signal_exact(input: &SignalInput<'_>) -> f32 {
    let needles = [
        input.query.raw_text.trim().to_lowercase(),
        input.query.joined_terms(),
    ];
    let entity = input.entity;
    let haystacks: Vec<String> = std::iter::once(entity.entity_id.to_lowercase())
        .chain(std::iter::once(entity.name.to_lowercase()))
        .chain(entity.aliases.iter().map(|a| a.to_lowercase()))
        .collect();
    for needle in &needles {
        if !needle.is_empty() && haystacks.iter().any(|h| h == needle) {
            return 1.0;
        }
    }
    0.0
}

fn signal_fuzzy(input: &SignalInput<'_>) -> f32 {
    let needle = input.query.joined_terms();
    if needle.is_empty() {
        return 0.0;
    }
    let entity = input.entity;
    std::iter::once(entity.name.as_str())
        .chain(entity.aliases.iter().map(|a| a.as_str()))
        .map(|hay| strsim::normalized_levenshtein(&needle, &hay.to_lowercase()) as f32)
        .fold(0.0, f32::max)
}

fn signal_numbered(input: &SignalInput<'_>) -> f32 {
    let q = last_numeral(&input.query.raw_text)
        .or_else(|| last_numeral(&input.query.joined_terms()));
    let c = last_numeral(&input.entity.name)
        .or_else(|| last_numeral(&input.entity.entity_id));
    match (q, c) {
        (Some(a), Some(b)) if a == b => 1.0,
        _ => 0.0,
    }
}

fn signal_location(input: &SignalInput<'_>) -> f32 {
    match &input.query.location_term {
        Some(location) if input.entity.area_matches(location) => 1.0,
        _ => 0.0,
    }
}

/// Trailing or positional numeral in a phrase ("bedroom light 1" → 1).
fn last_numeral(text: &str) -> Option<u32> {
    static NUMERAL: OnceLock<Regex> = OnceLock::new();
    let re = NUMERAL.get_or_init(|| Regex::new(r"(\d+)").unwrap());
    re.find_iter(text).last()?.as_str().parse().ok()
}

/// Score one candidate against the query.
pub fn score_candidate(input: &SignalInput<'_>) -> (SignalScores, f32) {
    let mut scores = SignalScores::default();
    let mut total = 0.0;
    for (name, weight, eval) in SIGNALS {
        let sub = eval(input).clamp(0.0, 1.0);
        total += weight * sub;
        match *name {
            "embedding" => scores.embedding = sub,
            "exact" => scores.exact = sub,
            "fuzzy" => scores.fuzzy = sub,
            "numbered" => scores.numbered = sub,
            "location" => scores.location = sub,
            _ => unreachable!("unknown signal"),
        }
    }
    (scores, total)
}

/// Score and rank every candidate, descending by weighted total.
/// Ties break by signal priority, then entity id, for full determinism.
pub fn score_candidates(
    candidates: &[EntityRecord],
    query: &Query,
    query_embedding: Option<&[f32]>,
) -> Vec<CandidateScore> {
    let mut scored: Vec<CandidateScore> = candidates
        .iter()
        .map(|entity| {
            let input = SignalInput {
                query,
                entity,
                query_embedding,
            };
            let (signals, total) = score_candidate(&input);
            CandidateScore {
                entity_id: entity.entity_id.clone(),
                signals,
                total,
                rank: 0,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.total
            .partial_cmp(&a.total)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let ka = a.signals.priority_key();
                let kb = b.signals.priority_key();
                kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });

    for (i, s) in scored.iter_mut().enumerate() {
        s.rank = i + 1;
    }
    scored
}
