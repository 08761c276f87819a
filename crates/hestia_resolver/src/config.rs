//! Engine configuration.
//!
//! Loads settings from a TOML file or uses defaults. Every threshold the
//! pipeline consults lives here so installations can tune per-domain
//! behavior without a rebuild.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hestia_common::Domain;

/// Confidence thresholds for the ambiguity decision and the shortcut cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Minimum top score for a direct resolution
    #[serde(default = "default_high_confidence")]
    pub high_confidence: f32,

    /// Minimum margin over the runner-up for a direct resolution
    #[serde(default = "default_separation")]
    pub separation: f32,

    /// Minimum cosine similarity to adopt a learned resolution
    #[serde(default = "default_shortcut")]
    pub shortcut: f32,

    /// Per-domain overrides of `high_confidence`, keyed by domain name.
    /// Safety-relevant domains (locks, covers) typically demand more.
    #[serde(default)]
    pub per_domain_confidence: HashMap<String, f32>,
}

fn default_high_confidence() -> f32 {
    0.80
}

fn default_separation() -> f32 {
    0.10
}

fn default_shortcut() -> f32 {
    0.85
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            high_confidence: default_high_confidence(),
            separation: default_separation(),
            shortcut: default_shortcut(),
            per_domain_confidence: HashMap::new(),
        }
    }
}

impl ThresholdConfig {
    /// Confidence threshold for a domain, honoring per-domain overrides.
    pub fn confidence_for(&self, domain: Option<Domain>) -> f32 {
        domain
            .and_then(|d| self.per_domain_confidence.get(d.as_str()))
            .copied()
            .unwrap_or(self.high_confidence)
    }
}

/// Ground-truth verification limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Shortlist size handed to the verifier
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Concurrent registry calls
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Backoff before the single transport-error retry
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// A state older than this does not count as ground truth
    #[serde(default = "default_max_state_age_secs")]
    pub max_state_age_secs: i64,
}

fn default_top_k() -> usize {
    5
}

fn default_concurrency() -> usize {
    8
}

fn default_call_timeout_ms() -> u64 {
    1_500
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_max_state_age_secs() -> i64 {
    300
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            concurrency: default_concurrency(),
            call_timeout_ms: default_call_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_state_age_secs: default_max_state_age_secs(),
        }
    }
}

/// Clarification session limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum clarification rounds before the session expires
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Idle window after which an unanswered session expires
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: i64,

    /// Candidates offered per clarification question
    #[serde(default = "default_max_options")]
    pub max_options: usize,
}

fn default_max_rounds() -> u32 {
    3
}

fn default_idle_timeout_secs() -> i64 {
    900
}

fn default_max_options() -> usize {
    4
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_options: default_max_options(),
        }
    }
}

/// Knowledge store retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Entries older than this are eligible for eviction
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,

    /// Size cap; oldest entries go first
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_max_age_days() -> i64 {
    180
}

fn default_max_entries() -> usize {
    2_000
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            max_entries: default_max_entries(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub thresholds: ThresholdConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    /// End-to-end deadline for one resolution cycle, milliseconds
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    /// Data directory for sessions and knowledge entries.
    /// Defaults to `<data_dir>/hestia`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_deadline_ms() -> u64 {
    5_000
}

// The serde attribute on `deadline_ms` only covers deserialization; the
// programmatic default needs the same non-zero budget.
impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdConfig::default(),
            verify: VerifyConfig::default(),
            session: SessionConfig::default(),
            knowledge: KnowledgeConfig::default(),
            deadline_ms: default_deadline_ms(),
            data_dir: None,
        }
    }
}

impl ResolverConfig {
    /// Load from `path`, falling back to defaults on a missing or broken
    /// file. Startup never fails on configuration.
    pub fn load_or_default(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => match toml::from_str::<Self>(&raw) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded resolver config");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "config parse failed, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
        }
    }

    /// Resolved data directory for persisted sessions and knowledge.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("hestia")
        })
    }

    pub fn deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.deadline_ms)
    }
}
