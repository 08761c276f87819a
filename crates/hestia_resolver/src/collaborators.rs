//! Collaborator trait abstractions.
//!
//! The engine never talks to a language model, device registry or embedding
//! backend directly; it goes through these traits. Production code plugs in
//! real clients, tests plug in the fakes below with pre-configured responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use hestia_common::query::ExtractedTerms;
use hestia_common::{EntityRecord, StateSnapshot};

/// Extracts device/location terms from a raw sentence.
/// Backed by a language model in production; failures degrade to empty
/// terms, which the pipeline turns into `unresolved`.
#[async_trait]
pub trait TermExtractor: Send + Sync {
    async fn extract(&self, query_text: &str) -> ExtractedTerms;
}

/// Registry answer for a single entity id.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryResponse {
    Found(StateSnapshot),
    NotFound,
}

/// Transport-level registry failure. Distinct from `NotFound`, which is a
/// successful answer.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("registry unreachable: {0}")]
pub struct RegistryError(pub String);

/// Live device registry: the source of inventory snapshots and of
/// ground truth during verification.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Full inventory snapshot, refreshed at the start of each cycle.
    async fn snapshot(&self) -> Result<Vec<EntityRecord>, RegistryError>;

    /// Current state of one entity by exact id.
    async fn get_state(&self, entity_id: &str) -> Result<RegistryResponse, RegistryError>;
}

/// Text embedding backend, shared by query scoring and the knowledge store.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

// ============================================================================
// Fakes for deterministic testing
// ============================================================================

/// Fake extractor returning canned terms per input text, with a default.
#[derive(Default)]
pub struct FakeTermExtractor {
    responses: HashMap<String, ExtractedTerms>,
    default: ExtractedTerms,
}

impl FakeTermExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extractor that always fails (empty term set).
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, text: &str, terms: ExtractedTerms) -> Self {
        self.responses.insert(text.to_string(), terms);
        self
    }

    pub fn with_default(mut self, terms: ExtractedTerms) -> Self {
        self.default = terms;
        self
    }
}

#[async_trait]
impl TermExtractor for FakeTermExtractor {
    async fn extract(&self, query_text: &str) -> ExtractedTerms {
        self.responses
            .get(query_text)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Per-entity behavior override for the fake registry.
#[derive(Debug, Clone)]
enum StateOverride {
    NotFound,
    Unreachable,
    StaleSecs(i64),
}

/// Fake registry serving a fixed inventory. By default every inventory
/// entity answers `get_state` with a fresh "on" snapshot; individual ids can
/// be overridden to be missing, unreachable or stale.
pub struct FakeDeviceRegistry {
    inventory: Vec<EntityRecord>,
    overrides: HashMap<String, StateOverride>,
    snapshot_fails: bool,
    all_unreachable: bool,
    state_calls: Arc<Mutex<HashMap<String, usize>>>,
}

impl FakeDeviceRegistry {
    pub fn new(inventory: Vec<EntityRecord>) -> Self {
        Self {
            inventory,
            overrides: HashMap::new(),
            snapshot_fails: false,
            all_unreachable: false,
            state_calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn not_found(mut self, entity_id: &str) -> Self {
        self.overrides
            .insert(entity_id.to_string(), StateOverride::NotFound);
        self
    }

    pub fn unreachable(mut self, entity_id: &str) -> Self {
        self.overrides
            .insert(entity_id.to_string(), StateOverride::Unreachable);
        self
    }

    pub fn stale(mut self, entity_id: &str, age_secs: i64) -> Self {
        self.overrides
            .insert(entity_id.to_string(), StateOverride::StaleSecs(age_secs));
        self
    }

    /// Every call, snapshot included, fails with a transport error.
    pub fn all_unreachable(mut self) -> Self {
        self.snapshot_fails = true;
        self.all_unreachable = true;
        self
    }

    pub fn state_call_count(&self, entity_id: &str) -> usize {
        self.state_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(entity_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl DeviceRegistry for FakeDeviceRegistry {
    async fn snapshot(&self) -> Result<Vec<EntityRecord>, RegistryError> {
        if self.snapshot_fails {
            return Err(RegistryError("connection refused".into()));
        }
        Ok(self.inventory.clone())
    }

    async fn get_state(&self, entity_id: &str) -> Result<RegistryResponse, RegistryError> {
        {
            let mut calls = self.state_calls.lock().unwrap_or_else(|e| e.into_inner());
            *calls.entry(entity_id.to_string()).or_insert(0) += 1;
        }
        if self.all_unreachable {
            return Err(RegistryError("connection refused".into()));
        }
        match self.overrides.get(entity_id) {
            Some(StateOverride::Unreachable) => Err(RegistryError("connection refused".into())),
            Some(StateOverride::NotFound) => Ok(RegistryResponse::NotFound),
            Some(StateOverride::StaleSecs(age)) => Ok(RegistryResponse::Found(
                StateSnapshot::new("on", Utc::now() - chrono::Duration::seconds(*age)),
            )),
            None => {
                if self.inventory.iter().any(|e| e.entity_id == entity_id) {
                    Ok(RegistryResponse::Found(StateSnapshot::new("on", Utc::now())))
                } else {
                    Ok(RegistryResponse::NotFound)
                }
            }
        }
    }
}

/// Fake embedder with canned vectors per text. Unknown texts hash to a
/// deterministic pseudo-embedding so similarity stays stable across runs.
#[derive(Default)]
pub struct FakeEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    fails: bool,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            vectors: HashMap::new(),
            fails: true,
        }
    }

    pub fn with_vector(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    fn pseudo_embedding(text: &str) -> Vec<f32> {
        // Stable 8-dim vector from byte sums; good enough for tests that
        // only need determinism, not semantics.
        let mut v = vec![0.0f32; 8];
        for (i, b) in text.bytes().enumerate() {
            v[i % 8] += f32::from(b) / 255.0;
        }
        crate::vector::normalize(v)
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        if self.fails {
            anyhow::bail!("embedding backend unavailable");
        }
        Ok(self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| Self::pseudo_embedding(text)))
    }
}
