//! The resolution pipeline.
//!
//! One `Resolver` owns the whole cycle: inventory snapshot → blocking →
//! (shortcut cache) → scoring → ground-truth verification → ambiguity
//! decision, plus the clarification dialog for the ambiguous case and the
//! safety gate for bound plans. Every cycle runs under a single deadline
//! budget; deadline pressure downgrades outcomes, it never skips
//! verification.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use hestia_common::{
    Action, Answer, AutomationPlan, EntityRecord, KnowledgeEntry, KnowledgeOutcome, Query,
    ResolveError, ResolveOutcome, UnresolvedReason, ValidatedPlan,
};

use crate::ambiguity::{decide, Decision};
use crate::collaborators::{DeviceRegistry, Embedder, TermExtractor};
use crate::config::ResolverConfig;
use crate::index::{block, InventorySnapshot};
use crate::safety;
use crate::scoring::score_candidates;
use crate::session::{
    generate_question, merge_answer, FileSessionStore, MemorySessionStore, SessionManager,
};
use crate::shortcut::KnowledgeStore;
use crate::verify::{verify_shortlist, VerificationReport};

/// Internal result of one blocking→verification→decision cycle.
enum CycleOutcome {
    Resolved(Vec<EntityRecord>),
    Ambiguous {
        options: Vec<EntityRecord>,
        pool: Vec<String>,
    },
    Unresolved(UnresolvedReason),
}

/// The entity-resolution engine.
pub struct Resolver {
    config: ResolverConfig,
    registry: Arc<dyn DeviceRegistry>,
    extractor: Arc<dyn TermExtractor>,
    embedder: Arc<dyn Embedder>,
    knowledge: KnowledgeStore,
    sessions: SessionManager,
}

impl Resolver {
    /// Engine with volatile stores. Sessions and learned resolutions do not
    /// survive a restart.
    pub fn new(
        config: ResolverConfig,
        registry: Arc<dyn DeviceRegistry>,
        extractor: Arc<dyn TermExtractor>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let sessions = SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            config.session.clone(),
        );
        Self {
            knowledge: KnowledgeStore::in_memory(),
            sessions,
            config,
            registry,
            extractor,
            embedder,
        }
    }

    /// Engine with file-backed session and knowledge stores under the
    /// configured data directory.
    pub fn with_persistence(
        config: ResolverConfig,
        registry: Arc<dyn DeviceRegistry>,
        extractor: Arc<dyn TermExtractor>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, ResolveError> {
        let data_dir = config.data_dir();
        let knowledge = KnowledgeStore::open(data_dir.join("knowledge"))?;
        let sessions = SessionManager::new(
            Arc::new(FileSessionStore::open(data_dir.join("sessions"))?),
            config.session.clone(),
        );
        Ok(Self {
            knowledge,
            sessions,
            config,
            registry,
            extractor,
            embedder,
        })
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn knowledge(&self) -> &KnowledgeStore {
        &self.knowledge
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Resolve a raw sentence, extracting terms first.
    pub async fn resolve(&self, text: &str) -> Result<ResolveOutcome, ResolveError> {
        let terms = self.extractor.extract(text).await;
        self.resolve_query(Query::new(text, terms)).await
    }

    /// Resolve a query whose terms were already extracted.
    pub async fn resolve_query(&self, query: Query) -> Result<ResolveOutcome, ResolveError> {
        if query.terms().is_empty() {
            warn!(query_id = %query.id, "no usable terms, cannot resolve");
            return Ok(ResolveOutcome::Unresolved {
                reason: UnresolvedReason::NoTerms,
            });
        }
        let deadline = Instant::now() + self.config.deadline();
        match self.run_cycle(&query, None, deadline).await? {
            CycleOutcome::Resolved(entities) => {
                info!(query_id = %query.id, entities = entities.len(), "query resolved");
                Ok(ResolveOutcome::Resolved {
                    query_id: query.id,
                    entities,
                })
            }
            CycleOutcome::Ambiguous { options, pool } => {
                let session = self.sessions.open(&query, &options, pool).await?;
                let questions = session.open_question().into_iter().cloned().collect();
                Ok(ResolveOutcome::Ambiguous {
                    session_id: session.id,
                    questions,
                })
            }
            CycleOutcome::Unresolved(reason) => {
                info!(query_id = %query.id, %reason, "query unresolved");
                Ok(ResolveOutcome::Unresolved { reason })
            }
        }
    }

    /// Submit a clarification answer. Re-runs the cycle scoped to the
    /// session's original candidate pool; the pool is never re-expanded.
    pub async fn answer(
        &self,
        session_id: Uuid,
        answer: Answer,
    ) -> Result<ResolveOutcome, ResolveError> {
        let _guard = self.sessions.try_lock(session_id)?;
        let mut session = self.sessions.load(session_id).await?;
        // A session past its round limit, cancelled or idle-expired needs a
        // fresh query, not a retry.
        if session.status.is_terminal() {
            self.sessions.forget_lock(session_id);
            return Err(ResolveError::SessionExpired { session_id });
        }
        let Some(question) = session.open_question().cloned() else {
            return Err(ResolveError::SessionConflict { session_id });
        };
        session.record_answer(answer.clone())?;

        let origin = session.origin_query();
        let Some(merged) = merge_answer(&origin, &question, &answer) else {
            session.expire()?;
            self.sessions.save(&mut session).await?;
            info!(session_id = %session_id, "clarification cancelled by user");
            return Ok(ResolveOutcome::Unresolved {
                reason: UnresolvedReason::Cancelled,
            });
        };
        let followup = origin.follow_up(merged);
        session.followup_query_id = Some(followup.id);

        let deadline = Instant::now() + self.config.deadline();
        let pool = session.candidate_pool.clone();
        match self.run_cycle(&followup, Some(&pool), deadline).await? {
            CycleOutcome::Resolved(entities) => {
                session.resolve(entities.iter().map(|e| e.entity_id.clone()).collect())?;
                self.sessions.save(&mut session).await?;
                info!(session_id = %session_id, "session resolved");
                Ok(ResolveOutcome::Resolved {
                    query_id: followup.id,
                    entities,
                })
            }
            CycleOutcome::Ambiguous { options, .. } => {
                if session.round >= self.config.session.max_rounds {
                    session.expire()?;
                    self.sessions.save(&mut session).await?;
                    warn!(session_id = %session_id, "round limit reached without separation");
                    return Ok(ResolveOutcome::Unresolved {
                        reason: UnresolvedReason::RoundLimit,
                    });
                }
                let next = generate_question(&options, self.config.session.max_options);
                session.ask(next)?;
                self.sessions.save(&mut session).await?;
                let questions = session.open_question().into_iter().cloned().collect();
                Ok(ResolveOutcome::Ambiguous {
                    session_id,
                    questions,
                })
            }
            CycleOutcome::Unresolved(reason) => {
                session.expire()?;
                self.sessions.save(&mut session).await?;
                Ok(ResolveOutcome::Unresolved { reason })
            }
        }
    }

    /// Run the safety chain over a bound plan.
    pub fn validate(&self, plan: &AutomationPlan) -> Result<ValidatedPlan, ResolveError> {
        safety::validate(plan)
    }

    /// Bind a resolved entity set into a plan skeleton calling `service` on
    /// every resolved entity. `None` unless the outcome is `Resolved`.
    pub fn build_plan(
        &self,
        name: &str,
        service: &str,
        outcome: &ResolveOutcome,
    ) -> Option<AutomationPlan> {
        let ResolveOutcome::Resolved { query_id, entities } = outcome else {
            return None;
        };
        let mut plan = AutomationPlan::new(name, *query_id);
        for entity in entities {
            plan = plan.with_action(Action::new(service, entity.entity_id.clone()));
        }
        Some(plan)
    }

    /// Record a user-confirmed resolution for future shortcut lookups.
    pub async fn record_approval(
        &self,
        query_text: &str,
        entity_ids: Vec<String>,
    ) -> Result<(), ResolveError> {
        self.record_outcome(query_text, entity_ids, KnowledgeOutcome::Approved)
            .await
    }

    /// Record a rejected resolution. A rejection close to a learned entry
    /// vetoes that entry in future lookups; nothing is deleted.
    pub async fn record_rejection(
        &self,
        query_text: &str,
        entity_ids: Vec<String>,
    ) -> Result<(), ResolveError> {
        self.record_outcome(query_text, entity_ids, KnowledgeOutcome::Rejected)
            .await
    }

    /// Maintenance: expire idle clarification sessions.
    pub async fn expire_idle_sessions(&self) -> Result<Vec<Uuid>, ResolveError> {
        self.sessions.expire_idle(Utc::now()).await
    }

    /// Maintenance: apply the knowledge retention policy.
    pub async fn evict_knowledge(&self) -> usize {
        self.knowledge.evict(&self.config.knowledge).await
    }

    async fn record_outcome(
        &self,
        query_text: &str,
        entity_ids: Vec<String>,
        outcome: KnowledgeOutcome,
    ) -> Result<(), ResolveError> {
        let embedding = match self.embedder.embed(query_text).await {
            Ok(v) => v,
            Err(e) => {
                // Learning is best-effort; the confirmed resolution itself
                // already happened.
                warn!(error = %e, "embedding failed, resolution not recorded");
                return Ok(());
            }
        };
        self.knowledge
            .append(KnowledgeEntry::new(query_text, embedding, entity_ids, outcome))
            .await
    }

    async fn run_cycle(
        &self,
        query: &Query,
        pool: Option<&[String]>,
        deadline: Instant,
    ) -> Result<CycleOutcome, ResolveError> {
        let inventory = self
            .registry
            .snapshot()
            .await
            .map_err(ResolveError::registry)?;
        let mut snapshot = InventorySnapshot::new(inventory);
        if let Some(pool) = pool {
            snapshot = snapshot.restricted_to(pool);
        }

        let candidates = block(&snapshot, query);
        if candidates.is_empty() {
            return Ok(CycleOutcome::Unresolved(UnresolvedReason::NoCandidates));
        }

        let query_embedding = self.embed_query(query, deadline).await;

        // Learned shortcuts apply to fresh queries only; clarification
        // re-runs stay inside their candidate pool.
        if pool.is_none() {
            if let Some(embedding) = query_embedding.as_deref() {
                if let Some(outcome) = self.try_shortcut(embedding, &snapshot, deadline).await? {
                    return Ok(outcome);
                }
            }
        }

        let scored = score_candidates(&candidates.entities, query, query_embedding.as_deref());
        let shortlist: Vec<String> = scored
            .iter()
            .take(self.config.verify.top_k)
            .map(|s| s.entity_id.clone())
            .collect();
        let report =
            verify_shortlist(Arc::clone(&self.registry), &shortlist, &self.config.verify, deadline)
                .await?;

        match decide(
            &scored,
            &report,
            query,
            &self.config.thresholds,
            self.config.session.max_options,
        ) {
            Decision::Resolved(ids) => Ok(CycleOutcome::Resolved(records_with_state(
                &snapshot, &ids, &report,
            ))),
            Decision::Ambiguous(top) => {
                let ids: Vec<String> = top.iter().map(|s| s.entity_id.clone()).collect();
                Ok(CycleOutcome::Ambiguous {
                    options: records_with_state(&snapshot, &ids, &report),
                    pool: candidates.ids(),
                })
            }
            Decision::Unresolved => Ok(CycleOutcome::Unresolved(UnresolvedReason::NoCandidates)),
        }
    }

    /// Shortcut path: nearest learned resolution, re-verified before use.
    /// Any failure falls back to full scoring instead of erroring out.
    async fn try_shortcut(
        &self,
        embedding: &[f32],
        snapshot: &InventorySnapshot,
        deadline: Instant,
    ) -> Result<Option<CycleOutcome>, ResolveError> {
        let Some(hit) = self
            .knowledge
            .lookup(embedding, self.config.thresholds.shortcut)
            .await
        else {
            return Ok(None);
        };

        let report = match verify_shortlist(
            Arc::clone(&self.registry),
            &hit.entry.entity_ids,
            &self.config.verify,
            deadline,
        )
        .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(entry_id = %hit.entry.id, error = %e, "shortcut verification failed, scoring instead");
                return Ok(None);
            }
        };

        let all_verified = hit.entry.entity_ids.iter().all(|id| report.is_verified(id));
        let entities = records_with_state(snapshot, &hit.entry.entity_ids, &report);
        if all_verified && entities.len() == hit.entry.entity_ids.len() {
            info!(
                entry_id = %hit.entry.id,
                similarity = hit.similarity,
                "learned shortcut adopted"
            );
            Ok(Some(CycleOutcome::Resolved(entities)))
        } else {
            warn!(entry_id = %hit.entry.id, "shortcut entities failed re-verification, scoring instead");
            Ok(None)
        }
    }

    /// Query embedding with its own timeout under the cycle deadline.
    /// Failure degrades the embedding signal to zero, never the cycle.
    async fn embed_query(&self, query: &Query, deadline: Instant) -> Option<Vec<f32>> {
        let call_deadline = deadline.min(
            Instant::now() + Duration::from_millis(self.config.verify.call_timeout_ms),
        );
        match timeout_at(call_deadline, self.embedder.embed(&query.raw_text)).await {
            Ok(Ok(vector)) => Some(vector),
            Ok(Err(e)) => {
                warn!(query_id = %query.id, error = %e, "embedding failed, scoring without it");
                None
            }
            Err(_) => {
                warn!(query_id = %query.id, "embedding timed out, scoring without it");
                None
            }
        }
    }
}

/// Snapshot records for `ids`, carrying the state verification reported.
fn records_with_state(
    snapshot: &InventorySnapshot,
    ids: &[String],
    report: &VerificationReport,
) -> Vec<EntityRecord> {
    ids.iter()
        .filter_map(|id| snapshot.entities.iter().find(|e| e.entity_id == *id))
        .cloned()
        .map(|mut entity| {
            if let Some(verified) = report
                .verified
                .iter()
                .find(|v| v.entity_id == entity.entity_id)
            {
                entity.last_state = Some(verified.state.clone());
            }
            entity
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FakeDeviceRegistry, FakeEmbedder, FakeTermExtractor};
    use hestia_common::query::ExtractedTerms;
    use hestia_common::Domain;

    fn inventory() -> Vec<EntityRecord> {
        vec![
            EntityRecord::new("light.office_ceiling", Domain::Light, "Office Ceiling")
                .with_area("office")
                .with_alias("office light")
                .with_embedding(vec![1.0, 0.0]),
            EntityRecord::new("light.kitchen_ceiling", Domain::Light, "Kitchen Ceiling")
                .with_area("kitchen")
                .with_embedding(vec![0.0, 1.0]),
        ]
    }

    fn resolver(registry: FakeDeviceRegistry, extractor: FakeTermExtractor) -> Resolver {
        Resolver::new(
            ResolverConfig::default(),
            Arc::new(registry),
            Arc::new(extractor),
            Arc::new(FakeEmbedder::new().with_vector("the office light", vec![1.0, 0.0])),
        )
    }

    #[tokio::test]
    async fn unambiguous_query_resolves_directly() {
        let extractor = FakeTermExtractor::new().with_default(ExtractedTerms {
            device_terms: vec!["office".into(), "light".into()],
            location_term: Some("office".into()),
        });
        let r = resolver(FakeDeviceRegistry::new(inventory()), extractor);
        let outcome = r.resolve("the office light").await.unwrap();
        assert_eq!(outcome.entity_ids(), vec!["light.office_ceiling"]);
        // Verified state travels with the record
        match outcome {
            ResolveOutcome::Resolved { entities, .. } => {
                assert!(entities[0].last_state.is_some());
            }
            other => panic!("expected resolved, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_extraction_is_unresolved_not_an_error() {
        let r = resolver(
            FakeDeviceRegistry::new(inventory()),
            FakeTermExtractor::failing(),
        );
        let outcome = r.resolve("mumble").await.unwrap();
        assert_eq!(
            outcome,
            ResolveOutcome::Unresolved {
                reason: UnresolvedReason::NoTerms
            }
        );
    }

    #[tokio::test]
    async fn build_plan_requires_a_resolution() {
        let r = resolver(FakeDeviceRegistry::new(inventory()), FakeTermExtractor::new());
        let unresolved = ResolveOutcome::Unresolved {
            reason: UnresolvedReason::NoCandidates,
        };
        assert!(r.build_plan("p", "light.turn_on", &unresolved).is_none());

        let resolved = ResolveOutcome::Resolved {
            query_id: Uuid::new_v4(),
            entities: inventory(),
        };
        let plan = r.build_plan("p", "light.turn_on", &resolved).unwrap();
        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.actions[0].service, "light.turn_on");
    }
}
