//! Clarification session manager.
//!
//! Owns the multi-turn protocol: session persistence with optimistic
//! versioning, per-session exclusive access, question generation from the
//! distinguishing attribute among candidates, and idle expiry. The session
//! id is the serialization key: a concurrent answer to the same session is
//! rejected with a conflict, never merged.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use hestia_common::query::ExtractedTerms;
use hestia_common::{
    Answer, ClarificationSession, EntityRecord, Query, Question, QuestionOption, ResolveError,
    KEY_OTHER,
};

use crate::config::SessionConfig;

/// Session persistence seam. Writes are optimistic: `save` fails with a
/// conflict when the stored version no longer matches the one the caller
/// read, and bumps the version on success.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: Uuid) -> Result<ClarificationSession, ResolveError>;
    async fn save(&self, session: &mut ClarificationSession) -> Result<(), ResolveError>;
    async fn list_ids(&self) -> Result<Vec<Uuid>, ResolveError>;
}

/// In-memory store for tests and ephemeral installations.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, ClarificationSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: Uuid) -> Result<ClarificationSession, ResolveError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ResolveError::SessionNotFound { session_id: id })
    }

    async fn save(&self, session: &mut ClarificationSession) -> Result<(), ResolveError> {
        let mut sessions = self.sessions.write().await;
        if let Some(stored) = sessions.get(&session.id) {
            if stored.version != session.version {
                return Err(ResolveError::SessionConflict {
                    session_id: session.id,
                });
            }
        }
        session.version += 1;
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>, ResolveError> {
        Ok(self.sessions.read().await.keys().copied().collect())
    }
}

/// File-backed store, one JSON document per session.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn open(dir: PathBuf) -> Result<Self, ResolveError> {
        fs::create_dir_all(&dir).map_err(ResolveError::store)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, id: Uuid) -> Result<ClarificationSession, ResolveError> {
        let raw = fs::read_to_string(self.path_for(id))
            .map_err(|_| ResolveError::SessionNotFound { session_id: id })?;
        serde_json::from_str(&raw).map_err(ResolveError::store)
    }

    async fn save(&self, session: &mut ClarificationSession) -> Result<(), ResolveError> {
        // Optimistic check against the stored version
        if let Ok(raw) = fs::read_to_string(self.path_for(session.id)) {
            if let Ok(stored) = serde_json::from_str::<ClarificationSession>(&raw) {
                if stored.version != session.version {
                    return Err(ResolveError::SessionConflict {
                        session_id: session.id,
                    });
                }
            }
        }
        session.version += 1;
        let path = self.path_for(session.id);
        let tmp = self.dir.join(format!("{}.json.tmp", session.id));
        let raw = serde_json::to_string_pretty(session).map_err(ResolveError::store)?;
        fs::write(&tmp, raw).map_err(ResolveError::store)?;
        fs::rename(&tmp, &path).map_err(ResolveError::store)?;
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>, ResolveError> {
        let mut ids = vec![];
        for dirent in fs::read_dir(&self.dir).map_err(ResolveError::store)? {
            let path = dirent.map_err(ResolveError::store)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = stem.parse() {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

/// Generate the clarification question for a candidate set.
///
/// Asks about the attribute that actually distinguishes the candidates:
/// their areas when those differ, otherwise their names.
pub fn generate_question(candidates: &[EntityRecord], max_options: usize) -> Question {
    let mut areas: Vec<&str> = candidates
        .iter()
        .filter_map(|e| e.area.as_deref())
        .collect();
    areas.sort_unstable();
    areas.dedup();

    let max_options = max_options.clamp(2, (KEY_OTHER - 1) as usize);

    if areas.len() > 1 {
        let options: Vec<QuestionOption> = areas
            .iter()
            .take(max_options)
            .enumerate()
            .map(|(i, area)| QuestionOption::new(i as u8 + 1, *area))
            .collect();
        Question::new("Which area did you mean?", options)
    } else {
        let options: Vec<QuestionOption> = candidates
            .iter()
            .take(max_options)
            .enumerate()
            .map(|(i, e)| QuestionOption::for_entity(i as u8 + 1, e.name.clone(), e.entity_id.clone()))
            .collect();
        let labels: Vec<&str> = candidates
            .iter()
            .take(max_options)
            .map(|e| e.name.as_str())
            .collect();
        Question::new(
            format!("Did you mean {}?", labels.join(" or ")),
            options,
        )
    }
}

/// Merge a clarification answer back into the origin query's terms.
///
/// Area answers replace the location term; everything else appends to the
/// device terms. Returns `None` for a cancel answer.
pub fn merge_answer(query: &Query, question: &Question, answer: &Answer) -> Option<ExtractedTerms> {
    if answer.is_cancel() {
        return None;
    }
    let mut terms = query.terms();

    if let Some(text) = &answer.text {
        for word in text.split_whitespace() {
            terms.device_terms.push(word.to_lowercase());
        }
        return Some(terms);
    }

    let key = answer.selected_key?;
    if key == KEY_OTHER {
        // "Other" without accompanying text adds nothing to the terms.
        return Some(terms);
    }
    let option = question.option_for_key(key)?;
    if option.entity_id.is_some() {
        // The label names a specific device; its words sharpen the terms.
        for word in option.label.split_whitespace() {
            let w = word.to_lowercase();
            if !terms.device_terms.contains(&w) {
                terms.device_terms.push(w);
            }
        }
    } else {
        // An area label answers the "which area" question.
        terms.location_term = Some(option.label.to_lowercase());
    }
    Some(terms)
}

/// The session manager: persistence plus per-session serialization.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
    locks: std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self {
            store,
            config,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a session for an ambiguous query, ask the first question and
    /// persist it in `awaiting_answer`.
    pub async fn open(
        &self,
        origin: &Query,
        candidates: &[EntityRecord],
        pool: Vec<String>,
    ) -> Result<ClarificationSession, ResolveError> {
        let mut session = ClarificationSession::new(origin, pool);
        let question = generate_question(candidates, self.config.max_options);
        session.ask(question)?;
        self.store.save(&mut session).await?;
        info!(session_id = %session.id, query_id = %origin.id, "clarification session opened");
        Ok(session)
    }

    /// Acquire the per-session lock without waiting. A second concurrent
    /// answer fails fast with `SessionConflict` instead of queueing behind
    /// the first.
    pub fn try_lock(&self, id: Uuid) -> Result<OwnedMutexGuard<()>, ResolveError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        lock.try_lock_owned()
            .map_err(|_| ResolveError::SessionConflict { session_id: id })
    }

    pub async fn load(&self, id: Uuid) -> Result<ClarificationSession, ResolveError> {
        self.store.load(id).await
    }

    pub async fn save(&self, session: &mut ClarificationSession) -> Result<(), ResolveError> {
        self.store.save(session).await?;
        if session.status.is_terminal() {
            // Terminal sessions take no further answers; their lock entry
            // would otherwise sit in the table forever.
            self.forget_lock(session.id);
        }
        Ok(())
    }

    pub(crate) fn forget_lock(&self, id: Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(&id);
    }

    /// Maintenance pass: expire sessions idle past the configured window.
    /// Skips sessions whose lock is currently held — a late answer in
    /// flight wins over the sweeper, never both.
    pub async fn expire_idle(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, ResolveError> {
        let mut expired = vec![];
        for id in self.store.list_ids().await? {
            let Ok(_guard) = self.try_lock(id) else {
                continue;
            };
            let mut session = match self.store.load(id).await {
                Ok(s) => s,
                Err(_) => continue,
            };
            if session.status.is_terminal() {
                // try_lock just re-created an entry for a session that will
                // never be answered again
                self.forget_lock(id);
                continue;
            }
            if session.idle_secs(now) > self.config.idle_timeout_secs {
                session.expire()?;
                self.save(&mut session).await?;
                warn!(session_id = %id, "session expired after idle timeout");
                expired.push(id);
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hestia_common::{Domain, SessionStatus};

    fn candidates() -> Vec<EntityRecord> {
        vec![
            EntityRecord::new("light.bedroom_ceiling", Domain::Light, "Ceiling Light")
                .with_area("bedroom"),
            EntityRecord::new("light.bedroom_lamp", Domain::Light, "Bedside Lamp")
                .with_area("bedroom"),
        ]
    }

    fn query() -> Query {
        Query::new(
            "the bedroom light",
            ExtractedTerms {
                device_terms: vec!["bedroom".into(), "light".into()],
                location_term: Some("bedroom".into()),
            },
        )
    }

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(MemorySessionStore::new()), SessionConfig::default())
    }

    #[test]
    fn same_area_candidates_ask_by_name() {
        let q = generate_question(&candidates(), 4);
        assert!(q.text.contains("Ceiling Light"));
        assert!(q.text.contains("Bedside Lamp"));
        assert_eq!(q.option_for_key(1).unwrap().entity_id.as_deref(), Some("light.bedroom_ceiling"));
    }

    #[test]
    fn distinct_areas_ask_by_area() {
        let cs = vec![
            EntityRecord::new("light.office", Domain::Light, "Ceiling").with_area("office"),
            EntityRecord::new("light.kitchen", Domain::Light, "Ceiling").with_area("kitchen"),
        ];
        let q = generate_question(&cs, 4);
        assert_eq!(q.text, "Which area did you mean?");
        let labels: Vec<&str> = q.options.iter().map(|o| o.label.as_str()).collect();
        assert!(labels.contains(&"kitchen") && labels.contains(&"office"));
    }

    #[test]
    fn merge_entity_answer_appends_device_terms() {
        let q = generate_question(&candidates(), 4);
        let answer = Answer::key(q.id, 2);
        let terms = merge_answer(&query(), &q, &answer).unwrap();
        assert!(terms.device_terms.contains(&"bedside".to_string()));
        assert_eq!(terms.location_term.as_deref(), Some("bedroom"));
    }

    #[test]
    fn merge_area_answer_replaces_location() {
        let cs = vec![
            EntityRecord::new("light.office", Domain::Light, "Ceiling").with_area("office"),
            EntityRecord::new("light.kitchen", Domain::Light, "Ceiling").with_area("kitchen"),
        ];
        let q = generate_question(&cs, 4);
        let key = q
            .options
            .iter()
            .find(|o| o.label == "office")
            .unwrap()
            .key;
        let terms = merge_answer(&query(), &q, &Answer::key(q.id, key)).unwrap();
        assert_eq!(terms.location_term.as_deref(), Some("office"));
    }

    #[test]
    fn merge_free_text_appends_words() {
        let q = generate_question(&candidates(), 4);
        let terms =
            merge_answer(&query(), &q, &Answer::free_text(q.id, "the reading lamp")).unwrap();
        assert!(terms.device_terms.contains(&"reading".to_string()));
    }

    #[test]
    fn cancel_answer_merges_to_none() {
        let q = generate_question(&candidates(), 4);
        assert!(merge_answer(&query(), &q, &Answer::key(q.id, 0)).is_none());
    }

    #[tokio::test]
    async fn open_persists_awaiting_session() {
        let m = manager();
        let q = query();
        let session = m
            .open(&q, &candidates(), vec!["light.bedroom_ceiling".into()])
            .await
            .unwrap();
        let loaded = m.load(session.id).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::AwaitingAnswer);
        assert_eq!(loaded.origin_query_id, q.id);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn try_lock_rejects_concurrent_holders() {
        let m = manager();
        let id = Uuid::new_v4();
        let guard = m.try_lock(id).unwrap();
        let err = m.try_lock(id).unwrap_err();
        assert!(matches!(err, ResolveError::SessionConflict { .. }));
        drop(guard);
        assert!(m.try_lock(id).is_ok());
    }

    #[tokio::test]
    async fn optimistic_version_check_detects_races() {
        let m = manager();
        let session = m
            .open(&query(), &candidates(), vec![])
            .await
            .unwrap();

        // Two readers load the same version; the second save conflicts.
        let mut a = m.load(session.id).await.unwrap();
        let mut b = m.load(session.id).await.unwrap();
        m.save(&mut a).await.unwrap();
        let err = m.save(&mut b).await.unwrap_err();
        assert!(matches!(err, ResolveError::SessionConflict { .. }));
    }

    #[tokio::test]
    async fn idle_sessions_expire_and_terminal_ones_are_left_alone() {
        let store = Arc::new(MemorySessionStore::new());
        let config = SessionConfig {
            idle_timeout_secs: 60,
            ..SessionConfig::default()
        };
        let m = SessionManager::new(store, config);
        let session = m.open(&query(), &candidates(), vec![]).await.unwrap();

        // Not yet idle
        assert!(m.expire_idle(Utc::now()).await.unwrap().is_empty());

        // Past the idle window
        let later = Utc::now() + chrono::Duration::seconds(120);
        let expired = m.expire_idle(later).await.unwrap();
        assert_eq!(expired, vec![session.id]);
        let loaded = m.load(session.id).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Expired);

        // Second sweep has nothing to do, and no lock entry lingers
        assert!(m.expire_idle(later).await.unwrap().is_empty());
        assert!(m.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_sessions_release_their_lock_entries() {
        let m = manager();
        let session = m.open(&query(), &candidates(), vec![]).await.unwrap();
        {
            let _guard = m.try_lock(session.id).unwrap();
            let mut s = m.load(session.id).await.unwrap();
            s.resolve(vec!["light.bedroom_lamp".into()]).unwrap();
            m.save(&mut s).await.unwrap();
        }
        assert!(m.locks.lock().unwrap().is_empty());

        // Non-terminal saves keep the entry
        let other = m.open(&query(), &candidates(), vec![]).await.unwrap();
        let guard = m.try_lock(other.id).unwrap();
        let mut s = m.load(other.id).await.unwrap();
        m.save(&mut s).await.unwrap();
        assert_eq!(m.locks.lock().unwrap().len(), 1);
        drop(guard);
    }

    #[tokio::test]
    async fn file_store_roundtrip_and_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path().to_path_buf()).unwrap();
        let mut session = ClarificationSession::new(&query(), vec![]);
        store.save(&mut session).await.unwrap();

        let mut a = store.load(session.id).await.unwrap();
        let mut b = store.load(session.id).await.unwrap();
        store.save(&mut a).await.unwrap();
        assert!(store.save(&mut b).await.is_err());

        assert_eq!(store.list_ids().await.unwrap(), vec![session.id]);
    }
}
