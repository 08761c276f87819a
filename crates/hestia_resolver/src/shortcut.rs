//! Semantic shortcut cache: the learned-resolution store.
//!
//! An arena of immutable `KnowledgeEntry` values with nearest-neighbor
//! cosine lookup. A strong approved hit lets the pipeline skip scoring and
//! clarification — but never verification. Appends are uncoordinated
//! (entries are immutable once written); reads take an arc-clone snapshot,
//! so the eviction pass can never pull an entry out from under a scorer.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use hestia_common::{KnowledgeEntry, ResolveError};

use crate::config::KnowledgeConfig;
use crate::vector::cosine_similarity;

/// A shortcut candidate: the nearest approved entry and its similarity.
#[derive(Debug, Clone)]
pub struct ShortcutHit {
    pub entry: Arc<KnowledgeEntry>,
    pub similarity: f32,
}

/// Append-only knowledge store, optionally file-backed
/// (one JSON document per entry).
pub struct KnowledgeStore {
    dir: Option<PathBuf>,
    entries: RwLock<Vec<Arc<KnowledgeEntry>>>,
}

impl KnowledgeStore {
    /// Volatile store for tests and ephemeral installations.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            entries: RwLock::new(vec![]),
        }
    }

    /// Open (or create) a file-backed store, loading every existing entry.
    pub fn open(dir: PathBuf) -> Result<Self, ResolveError> {
        fs::create_dir_all(&dir).map_err(ResolveError::store)?;
        let mut entries = vec![];
        for dirent in fs::read_dir(&dir).map_err(ResolveError::store)? {
            let path = dirent.map_err(ResolveError::store)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str::<KnowledgeEntry>(&raw).map_err(Into::into))
            {
                Ok(entry) => entries.push(Arc::new(entry)),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable knowledge entry"),
            }
        }
        entries.sort_by_key(|e| e.created_at);
        info!(dir = %dir.display(), entries = entries.len(), "knowledge store loaded");
        Ok(Self {
            dir: Some(dir),
            entries: RwLock::new(entries),
        })
    }

    /// Append one entry. Entries are immutable, so concurrent appends from
    /// independent resolution cycles need no coordination beyond the lock
    /// around the arena vector itself.
    pub async fn append(&self, entry: KnowledgeEntry) -> Result<(), ResolveError> {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}.json", entry.id));
            let tmp = dir.join(format!("{}.json.tmp", entry.id));
            let raw = serde_json::to_string_pretty(&entry).map_err(ResolveError::store)?;
            fs::write(&tmp, raw).map_err(ResolveError::store)?;
            fs::rename(&tmp, &path).map_err(ResolveError::store)?;
        }
        debug!(entry_id = %entry.id, outcome = ?entry.outcome, "knowledge entry appended");
        self.entries.write().await.push(Arc::new(entry));
        Ok(())
    }

    /// Nearest-neighbor lookup for the shortcut decision.
    ///
    /// Returns the closest `approved` entry at or above `threshold`, unless
    /// an at-least-as-close `rejected` entry vetoes it: a rejection recorded
    /// for essentially the same query means the learned resolution was bad.
    pub async fn lookup(&self, query_embedding: &[f32], threshold: f32) -> Option<ShortcutHit> {
        let snapshot: Vec<Arc<KnowledgeEntry>> = self.entries.read().await.clone();

        let mut best_approved: Option<(f32, Arc<KnowledgeEntry>)> = None;
        let mut best_rejected: f32 = f32::MIN;
        for entry in snapshot {
            let sim = cosine_similarity(query_embedding, &entry.embedding);
            if entry.is_approved() {
                if best_approved.as_ref().map(|(s, _)| sim > *s).unwrap_or(true) {
                    best_approved = Some((sim, entry));
                }
            } else if sim > best_rejected {
                best_rejected = sim;
            }
        }

        let (similarity, entry) = best_approved?;
        if similarity < threshold {
            return None;
        }
        if best_rejected >= similarity {
            info!(
                entry_id = %entry.id,
                similarity,
                rejected_similarity = best_rejected,
                "shortcut vetoed by a rejected entry"
            );
            return None;
        }
        info!(entry_id = %entry.id, similarity, "shortcut hit");
        Some(ShortcutHit { entry, similarity })
    }

    /// Age/size eviction. Runs as a separate maintenance pass, never inline
    /// with a read; in-flight lookups keep scoring against their snapshot.
    pub async fn evict(&self, config: &KnowledgeConfig) -> usize {
        let now = chrono::Utc::now();
        let mut entries = self.entries.write().await;

        let mut removed: Vec<Arc<KnowledgeEntry>> = vec![];
        entries.retain(|e| {
            if e.age_days(now) > config.max_age_days {
                removed.push(Arc::clone(e));
                false
            } else {
                true
            }
        });
        // Size cap: oldest first (arena is kept in creation order)
        while entries.len() > config.max_entries {
            removed.push(entries.remove(0));
        }

        if let Some(dir) = &self.dir {
            for entry in &removed {
                let path = dir.join(format!("{}.json", entry.id));
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove evicted entry");
                }
            }
        }
        if !removed.is_empty() {
            info!(evicted = removed.len(), "knowledge eviction pass complete");
        }
        removed.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hestia_common::KnowledgeOutcome;

    fn entry(text: &str, embedding: Vec<f32>, outcome: KnowledgeOutcome) -> KnowledgeEntry {
        KnowledgeEntry::new(text, embedding, vec!["light.office".into()], outcome)
    }

    #[tokio::test]
    async fn lookup_finds_nearest_approved_above_threshold() {
        let store = KnowledgeStore::in_memory();
        store
            .append(entry("office light show", vec![1.0, 0.0], KnowledgeOutcome::Approved))
            .await
            .unwrap();
        store
            .append(entry("kitchen fan", vec![0.0, 1.0], KnowledgeOutcome::Approved))
            .await
            .unwrap();

        let hit = store.lookup(&[0.95, 0.05], 0.85).await.unwrap();
        assert_eq!(hit.entry.query_text, "office light show");
        assert!(hit.similarity > 0.9);

        // cos([0.5, 0.5], [1, 0]) is about 0.707, below the threshold
        assert!(store.lookup(&[0.5, 0.5], 0.85).await.is_none());
    }

    #[tokio::test]
    async fn rejected_entry_vetoes_the_shortcut() {
        let store = KnowledgeStore::in_memory();
        store
            .append(entry("office lights", vec![1.0, 0.0], KnowledgeOutcome::Approved))
            .await
            .unwrap();
        assert!(store.lookup(&[1.0, 0.0], 0.85).await.is_some());

        store
            .append(entry("office lights", vec![1.0, 0.0], KnowledgeOutcome::Rejected))
            .await
            .unwrap();
        assert!(store.lookup(&[1.0, 0.0], 0.85).await.is_none());
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = KnowledgeStore::open(dir.path().to_path_buf()).unwrap();
            store
                .append(entry("office light", vec![1.0, 0.0], KnowledgeOutcome::Approved))
                .await
                .unwrap();
        }
        let store = KnowledgeStore::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(store.len().await, 1);
        assert!(store.lookup(&[1.0, 0.0], 0.85).await.is_some());
    }

    #[tokio::test]
    async fn eviction_enforces_size_cap_oldest_first() {
        let store = KnowledgeStore::in_memory();
        for i in 0..5 {
            store
                .append(entry(
                    &format!("query {i}"),
                    vec![1.0, 0.0],
                    KnowledgeOutcome::Approved,
                ))
                .await
                .unwrap();
        }
        let config = KnowledgeConfig {
            max_age_days: 365,
            max_entries: 3,
        };
        let removed = store.evict(&config).await;
        assert_eq!(removed, 2);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn eviction_removes_backing_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnowledgeStore::open(dir.path().to_path_buf()).unwrap();
        store
            .append(entry("q", vec![1.0], KnowledgeOutcome::Approved))
            .await
            .unwrap();
        let config = KnowledgeConfig {
            max_age_days: 365,
            max_entries: 0,
        };
        assert_eq!(store.evict(&config).await, 1);
        let files = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 0);
    }
}
