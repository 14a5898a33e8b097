//! 情景记忆：只追加的任务执行记录
//!
//! append 是唯一的写操作；条目以 Arc 共享，写入后不再修改。
//! find_similar 对任务描述做嵌入并复用 VectorIndex 检索，返回最相近的历史任务（结果 + 经验）。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

use crate::llm::Embedder;
use crate::memory::item::EpisodicEntry;
use crate::memory::persistence::{put_json, scan_json, KvStore};
use crate::memory::vector_index::VectorIndex;
use crate::memory::MemoryError;

pub const NAMESPACE: &str = "episodic";

#[derive(Debug, Clone)]
pub struct EpisodeHit {
    pub entry: Arc<EpisodicEntry>,
    pub similarity: f32,
}

struct Log {
    entries: Vec<Arc<EpisodicEntry>>,
    by_id: HashMap<Uuid, usize>,
    index: VectorIndex,
}

pub struct EpisodicStore {
    log: RwLock<Log>,
    embedder: Arc<dyn Embedder>,
    substrate: Arc<dyn KvStore>,
}

impl EpisodicStore {
    pub fn new(embedder: Arc<dyn Embedder>, substrate: Arc<dyn KvStore>) -> Self {
        let dim = embedder.dim();
        Self {
            log: RwLock::new(Log {
                entries: Vec::new(),
                by_id: HashMap::new(),
                index: VectorIndex::new(dim),
            }),
            embedder,
            substrate,
        }
    }

    /// 从持久化底座按写入顺序重放
    pub fn load(embedder: Arc<dyn Embedder>, substrate: Arc<dyn KvStore>) -> Result<Self, MemoryError> {
        let store = Self::new(embedder, substrate);
        let records: Vec<EpisodicEntry> = scan_json(store.substrate.as_ref(), NAMESPACE)?;
        {
            let mut log = store.log.write().unwrap_or_else(PoisonError::into_inner);
            for entry in records {
                let vector = store.embedder.embed(&entry.task.description);
                log.index.insert(entry.id, &vector)?;
                let pos = log.entries.len();
                log.by_id.insert(entry.id, pos);
                log.entries.push(Arc::new(entry));
            }
            tracing::info!(count = log.entries.len(), "Episodic memory loaded");
        }
        Ok(store)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Log> {
        self.log.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// 追加一条记录；同一 id 重复追加被忽略（条目不可变）
    pub fn append(&self, entry: EpisodicEntry) -> Result<Uuid, MemoryError> {
        let id = entry.id;
        if self.read().by_id.contains_key(&id) {
            tracing::warn!(id = %id, "Episode already recorded, ignoring duplicate append");
            return Ok(id);
        }
        let vector = self.embedder.embed(&entry.task.description);
        put_json(self.substrate.as_ref(), NAMESPACE, &id.to_string(), &entry)?;

        let mut log = self.log.write().unwrap_or_else(PoisonError::into_inner);
        if log.by_id.contains_key(&id) {
            return Ok(id);
        }
        log.index.insert(id, &vector)?;
        let pos = log.entries.len();
        log.by_id.insert(id, pos);
        log.entries.push(Arc::new(entry));
        tracing::debug!(id = %id, "Episode appended");
        Ok(id)
    }

    /// 与给定描述最相近的 k 条历史任务；相似度相同时较新的在前
    pub fn find_similar(&self, description: &str, k: usize) -> Result<Vec<EpisodeHit>, MemoryError> {
        let query = self.embedder.embed(description);
        let log = self.read();
        let mut hits: Vec<EpisodeHit> = log
            .index
            .score_all(&query)?
            .into_iter()
            .filter_map(|hit| {
                log.by_id.get(&hit.id).map(|&pos| EpisodeHit {
                    entry: Arc::clone(&log.entries[pos]),
                    similarity: hit.similarity,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| b.entry.recorded_at.cmp(&a.entry.recorded_at))
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// 全部记录（按追加顺序）
    pub fn all(&self) -> Vec<Arc<EpisodicEntry>> {
        self.read().entries.clone()
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<EpisodicEntry>> {
        let log = self.read();
        log.by_id.get(id).map(|&pos| Arc::clone(&log.entries[pos]))
    }

    /// 成功率；无记录时为 0
    pub fn success_rate(&self) -> f32 {
        let log = self.read();
        if log.entries.is_empty() {
            return 0.0;
        }
        let ok = log.entries.iter().filter(|e| e.outcome.is_success()).count();
        ok as f32 / log.entries.len() as f32
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::llm::HashingEmbedder;
    use crate::memory::item::{EpisodeOutcome, TaskSnapshot};
    use crate::memory::persistence::InMemoryKvStore;

    fn episode(description: &str, outcome: EpisodeOutcome) -> EpisodicEntry {
        EpisodicEntry::new(
            TaskSnapshot {
                task_id: Uuid::new_v4(),
                description: description.into(),
                retry_count: 0,
                context: BTreeMap::new(),
            },
            outcome,
            vec![format!("lesson for {}", description)],
        )
    }

    fn store(substrate: Arc<dyn KvStore>) -> EpisodicStore {
        EpisodicStore::new(Arc::new(HashingEmbedder::new(128)), substrate)
    }

    #[test]
    fn test_find_similar_returns_closest_descriptions() {
        let store = store(Arc::new(InMemoryKvStore::new()));
        store
            .append(episode("download csv report from portal", EpisodeOutcome::Failed { cause: "login".into() }))
            .unwrap();
        store
            .append(episode("resize images in folder", EpisodeOutcome::Succeeded { score: 9.0 }))
            .unwrap();

        let hits = store.find_similar("download the csv report", 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.task.description, "download csv report from portal");
        assert!(!hits[0].entry.lessons.is_empty());
    }

    #[test]
    fn test_append_only_and_success_rate() {
        let store = store(Arc::new(InMemoryKvStore::new()));
        assert_eq!(store.success_rate(), 0.0);
        let e = episode("a task", EpisodeOutcome::Succeeded { score: 8.0 });
        let dup = e.clone();
        store.append(e).unwrap();
        store.append(dup).unwrap();
        store
            .append(episode("b task", EpisodeOutcome::Failed { cause: "x".into() }))
            .unwrap();
        assert_eq!(store.len(), 2);
        assert!((store.success_rate() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_reload_preserves_order() {
        let substrate: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let first = store(Arc::clone(&substrate));
        first.append(episode("one", EpisodeOutcome::Succeeded { score: 7.0 })).unwrap();
        first.append(episode("two", EpisodeOutcome::Succeeded { score: 7.0 })).unwrap();

        let reloaded = EpisodicStore::load(Arc::new(HashingEmbedder::new(128)), substrate).unwrap();
        let descriptions: Vec<_> = reloaded.all().iter().map(|e| e.task.description.clone()).collect();
        assert_eq!(descriptions, vec!["one", "two"]);
    }
}
