//! 语义记忆：带置信度的事实与事实间关系
//!
//! 事实以规范化键（normalize_key）唯一标识；同一事实再次写入时按 ConfidenceBlend 合并置信度。
//! 关系只保存对方的键，通过 lookup/get 解析，不持有对方条目。
//! 每个键一把互斥锁，保证同一事实的并发 upsert 串行合并。

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;

use crate::memory::item::SemanticEntry;
use crate::memory::persistence::{put_json, scan_json, KvStore};
use crate::memory::tokenizer::{normalize_key, text_similarity};
use crate::memory::MemoryError;

pub const NAMESPACE: &str = "semantic";

/// 置信度合并策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfidenceBlend {
    /// new = weight * observed + (1 - weight) * old
    RecencyWeighted { weight: f32 },
    Max,
    /// 所有观测的算术平均
    Mean,
}

impl Default for ConfidenceBlend {
    fn default() -> Self {
        ConfidenceBlend::RecencyWeighted { weight: 0.6 }
    }
}

impl ConfidenceBlend {
    /// observations 为合并前的观测次数
    pub fn blend(&self, old: f32, observed: f32, observations: u32) -> f32 {
        let v = match *self {
            ConfidenceBlend::RecencyWeighted { weight } => {
                let w = weight.clamp(0.0, 1.0);
                w * observed + (1.0 - w) * old
            }
            ConfidenceBlend::Max => old.max(observed),
            ConfidenceBlend::Mean => {
                let n = observations.max(1) as f32;
                (old * n + observed) / (n + 1.0)
            }
        };
        v.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone)]
pub struct SemanticHit {
    pub entry: SemanticEntry,
    /// 精确键匹配为 1.0，模糊匹配为词级 Jaccard
    pub similarity: f32,
}

type Slot = Arc<Mutex<Option<SemanticEntry>>>;

pub struct SemanticStore {
    blend: ConfidenceBlend,
    fuzzy_threshold: f32,
    facts: RwLock<HashMap<String, Slot>>,
    substrate: Arc<dyn KvStore>,
}

fn clamp_confidence(c: f32) -> f32 {
    if c.is_nan() {
        0.0
    } else {
        c.clamp(0.0, 1.0)
    }
}

impl SemanticStore {
    pub fn new(blend: ConfidenceBlend, fuzzy_threshold: f32, substrate: Arc<dyn KvStore>) -> Self {
        Self {
            blend,
            fuzzy_threshold,
            facts: RwLock::new(HashMap::new()),
            substrate,
        }
    }

    pub fn load(
        blend: ConfidenceBlend,
        fuzzy_threshold: f32,
        substrate: Arc<dyn KvStore>,
    ) -> Result<Self, MemoryError> {
        let store = Self::new(blend, fuzzy_threshold, substrate);
        let records: Vec<SemanticEntry> = scan_json(store.substrate.as_ref(), NAMESPACE)?;
        {
            let mut facts = store.facts.write().unwrap_or_else(PoisonError::into_inner);
            for entry in records {
                facts.insert(entry.key.clone(), Arc::new(Mutex::new(Some(entry))));
            }
            tracing::info!(count = facts.len(), "Semantic memory loaded");
        }
        Ok(store)
    }

    fn slot(&self, key: &str) -> Slot {
        if let Some(slot) = self
            .facts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(slot);
        }
        let mut facts = self.facts.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(facts.entry(key.to_string()).or_default())
    }

    /// 写入或合并事实；related 为其它事实文本或键，统一规范化后保存
    pub fn upsert<I, S>(&self, fact: &str, confidence: f32, related: I) -> Result<SemanticEntry, MemoryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let key = normalize_key(fact);
        let observed = clamp_confidence(confidence);
        let related: BTreeSet<String> = related
            .into_iter()
            .map(|r| normalize_key(r.as_ref()))
            .filter(|r| !r.is_empty() && *r != key)
            .collect();

        let slot = self.slot(&key);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match guard.as_ref() {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.confidence = self.blend.blend(existing.confidence, observed, existing.observations);
                merged.observations = existing.observations.saturating_add(1);
                merged.related.extend(related);
                merged.fact = fact.trim().to_string();
                merged.updated_at = Utc::now();
                merged
            }
            None => SemanticEntry {
                key: key.clone(),
                fact: fact.trim().to_string(),
                confidence: observed,
                related,
                observations: 1,
                updated_at: Utc::now(),
            },
        };
        put_json(self.substrate.as_ref(), NAMESPACE, &key, &next)?;
        tracing::debug!(key = %key, confidence = next.confidence, "Semantic fact upserted");
        *guard = Some(next.clone());
        Ok(next)
    }

    /// 按事实文本或键取单条
    pub fn get(&self, fact_or_key: &str) -> Option<SemanticEntry> {
        let key = normalize_key(fact_or_key);
        let slot = self
            .facts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()?;
        let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }

    fn snapshot(&self) -> Vec<SemanticEntry> {
        let slots: Vec<Slot> = self
            .facts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots
            .iter()
            .filter_map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect()
    }

    /// 精确键匹配 + 模糊匹配（词级相似度 ≥ fuzzy_threshold），按相似度、置信度排序
    pub fn lookup(&self, query: &str, k: usize) -> Vec<SemanticHit> {
        let key = normalize_key(query);
        let mut hits: Vec<SemanticHit> = self
            .snapshot()
            .into_iter()
            .filter_map(|entry| {
                let similarity = if entry.key == key {
                    1.0
                } else {
                    text_similarity(query, &entry.fact)
                };
                (similarity >= self.fuzzy_threshold).then_some(SemanticHit { entry, similarity })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| b.entry.confidence.total_cmp(&a.entry.confidence))
                .then_with(|| a.entry.key.cmp(&b.entry.key))
        });
        hits.truncate(k);
        hits
    }

    /// 解析某事实的关联事实；已不存在的引用被跳过
    pub fn related(&self, fact_or_key: &str) -> Vec<SemanticEntry> {
        let Some(entry) = self.get(fact_or_key) else {
            return Vec::new();
        };
        entry.related.iter().filter_map(|k| self.get(k)).collect()
    }

    /// 删除置信度低于 min_confidence 的事实，返回删除数量
    ///
    /// 每个事实在自己的槽锁内复查置信度并删除持久化记录；空槽只在无人持有时从表中移除。
    pub fn consolidate(&self, min_confidence: f32) -> Result<usize, MemoryError> {
        let slots: Vec<(String, Slot)> = self
            .facts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();

        let mut removed = 0;
        for (key, slot) in &slots {
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.as_ref().is_some_and(|e| e.confidence < min_confidence) {
                self.substrate.delete(NAMESPACE, key)?;
                *guard = None;
                removed += 1;
            }
        }
        drop(slots);

        if removed > 0 {
            let mut facts = self.facts.write().unwrap_or_else(PoisonError::into_inner);
            facts.retain(|_, slot| {
                Arc::strong_count(slot) > 1
                    || slot.lock().unwrap_or_else(PoisonError::into_inner).is_some()
            });
            tracing::info!(removed, "Semantic memory consolidated");
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::persistence::InMemoryKvStore;

    fn store(blend: ConfidenceBlend) -> SemanticStore {
        SemanticStore::new(blend, 0.5, Arc::new(InMemoryKvStore::new()))
    }

    #[test]
    fn test_upsert_blends_instead_of_overwriting() {
        let store = store(ConfidenceBlend::RecencyWeighted { weight: 0.5 });
        store.upsert("API rate limit is 100 per minute", 0.8, Vec::<String>::new()).unwrap();
        let e = store
            .upsert("api rate limit is 100 per minute", 0.4, Vec::<String>::new())
            .unwrap();
        assert!((e.confidence - 0.6).abs() < 1e-6);
        assert_eq!(e.observations, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_blend_policies() {
        assert_eq!(ConfidenceBlend::Max.blend(0.7, 0.2, 1), 0.7);
        assert!((ConfidenceBlend::Mean.blend(0.6, 0.9, 2) - 0.7).abs() < 1e-6);
        assert_eq!(ConfidenceBlend::RecencyWeighted { weight: 1.0 }.blend(0.1, 0.9, 5), 0.9);
    }

    #[test]
    fn test_lookup_exact_and_fuzzy() {
        let store = store(ConfidenceBlend::default());
        store.upsert("staging database runs postgres 15", 0.9, Vec::<String>::new()).unwrap();
        store.upsert("deploys happen on tuesday", 0.7, Vec::<String>::new()).unwrap();

        let exact = store.lookup("Staging database runs Postgres 15", 5);
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].similarity, 1.0);

        let fuzzy = store.lookup("staging database postgres", 5);
        assert_eq!(fuzzy.len(), 1);
        assert!(fuzzy[0].similarity < 1.0);

        assert!(store.lookup("unrelated words entirely", 5).is_empty());
    }

    #[test]
    fn test_related_are_weak_references() {
        let store = store(ConfidenceBlend::default());
        store.upsert("service a calls service b", 0.9, ["service b is flaky"]).unwrap();
        store.upsert("service b is flaky", 0.8, ["service a calls service b"]).unwrap();
        store.upsert("orphan fact", 0.9, ["missing fact"]).unwrap();

        let related = store.related("service a calls service b");
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].fact, "service b is flaky");
        assert!(store.related("orphan fact").is_empty());
    }

    #[test]
    fn test_consolidate_removes_weak_facts() {
        let store = store(ConfidenceBlend::default());
        store.upsert("strong", 0.9, Vec::<String>::new()).unwrap();
        store.upsert("weak guess", 0.1, Vec::<String>::new()).unwrap();
        assert_eq!(store.consolidate(0.3).unwrap(), 1);
        assert!(store.get("weak guess").is_none());
        assert!(store.get("strong").is_some());
    }

    #[test]
    fn test_consolidate_keeps_memory_and_substrate_in_step() {
        let substrate: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let store = Arc::new(SemanticStore::new(
            ConfidenceBlend::RecencyWeighted { weight: 1.0 },
            0.5,
            Arc::clone(&substrate),
        ));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let s = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let fact = format!("fact {w} {i}");
                        s.upsert(&fact, 0.05, Vec::<String>::new()).unwrap();
                        s.upsert(&fact, 1.0, Vec::<String>::new()).unwrap();
                    }
                })
            })
            .collect();
        let sweeper = {
            let s = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    s.consolidate(0.3).unwrap();
                }
            })
        };
        for h in writers {
            h.join().unwrap();
        }
        sweeper.join().unwrap();

        let reloaded = SemanticStore::load(ConfidenceBlend::default(), 0.5, substrate).unwrap();
        for w in 0..4 {
            for i in 0..50 {
                let fact = format!("fact {w} {i}");
                let live = store.get(&fact);
                assert_eq!(live, reloaded.get(&fact));
                assert_eq!(live.map(|e| e.confidence), Some(1.0));
            }
        }
    }

    #[test]
    fn test_concurrent_upserts_on_same_key() {
        let store = Arc::new(store(ConfidenceBlend::Mean));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&store);
                std::thread::spawn(move || {
                    s.upsert("shared fact", 0.5, Vec::<String>::new()).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let e = store.get("shared fact").unwrap();
        assert_eq!(e.observations, 8);
        assert!((e.confidence - 0.5).abs() < 1e-6);
    }
}
