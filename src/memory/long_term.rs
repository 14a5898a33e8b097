//! 长期记忆：按重要度准入、可按向量相似度检索的持久化存储
//!
//! 重要度低于阈值（默认 0.3，且不可配置得更低）的写入被拒绝并以 WriteOutcome::Declined 报告，不视为错误。
//! 被接受的条目先写入持久化底座，再加入向量索引；索引外包读写锁（并发查询、串行插入）。

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use uuid::Uuid;

use crate::memory::item::LongTermEntry;
use crate::memory::persistence::{put_json, scan_json, KvStore};
use crate::memory::vector_index::VectorIndex;
use crate::memory::MemoryError;

pub const NAMESPACE: &str = "long_term";
/// 准入阈值下限
pub const MIN_IMPORTANCE: f32 = 0.3;

/// 写入结果
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Stored(Uuid),
    /// 重要度不足，未写入任何存储
    Declined { importance: f32, threshold: f32 },
}

impl WriteOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, WriteOutcome::Stored(_))
    }
}

#[derive(Debug, Clone)]
pub struct LongTermHit {
    pub entry: Arc<LongTermEntry>,
    pub similarity: f32,
}

struct State {
    index: VectorIndex,
    entries: HashMap<Uuid, Arc<LongTermEntry>>,
}

pub struct LongTermStore {
    min_importance: f32,
    state: RwLock<State>,
    substrate: Arc<dyn KvStore>,
}

impl LongTermStore {
    /// min_importance 低于 MIN_IMPORTANCE 时按 MIN_IMPORTANCE 处理
    pub fn new(dim: usize, min_importance: f32, substrate: Arc<dyn KvStore>) -> Self {
        Self {
            min_importance: min_importance.max(MIN_IMPORTANCE),
            state: RwLock::new(State {
                index: VectorIndex::new(dim),
                entries: HashMap::new(),
            }),
            substrate,
        }
    }

    /// 从持久化底座重建索引；维度不符的记录跳过
    pub fn load(
        dim: usize,
        min_importance: f32,
        substrate: Arc<dyn KvStore>,
    ) -> Result<Self, MemoryError> {
        let store = Self::new(dim, min_importance, substrate);
        let records: Vec<LongTermEntry> = scan_json(store.substrate.as_ref(), NAMESPACE)?;
        {
            let mut state = store.state.write().unwrap_or_else(PoisonError::into_inner);
            for entry in records {
                if let Err(e) = state.index.insert(entry.id, &entry.embedding) {
                    tracing::warn!(id = %entry.id, "Skipping long-term record: {}", e);
                    continue;
                }
                state.entries.insert(entry.id, Arc::new(entry));
            }
            tracing::info!(count = state.entries.len(), "Long-term memory loaded");
        }
        Ok(store)
    }

    pub fn min_importance(&self) -> f32 {
        self.min_importance
    }

    pub fn dim(&self) -> usize {
        self.read().index.dim()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(
        &self,
        content: impl Into<String>,
        embedding: Vec<f32>,
        importance: f32,
    ) -> Result<WriteOutcome, MemoryError> {
        self.insert_entry(LongTermEntry {
            id: Uuid::new_v4(),
            content: content.into(),
            embedding,
            importance,
            timestamp: Utc::now(),
        })
    }

    /// 写入完整条目（保留其 id 与时间戳）
    pub fn insert_entry(&self, mut entry: LongTermEntry) -> Result<WriteOutcome, MemoryError> {
        if entry.importance.is_nan() || entry.importance < self.min_importance {
            tracing::info!(
                importance = entry.importance,
                threshold = self.min_importance,
                "Long-term write declined"
            );
            return Ok(WriteOutcome::Declined {
                importance: entry.importance,
                threshold: self.min_importance,
            });
        }
        entry.importance = entry.importance.min(1.0);

        let dim = self.dim();
        if entry.embedding.len() != dim {
            return Err(MemoryError::DimensionMismatch {
                expected: dim,
                actual: entry.embedding.len(),
            });
        }

        put_json(self.substrate.as_ref(), NAMESPACE, &entry.id.to_string(), &entry)?;

        let id = entry.id;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.index.insert(id, &entry.embedding)?;
        state.entries.insert(id, Arc::new(entry));
        tracing::debug!(id = %id, "Long-term entry stored");
        Ok(WriteOutcome::Stored(id))
    }

    /// 最相近的 k 个条目；相似度相同按重要度、再按时间（新在前）排序
    pub fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<LongTermHit>, MemoryError> {
        let state = self.read();
        let mut hits: Vec<LongTermHit> = state
            .index
            .score_all(embedding)?
            .into_iter()
            .filter_map(|hit| {
                state.entries.get(&hit.id).map(|entry| LongTermHit {
                    entry: Arc::clone(entry),
                    similarity: hit.similarity,
                })
            })
            .collect();
        hits.sort_by(compare_hits);
        hits.truncate(k);
        Ok(hits)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<LongTermEntry>> {
        self.read().entries.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn compare_hits(a: &LongTermHit, b: &LongTermHit) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| b.entry.importance.total_cmp(&a.entry.importance))
        .then_with(|| b.entry.timestamp.cmp(&a.entry.timestamp))
        .then_with(|| a.entry.id.cmp(&b.entry.id))
}
