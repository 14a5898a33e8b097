//! 记忆管理器：四类存储的统一入口
//!
//! - retrieve：从短期（按最近访问）、长期（向量相似度）、情景（任务描述相似度）、语义（键精确/模糊匹配）
//!   收集候选，按 RankPolicy 计算综合得分后合并排序，截断到 k 条
//! - store：按条目种类写入且只写入一个存储
//! - context_for_task：检索并渲染为 prompt 片段；部分存储失败时返回已取得的部分并标记降级

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{MemoryConfig, RankConfig};
use crate::llm::{Embedder, HashingEmbedder};
use crate::memory::episodic::EpisodicStore;
use crate::memory::item::{
    MemoryContext, MemoryItem, MemoryKind, RankedItem, ShortTermEntry, StoreOutcome,
};
use crate::memory::long_term::{LongTermStore, WriteOutcome};
use crate::memory::persistence::{InMemoryKvStore, KvStore, SqliteKvStore};
use crate::memory::semantic::SemanticStore;
use crate::memory::short_term::ShortTermStore;
use crate::memory::tokenizer::text_similarity;
use crate::memory::MemoryError;

/// 短期记忆在合并排序中的固定重要度
const SHORT_TERM_IMPORTANCE: f32 = 0.5;

/// 综合得分：similarity^a × importance^b × 0.5^(age / half_life)
#[derive(Debug, Clone, PartialEq)]
pub struct RankPolicy {
    pub similarity_exponent: f32,
    pub importance_exponent: f32,
    pub recency_half_life: Duration,
    pub similarity_floor: f32,
}

impl Default for RankPolicy {
    fn default() -> Self {
        Self::from(&RankConfig::default())
    }
}

impl From<&RankConfig> for RankPolicy {
    fn from(c: &RankConfig) -> Self {
        Self {
            similarity_exponent: c.similarity_exponent,
            importance_exponent: c.importance_exponent,
            recency_half_life: Duration::from_secs(c.recency_half_life_secs.max(1)),
            similarity_floor: c.similarity_floor,
        }
    }
}

impl RankPolicy {
    /// 时间衰减因子，未来时间按 0 岁处理
    pub fn recency(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
        let age = now.signed_duration_since(timestamp).num_milliseconds().max(0) as f64 / 1000.0;
        let half_life = self.recency_half_life.as_secs_f64();
        0.5f64.powf(age / half_life) as f32
    }

    pub fn score(&self, similarity: f32, importance: f32, recency: f32) -> f32 {
        let s = similarity.max(0.0).powf(self.similarity_exponent);
        let i = importance.clamp(0.0, 1.0).powf(self.importance_exponent);
        s * i * recency
    }
}

/// 各存储条目数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub short_term: usize,
    pub long_term: usize,
    pub episodic: usize,
    pub semantic: usize,
    pub episodic_success_rate: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub short_term_expired: usize,
    pub semantic_removed: usize,
}

pub struct MemoryManager {
    short_term: ShortTermStore,
    long_term: LongTermStore,
    episodic: EpisodicStore,
    semantic: SemanticStore,
    embedder: Arc<dyn Embedder>,
    substrate: Arc<dyn KvStore>,
    rank: RankPolicy,
    semantic_min_confidence: f32,
}

impl MemoryManager {
    /// 在给定底座上构建，并从底座恢复长期 / 情景 / 语义记忆
    pub fn new(
        config: &MemoryConfig,
        embedder: Arc<dyn Embedder>,
        substrate: Arc<dyn KvStore>,
    ) -> Result<Self, MemoryError> {
        let dim = embedder.dim();
        if dim != config.embedding_dim {
            return Err(MemoryError::DimensionMismatch {
                expected: config.embedding_dim,
                actual: dim,
            });
        }
        let short_term = ShortTermStore::new(
            config.short_term_capacity,
            Duration::from_secs(config.short_term_ttl_secs),
        );
        let long_term = LongTermStore::load(
            dim,
            config.long_term_min_importance,
            Arc::clone(&substrate),
        )?;
        let episodic = EpisodicStore::load(Arc::clone(&embedder), Arc::clone(&substrate))?;
        let semantic = SemanticStore::load(
            config.semantic.blend_policy(),
            config.semantic.fuzzy_threshold,
            Arc::clone(&substrate),
        )?;
        Ok(Self {
            short_term,
            long_term,
            episodic,
            semantic,
            embedder,
            substrate,
            rank: RankPolicy::from(&config.rank),
            semantic_min_confidence: config.semantic_min_confidence,
        })
    }

    /// 按配置打开：persist_dir 设置时使用 SQLite（persist_dir/memory.db），否则纯内存
    pub fn from_config(config: &MemoryConfig) -> Result<Self, MemoryError> {
        let substrate: Arc<dyn KvStore> = match &config.persist_dir {
            Some(dir) => Arc::new(SqliteKvStore::open(dir.join("memory.db"))?),
            None => Arc::new(InMemoryKvStore::new()),
        };
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(config.embedding_dim));
        Self::new(config, embedder, substrate)
    }

    pub fn in_memory(config: &MemoryConfig) -> Result<Self, MemoryError> {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(config.embedding_dim));
        Self::new(config, embedder, Arc::new(InMemoryKvStore::new()))
    }

    pub fn short_term(&self) -> &ShortTermStore {
        &self.short_term
    }

    pub fn long_term(&self) -> &LongTermStore {
        &self.long_term
    }

    pub fn episodic(&self) -> &EpisodicStore {
        &self.episodic
    }

    pub fn semantic(&self) -> &SemanticStore {
        &self.semantic
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn substrate(&self) -> &Arc<dyn KvStore> {
        &self.substrate
    }

    pub fn rank_policy(&self) -> &RankPolicy {
        &self.rank
    }

    pub fn semantic_min_confidence(&self) -> f32 {
        self.semantic_min_confidence
    }

    fn ranked(&self, item: MemoryItem, similarity: f32, importance: f32, now: DateTime<Utc>) -> RankedItem {
        let recency = self.rank.recency(item.timestamp(), now);
        let score = self.rank.score(similarity, importance, recency);
        RankedItem {
            item,
            similarity,
            importance,
            recency,
            score,
        }
    }

    /// 收集四类候选；单个存储失败不影响其它存储
    fn gather(
        &self,
        query: &str,
        k: usize,
        now: DateTime<Utc>,
    ) -> (Vec<RankedItem>, Vec<(MemoryKind, MemoryError)>) {
        let mut candidates = Vec::new();
        let mut failures = Vec::new();

        for entry in self.short_term.recent_at(k, now) {
            let text = format!("{} {}", entry.key, entry.value);
            let similarity = text_similarity(query, &text).max(self.rank.similarity_floor);
            candidates.push(self.ranked(
                MemoryItem::ShortTerm(entry),
                similarity,
                SHORT_TERM_IMPORTANCE,
                now,
            ));
        }

        let embedding = self.embedder.embed(query);
        match self.long_term.query(&embedding, k) {
            Ok(hits) => {
                for hit in hits {
                    let importance = hit.entry.importance;
                    candidates.push(self.ranked(
                        MemoryItem::LongTerm(hit.entry.as_ref().clone()),
                        hit.similarity,
                        importance,
                        now,
                    ));
                }
            }
            Err(e) => failures.push((MemoryKind::LongTerm, e)),
        }

        match self.episodic.find_similar(query, k) {
            Ok(hits) => {
                for hit in hits {
                    let importance = hit.entry.importance();
                    candidates.push(self.ranked(
                        MemoryItem::Episodic(hit.entry.as_ref().clone()),
                        hit.similarity,
                        importance,
                        now,
                    ));
                }
            }
            Err(e) => failures.push((MemoryKind::Episodic, e)),
        }

        for hit in self.semantic.lookup(query, k) {
            let importance = hit.entry.confidence;
            candidates.push(self.ranked(
                MemoryItem::Semantic(hit.entry),
                hit.similarity,
                importance,
                now,
            ));
        }

        candidates.retain(|c| c.score > 0.0);
        candidates.sort_by(compare_ranked);
        candidates.truncate(k);
        (candidates, failures)
    }

    pub fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RankedItem>, MemoryError> {
        self.retrieve_at(query, k, Utc::now())
    }

    /// 在指定时间点检索；相同存储状态与相同 now 下结果顺序确定
    pub fn retrieve_at(
        &self,
        query: &str,
        k: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedItem>, MemoryError> {
        let (items, failures) = self.gather(query, k, now);
        if let Some((_, e)) = failures.into_iter().next() {
            return Err(e);
        }
        tracing::debug!(query, returned = items.len(), "Memory retrieved");
        Ok(items)
    }

    /// 为任务描述组装记忆上下文；失败的存储被跳过并在 degraded 中说明
    pub fn context_for_task(&self, task_description: &str, k: usize) -> MemoryContext {
        self.context_for_task_at(task_description, k, Utc::now())
    }

    pub fn context_for_task_at(
        &self,
        task_description: &str,
        k: usize,
        now: DateTime<Utc>,
    ) -> MemoryContext {
        let (items, failures) = self.gather(task_description, k, now);
        let degraded = if failures.is_empty() {
            None
        } else {
            let reason = failures
                .iter()
                .map(|(kind, e)| format!("{}: {}", kind, e))
                .collect::<Vec<_>>()
                .join("; ");
            tracing::warn!(reason = %reason, "Memory context degraded");
            Some(reason)
        };
        MemoryContext { items, degraded }
    }

    /// 按种类路由写入，只写一个存储
    pub fn store(&self, item: MemoryItem) -> Result<StoreOutcome, MemoryError> {
        match item {
            MemoryItem::ShortTerm(ShortTermEntry { key, value, .. }) => {
                self.short_term.put(key.clone(), value);
                Ok(StoreOutcome::ShortTerm { key })
            }
            MemoryItem::LongTerm(mut entry) => {
                if entry.embedding.is_empty() {
                    entry.embedding = self.embedder.embed(&entry.content);
                }
                Ok(StoreOutcome::LongTerm(self.long_term.insert_entry(entry)?))
            }
            MemoryItem::Episodic(entry) => {
                let id = self.episodic.append(entry)?;
                Ok(StoreOutcome::Episodic { id })
            }
            MemoryItem::Semantic(entry) => {
                let stored = self
                    .semantic
                    .upsert(&entry.fact, entry.confidence, entry.related.iter())?;
                Ok(StoreOutcome::Semantic {
                    key: stored.key,
                    confidence: stored.confidence,
                })
            }
        }
    }

    /// 将短期条目提升为长期记忆；写入成功后从短期移除。条目不存在时返回 None
    pub fn promote(&self, key: &str, importance: f32) -> Result<Option<WriteOutcome>, MemoryError> {
        let Some(entry) = self.short_term.peek(key) else {
            return Ok(None);
        };
        let content = format!("{}: {}", entry.key, entry.value);
        let embedding = self.embedder.embed(&content);
        let outcome = self.long_term.insert(content, embedding, importance)?;
        if outcome.is_stored() {
            self.short_term.remove(key);
        }
        Ok(Some(outcome))
    }

    /// 清理过期短期条目与低置信度语义事实
    pub fn sweep(&self) -> Result<SweepReport, MemoryError> {
        let short_term_expired = self.short_term.sweep();
        let semantic_removed = self.semantic.consolidate(self.semantic_min_confidence)?;
        Ok(SweepReport {
            short_term_expired,
            semantic_removed,
        })
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            short_term: self.short_term.len(),
            long_term: self.long_term.len(),
            episodic: self.episodic.len(),
            semantic: self.semantic.len(),
            episodic_success_rate: self.episodic.success_rate(),
        }
    }

    pub fn flush(&self) -> Result<(), MemoryError> {
        self.substrate.flush()
    }
}

fn compare_ranked(a: &RankedItem, b: &RankedItem) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.item.kind().cmp(&b.item.kind()))
        .then_with(|| a.item.item_id().cmp(&b.item.item_id()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::memory::item::{EpisodeOutcome, EpisodicEntry, LongTermEntry, SemanticEntry, TaskSnapshot};

    fn manager() -> MemoryManager {
        let config = MemoryConfig {
            embedding_dim: 64,
            ..MemoryConfig::default()
        };
        MemoryManager::in_memory(&config).unwrap()
    }

    #[test]
    fn test_store_routes_to_one_store() {
        let m = manager();
        m.store(MemoryItem::ShortTerm(ShortTermEntry::new("k", "v"))).unwrap();
        m.store(MemoryItem::LongTerm(LongTermEntry::new("postgres runs on port 5432", 0.8)))
            .unwrap();
        m.store(MemoryItem::Semantic(SemanticEntry::new("port 5432 is postgres", 0.7)))
            .unwrap();
        let stats = m.stats();
        assert_eq!((stats.short_term, stats.long_term, stats.episodic, stats.semantic), (1, 1, 0, 1));

        let declined = m
            .store(MemoryItem::LongTerm(LongTermEntry::new("noise", 0.1)))
            .unwrap();
        assert!(matches!(declined, StoreOutcome::LongTerm(WriteOutcome::Declined { .. })));
        assert_eq!(m.stats().long_term, 1);
    }

    #[test]
    fn test_retrieve_is_deterministic_and_bounded() {
        let m = manager();
        for i in 0..5 {
            m.store(MemoryItem::LongTerm(LongTermEntry::new(
                format!("deploy service number {} to staging", i),
                0.5 + i as f32 * 0.1,
            )))
            .unwrap();
        }
        m.store(MemoryItem::Episodic(EpisodicEntry::new(
            TaskSnapshot {
                task_id: uuid::Uuid::new_v4(),
                description: "deploy service to staging".into(),
                retry_count: 1,
                context: BTreeMap::new(),
            },
            EpisodeOutcome::Failed { cause: "missing secrets".into() },
            vec!["load secrets first".into()],
        )))
        .unwrap();
        m.store(MemoryItem::ShortTerm(ShortTermEntry::new("last_env", "staging")))
            .unwrap();

        let now = Utc::now();
        let first = m.retrieve_at("deploy service to staging", 4, now).unwrap();
        let second = m.retrieve_at("deploy service to staging", 4, now).unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first, second);
        assert!(first.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_recency_decay_halves_per_half_life() {
        let policy = RankPolicy {
            recency_half_life: Duration::from_secs(100),
            ..RankPolicy::default()
        };
        let now = Utc::now();
        let r = policy.recency(now - chrono::Duration::seconds(100), now);
        assert!((r - 0.5).abs() < 1e-4);
        assert_eq!(policy.recency(now + chrono::Duration::seconds(5), now), 1.0);
    }

    #[test]
    fn test_context_degrades_on_store_failure() {
        struct WrongDim;
        impl Embedder for WrongDim {
            fn dim(&self) -> usize {
                8
            }
            fn embed(&self, _text: &str) -> Vec<f32> {
                vec![1.0; 3]
            }
        }
        let config = MemoryConfig {
            embedding_dim: 8,
            ..MemoryConfig::default()
        };
        let m = MemoryManager::new(&config, Arc::new(WrongDim), Arc::new(InMemoryKvStore::new()))
            .unwrap();
        m.store(MemoryItem::ShortTerm(ShortTermEntry::new("note", "keep going")))
            .unwrap();

        assert!(m.retrieve("anything", 5).is_err());
        let ctx = m.context_for_task("anything", 5);
        assert!(ctx.degraded.is_some());
        assert_eq!(ctx.items.len(), 1);
    }

    #[test]
    fn test_promote_moves_entry() {
        let m = manager();
        m.short_term().put("insight", "cache results between runs");
        let outcome = m.promote("insight", 0.9).unwrap().unwrap();
        assert!(outcome.is_stored());
        assert!(m.short_term().peek("insight").is_none());
        assert_eq!(m.long_term().len(), 1);
        assert_eq!(m.promote("missing", 0.9).unwrap(), None);
    }

    #[test]
    fn test_reopen_sqlite_restores_stores() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig {
            persist_dir: Some(dir.path().to_path_buf()),
            embedding_dim: 32,
            ..MemoryConfig::default()
        };
        {
            let m = MemoryManager::from_config(&config).unwrap();
            m.store(MemoryItem::LongTerm(LongTermEntry::new("durable knowledge", 0.9)))
                .unwrap();
            m.store(MemoryItem::Semantic(SemanticEntry::new("durable fact", 0.9)))
                .unwrap();
            m.flush().unwrap();
        }
        let m = MemoryManager::from_config(&config).unwrap();
        let stats = m.stats();
        assert_eq!((stats.long_term, stats.semantic, stats.short_term), (1, 1, 0));
    }
}
