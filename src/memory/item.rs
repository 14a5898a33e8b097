//! 记忆条目：四类存储的数据模型与检索结果

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::long_term::WriteOutcome;

/// 记忆种类；排序即合并检索时的并列次序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    ShortTerm,
    LongTerm,
    Episodic,
    Semantic,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryKind::ShortTerm => "short_term",
            MemoryKind::LongTerm => "long_term",
            MemoryKind::Episodic => "episodic",
            MemoryKind::Semantic => "semantic",
        };
        f.write_str(s)
    }
}

/// 短期记忆条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortTermEntry {
    pub key: String,
    pub value: String,
    /// 最近一次写入（TTL 起算点）
    pub written_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    /// 首次插入序号，LRU 并列时按它淘汰
    pub insertion_seq: u64,
}

impl ShortTermEntry {
    /// 构造一个待写入的条目；时间戳与序号由 ShortTermStore 写入时重新赋值
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            value: value.into(),
            written_at: now,
            last_access: now,
            insertion_seq: 0,
        }
    }
}

/// 长期记忆条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTermEntry {
    pub id: Uuid,
    pub content: String,
    /// 为空时由 MemoryManager 用配置的 Embedder 生成
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub importance: f32,
    pub timestamp: DateTime<Utc>,
}

impl LongTermEntry {
    pub fn new(content: impl Into<String>, importance: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            embedding: Vec::new(),
            importance,
            timestamp: Utc::now(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }
}

/// 情景记忆中保存的任务快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub description: String,
    pub retry_count: u32,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

/// 一次任务的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EpisodeOutcome {
    Succeeded { score: f32 },
    Failed { cause: String },
}

impl EpisodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, EpisodeOutcome::Succeeded { .. })
    }
}

/// 情景记忆条目；写入后不可修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicEntry {
    pub id: Uuid,
    pub task: TaskSnapshot,
    pub outcome: EpisodeOutcome,
    pub lessons: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl EpisodicEntry {
    pub fn new(task: TaskSnapshot, outcome: EpisodeOutcome, lessons: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            outcome,
            lessons,
            recorded_at: Utc::now(),
        }
    }

    /// 检索时的重要度：失败经验略高于成功经验
    pub fn importance(&self) -> f32 {
        if self.outcome.is_success() {
            0.8
        } else {
            0.9
        }
    }
}

/// 语义事实；related 只保存其它事实的规范化键，通过 SemanticStore 解析
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticEntry {
    pub key: String,
    pub fact: String,
    pub confidence: f32,
    #[serde(default)]
    pub related: BTreeSet<String>,
    #[serde(default = "default_observations")]
    pub observations: u32,
    pub updated_at: DateTime<Utc>,
}

fn default_observations() -> u32 {
    1
}

impl SemanticEntry {
    /// 待写入的事实；key 由 SemanticStore 规范化生成
    pub fn new(fact: impl Into<String>, confidence: f32) -> Self {
        Self {
            key: String::new(),
            fact: fact.into(),
            confidence,
            related: BTreeSet::new(),
            observations: 1,
            updated_at: Utc::now(),
        }
    }

    pub fn with_related<I, S>(mut self, related: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.related = related.into_iter().map(Into::into).collect();
        self
    }
}

/// 四类记忆的统一表示
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryItem {
    ShortTerm(ShortTermEntry),
    LongTerm(LongTermEntry),
    Episodic(EpisodicEntry),
    Semantic(SemanticEntry),
}

impl MemoryItem {
    pub fn kind(&self) -> MemoryKind {
        match self {
            MemoryItem::ShortTerm(_) => MemoryKind::ShortTerm,
            MemoryItem::LongTerm(_) => MemoryKind::LongTerm,
            MemoryItem::Episodic(_) => MemoryKind::Episodic,
            MemoryItem::Semantic(_) => MemoryKind::Semantic,
        }
    }

    /// 稳定标识，用于排序并列时的最终次序
    pub fn item_id(&self) -> String {
        match self {
            MemoryItem::ShortTerm(e) => e.key.clone(),
            MemoryItem::LongTerm(e) => e.id.to_string(),
            MemoryItem::Episodic(e) => e.id.to_string(),
            MemoryItem::Semantic(e) => e.key.clone(),
        }
    }

    /// 参与时间衰减的时间点
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MemoryItem::ShortTerm(e) => e.last_access,
            MemoryItem::LongTerm(e) => e.timestamp,
            MemoryItem::Episodic(e) => e.recorded_at,
            MemoryItem::Semantic(e) => e.updated_at,
        }
    }

    /// 单行摘要，用于拼入 prompt
    pub fn summary(&self) -> String {
        match self {
            MemoryItem::ShortTerm(e) => format!("{}: {}", e.key, e.value),
            MemoryItem::LongTerm(e) => e.content.clone(),
            MemoryItem::Episodic(e) => {
                let outcome = match &e.outcome {
                    EpisodeOutcome::Succeeded { score } => format!("succeeded (score {:.1})", score),
                    EpisodeOutcome::Failed { cause } => format!("failed: {}", cause),
                };
                if e.lessons.is_empty() {
                    format!("{} -> {}", e.task.description, outcome)
                } else {
                    format!(
                        "{} -> {}; lessons: {}",
                        e.task.description,
                        outcome,
                        e.lessons.join("; ")
                    )
                }
            }
            MemoryItem::Semantic(e) => format!("{} (confidence {:.2})", e.fact, e.confidence),
        }
    }
}

/// 合并检索的结果项与各分量得分
#[derive(Debug, Clone, PartialEq)]
pub struct RankedItem {
    pub item: MemoryItem,
    pub similarity: f32,
    pub importance: f32,
    pub recency: f32,
    pub score: f32,
}

/// MemoryManager::store 的写入结果（每个条目只落到一个存储）
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    ShortTerm { key: String },
    LongTerm(WriteOutcome),
    Episodic { id: Uuid },
    Semantic { key: String, confidence: f32 },
}

/// 供 Plan 阶段使用的记忆上下文
///
/// degraded 为 Some 时表示记忆层不可用或部分不可用，items 可能为空。
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    pub items: Vec<RankedItem>,
    pub degraded: Option<String>,
}

impl MemoryContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            degraded: Some(reason.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 按种类分节渲染：Recent Context / Relevant Knowledge / Similar Past Tasks / Known Facts
    pub fn to_prompt_section(&self) -> String {
        let sections = [
            (MemoryKind::ShortTerm, "Recent Context"),
            (MemoryKind::LongTerm, "Relevant Knowledge"),
            (MemoryKind::Episodic, "Similar Past Tasks"),
            (MemoryKind::Semantic, "Known Facts"),
        ];
        let mut s = String::new();
        for (kind, title) in sections {
            let lines: Vec<String> = self
                .items
                .iter()
                .filter(|r| r.item.kind() == kind)
                .map(|r| format!("- {}\n", r.item.summary()))
                .collect();
            if lines.is_empty() {
                continue;
            }
            s.push_str(&format!("## {}\n", title));
            for line in lines {
                s.push_str(&line);
            }
            s.push('\n');
        }
        s
    }
}
