//! 记忆层：短期（LRU + TTL）、长期（重要度准入 + 向量检索）、情景（只追加）、语义（置信度事实），
//! 由 MemoryManager 合并为统一的排序上下文；持久化底座为 KvStore（SQLite / 内存）。

pub mod episodic;
pub mod error;
pub mod item;
pub mod long_term;
pub mod manager;
pub mod persistence;
pub mod semantic;
pub mod short_term;
pub mod tokenizer;
pub mod vector_index;

pub use episodic::{EpisodeHit, EpisodicStore};
pub use error::MemoryError;
pub use item::{
    EpisodeOutcome, EpisodicEntry, LongTermEntry, MemoryContext, MemoryItem, MemoryKind,
    RankedItem, SemanticEntry, ShortTermEntry, StoreOutcome, TaskSnapshot,
};
pub use long_term::{LongTermHit, LongTermStore, WriteOutcome};
pub use manager::{MemoryManager, MemoryStats, RankPolicy, SweepReport};
pub use persistence::{InMemoryKvStore, KvStore, SqliteKvStore};
pub use semantic::{ConfidenceBlend, SemanticHit, SemanticStore};
pub use short_term::ShortTermStore;
pub use vector_index::{cosine_similarity, VectorHit, VectorIndex};
