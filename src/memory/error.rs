//! 记忆层错误类型

use thiserror::Error;

/// 记忆子系统错误；上层（Engine）统一降级为 MemoryUnavailable
#[derive(Error, Debug)]
pub enum MemoryError {
    /// 查询向量与索引维度不一致（硬错误，不做截断或补零）
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Memory unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        MemoryError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Serialization(e.to_string())
    }
}
