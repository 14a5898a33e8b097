//! 引擎错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 EngineError 决定 RetryWithFeedback / Degrade / Abort。

use std::time::Duration;

use thiserror::Error;

use crate::core::state::{Stage, TaskStatus};
use crate::core::task::TaskId;
use crate::memory::MemoryError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Planning failed: {0}")]
    Planning(String),

    /// 工具调用失败或执行动作失败
    #[error("Execution failed: {0}")]
    Execution(String),

    /// 不是故障，而是预期内的控制流信号
    #[error("Critique score {score:.1} below threshold {threshold:.1}")]
    CritiqueBelowThreshold {
        score: f32,
        threshold: f32,
        feedback: String,
    },

    /// 评审阶段本身出错（后端不可用等）
    #[error("Critique failed: {0}")]
    CritiqueFailed(String),

    #[error("Memory unavailable: {0}")]
    MemoryUnavailable(String),

    #[error("Stage {stage} timed out after {after:?}")]
    StageTimeout { stage: Stage, after: Duration },

    #[error("Cancellation requested")]
    Cancelled,

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Submission queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Scheduler is shut down")]
    SchedulerClosed,

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<MemoryError> for EngineError {
    fn from(e: MemoryError) -> Self {
        EngineError::MemoryUnavailable(e.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 消耗一次重试，把反馈注入下一轮规划
    RetryWithFeedback(String),
    /// 记录降级并继续（不消耗重试）
    Degrade(String),
    /// 立即终止为 Failed，不消耗重试
    Abort(String),
}
