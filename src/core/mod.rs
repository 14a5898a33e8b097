//! 核心编排层：任务与状态机、错误与恢复、任务历史、编排引擎、任务调度、优雅关闭

pub mod engine;
pub mod error;
pub mod history;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod task;
pub mod task_scheduler;

pub use engine::Engine;
pub use error::{EngineError, RecoveryAction};
pub use history::{CycleRecord, FailureReason, Resolution, TaskHistoryStore, TaskRecord, TerminalOutcome};
pub use recovery::RecoveryEngine;
pub use shutdown::{
    CleanupReport, MemoryFlush, SchedulerDrain, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
pub use state::{Stage, TaskStatus, TaskView};
pub use task::{Priority, Task, TaskId};
pub use task_scheduler::{SchedulerStats, TaskHandle, TaskScheduler};
