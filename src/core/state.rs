//! 状态定义：任务状态机、阶段枚举与 TaskView 投影
//!
//! 调用方（调度器、API 层）只持有轻量的 TaskView（状态、重试次数、已完成的周期数、最近评分）；
//! 完整的周期历史由 Engine 维护在 TaskRecord 中，并投影到 TaskView。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::history::{Resolution, TaskRecord};
use crate::core::task::TaskId;

/// 任务状态
///
/// `Pending → Planning → Executing → Critiquing → {Learning | Retrying → Planning} → {Completed | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    Executing,
    Critiquing,
    Retrying,
    Learning,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 合法迁移；除 Retrying → Planning 外不允许回退，任何非终态都可直接进入 Failed
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (*self, next) {
            (Completed | Failed, _) => false,
            (Learning, Failed) => false,
            (_, Failed) => true,
            (Pending, Planning) => true,
            (Planning, Executing | Retrying) => true,
            (Executing, Critiquing | Retrying) => true,
            (Critiquing, Learning | Retrying) => true,
            (Retrying, Planning) => true,
            (Learning, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::Executing => "executing",
            TaskStatus::Critiquing => "critiquing",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Learning => "learning",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 控制循环中的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Plan,
    Execute,
    Critique,
    Learn,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Plan => "plan",
            Stage::Execute => "execute",
            Stage::Critique => "critique",
            Stage::Learn => "learn",
        };
        f.write_str(s)
    }
}

/// 任务进度的只读投影
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// 已结束的 plan–execute–critique 周期数
    pub cycles: usize,
    pub last_score: Option<f32>,
    pub last_feedback: Option<String>,
    pub failure: Option<String>,
}

impl TaskView {
    pub fn project(record: &TaskRecord) -> Self {
        let last_critique = record.cycles.iter().rev().find_map(|c| c.critique.as_ref());
        let last_feedback = record
            .cycles
            .last()
            .and_then(|c| c.error.clone().or_else(|| c.critique.as_ref().map(|k| k.feedback.clone())));
        let failure = match &record.resolution {
            Some(Resolution::Failed { reason }) => Some(reason.to_string()),
            _ => None,
        };
        Self {
            id: record.task.id,
            description: record.task.description.clone(),
            status: record.task.status,
            retry_count: record.task.retry_count,
            max_retries: record.task.max_retries,
            cycles: record.cycles.len(),
            last_score: last_critique.map(|c| c.score),
            last_feedback,
            failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_advance_to(Planning));
        assert!(Planning.can_advance_to(Executing));
        assert!(Executing.can_advance_to(Critiquing));
        assert!(Critiquing.can_advance_to(Learning));
        assert!(Learning.can_advance_to(Completed));
    }

    #[test]
    fn test_only_retry_edge_goes_back() {
        use TaskStatus::*;
        assert!(Critiquing.can_advance_to(Retrying));
        assert!(Retrying.can_advance_to(Planning));
        assert!(!Critiquing.can_advance_to(Planning));
        assert!(!Executing.can_advance_to(Planning));
        assert!(!Completed.can_advance_to(Planning));
        assert!(!Failed.can_advance_to(Retrying));
    }

    #[test]
    fn test_failure_reachable_from_non_terminal() {
        use TaskStatus::*;
        for s in [Pending, Planning, Executing, Critiquing, Retrying] {
            assert!(s.can_advance_to(Failed), "{s} -> failed");
        }
        assert!(!Completed.can_advance_to(Failed));
    }
}
