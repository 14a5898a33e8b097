//! 任务：标识、优先级、上下文与重试计数

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::EngineError;
use crate::core::state::TaskStatus;
use crate::memory::TaskSnapshot;

/// 上下文中最近一次反馈的键（规划器读取）
pub const FEEDBACK_KEY: &str = "feedback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub priority: Priority,
    pub context: BTreeMap<String, String>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            description: description.into(),
            priority: Priority::default(),
            context: BTreeMap::new(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 状态迁移；非法迁移返回错误且不修改状态
    pub fn advance(&mut self, next: TaskStatus) -> Result<(), EngineError> {
        if !self.status.can_advance_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// 消耗一次重试并注入反馈；预算已耗尽时返回 false 且不做任何修改
    pub fn record_retry(&mut self, feedback: &str) -> bool {
        if self.retry_count >= self.max_retries {
            return false;
        }
        self.retry_count += 1;
        self.context
            .insert(format!("{}_{}", FEEDBACK_KEY, self.retry_count), feedback.to_string());
        self.context.insert(FEEDBACK_KEY.to_string(), feedback.to_string());
        true
    }

    /// 最近一次注入的反馈
    pub fn feedback(&self) -> Option<&str> {
        self.context.get(FEEDBACK_KEY).map(String::as_str)
    }

    /// 从持久化记录恢复时，把中断在某阶段内的状态退回到该周期开始前
    pub(crate) fn rewind_for_resume(&mut self) {
        if !self.status.is_terminal() {
            self.status = if self.retry_count == 0 {
                TaskStatus::Pending
            } else {
                TaskStatus::Retrying
            };
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.0,
            description: self.description.clone(),
            retry_count: self.retry_count,
            context: self.context.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_budget_is_bounded() {
        let mut task = Task::new("t").with_max_retries(2);
        assert!(task.record_retry("first"));
        assert!(task.record_retry("second"));
        assert!(!task.record_retry("third"));
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.feedback(), Some("second"));
        assert_eq!(task.context.get("feedback_1").map(String::as_str), Some("first"));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut task = Task::new("t");
        assert!(task.advance(TaskStatus::Executing).is_err());
        assert_eq!(task.status, TaskStatus::Pending);
        task.advance(TaskStatus::Planning).unwrap();
        task.advance(TaskStatus::Executing).unwrap();
        assert!(task.advance(TaskStatus::Planning).is_err());
    }
}
