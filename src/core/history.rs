//! 任务历史：每个周期的 Plan / ExecutionResult / Critique 及最终结局
//!
//! Engine 在每个周期结束后把 TaskRecord 写入持久化底座（命名空间 task_history），
//! 进程在两个周期之间崩溃后可由 Engine::resume 按记录继续。

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::{Task, TaskId};
use crate::core::EngineError;
use crate::memory::persistence::{get_json, put_json, scan_json, KvStore};
use crate::stages::{Critique, ExecutionResult, Plan};

pub const NAMESPACE: &str = "task_history";

/// 一个 plan–execute–critique 周期的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// 该周期开始时的重试计数
    pub attempt: u32,
    pub plan: Option<Plan>,
    pub result: Option<ExecutionResult>,
    pub critique: Option<Critique>,
    /// 该周期失败原因（阶段错误、超时、低分、取消）
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CycleRecord {
    pub fn start(attempt: u32) -> Self {
        Self {
            attempt,
            plan: None,
            result: None,
            critique: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self, error: Option<String>) {
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    /// 已结束且评审通过的周期，取出其 Plan / ExecutionResult / Critique
    pub fn passed(&self) -> Option<(Plan, ExecutionResult, Critique)> {
        self.finished_at?;
        match (&self.plan, &self.result, &self.critique) {
            (Some(plan), Some(result), Some(critique)) if critique.passed && self.error.is_none() => {
                Some((plan.clone(), result.clone(), critique.clone()))
            }
            _ => None,
        }
    }

    /// 失败周期的原因摘要
    pub fn cause(&self) -> Option<String> {
        if let Some(e) = &self.error {
            return Some(e.clone());
        }
        self.critique
            .as_ref()
            .filter(|c| !c.passed)
            .map(|c| format!("score {:.1}/10: {}", c.score, c.feedback))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Cancelled,
    RetriesExhausted,
    /// 不可重试的错误
    Fatal(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::RetriesExhausted => f.write_str("retry budget exhausted"),
            FailureReason::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Completed {
        result: ExecutionResult,
        critique: Critique,
    },
    Failed {
        reason: FailureReason,
    },
}

/// 持久化的任务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub cycles: Vec<CycleRecord>,
    pub resolution: Option<Resolution>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            cycles: Vec::new(),
            resolution: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.resolution.is_some()
    }
}

/// run 的最终结果：Completed 携带最终执行结果，Failed 携带原因；两者都带完整周期历史
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalOutcome {
    pub task: Task,
    pub cycles: Vec<CycleRecord>,
    pub resolution: Resolution,
}

impl TerminalOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self.resolution, Resolution::Completed { .. })
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match &self.resolution {
            Resolution::Failed { reason } => Some(reason),
            Resolution::Completed { .. } => None,
        }
    }

    pub fn final_result(&self) -> Option<&ExecutionResult> {
        match &self.resolution {
            Resolution::Completed { result, .. } => Some(result),
            Resolution::Failed { .. } => None,
        }
    }

    /// 每个失败周期的原因，按发生顺序
    pub fn cause_chain(&self) -> Vec<String> {
        self.cycles
            .iter()
            .filter_map(|c| c.cause().map(|cause| format!("attempt {}: {}", c.attempt, cause)))
            .collect()
    }

    pub(crate) fn from_record(record: TaskRecord) -> Option<Self> {
        let resolution = record.resolution?;
        Some(Self {
            task: record.task,
            cycles: record.cycles,
            resolution,
        })
    }
}

/// 任务历史存储
#[derive(Clone)]
pub struct TaskHistoryStore {
    substrate: Arc<dyn KvStore>,
}

impl TaskHistoryStore {
    pub fn new(substrate: Arc<dyn KvStore>) -> Self {
        Self { substrate }
    }

    pub fn save(&self, record: &TaskRecord) -> Result<(), EngineError> {
        put_json(
            self.substrate.as_ref(),
            NAMESPACE,
            &record.task.id.to_string(),
            record,
        )
        .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub fn load(&self, id: TaskId) -> Result<Option<TaskRecord>, EngineError> {
        get_json(self.substrate.as_ref(), NAMESPACE, &id.to_string())
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub fn all(&self) -> Result<Vec<TaskRecord>, EngineError> {
        scan_json(self.substrate.as_ref(), NAMESPACE)
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// 尚未到达终态的记录（崩溃后待恢复）
    pub fn unfinished(&self) -> Result<Vec<TaskRecord>, EngineError> {
        Ok(self.all()?.into_iter().filter(|r| !r.is_finished()).collect())
    }
}
