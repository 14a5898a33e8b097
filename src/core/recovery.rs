//! 错误恢复引擎
//!
//! 根据 EngineError 类型返回 RecoveryAction，供控制循环决定是带反馈重试、降级继续还是终止。
//! 规划 / 执行 / 超时 / 低分评审一律按「消耗一次重试并注入反馈」处理；取消永不重试。

use crate::core::{EngineError, RecoveryAction, Stage};

#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &EngineError) -> RecoveryAction {
        match err {
            EngineError::Planning(msg) => RecoveryAction::RetryWithFeedback(format!(
                "The previous plan could not be produced or was invalid: {msg}. \
                 Return a single JSON plan whose subtask dependencies form no cycle."
            )),
            EngineError::Execution(msg) => RecoveryAction::RetryWithFeedback(format!(
                "Execution of the previous plan failed: {msg}. \
                 Choose different tools or smaller steps."
            )),
            EngineError::CritiqueBelowThreshold {
                score,
                threshold,
                feedback,
            } => RecoveryAction::RetryWithFeedback(format!(
                "Previous attempt scored {score:.1}/10 (needs {threshold:.1}). {feedback}"
            )),
            EngineError::CritiqueFailed(msg) => RecoveryAction::RetryWithFeedback(format!(
                "The result could not be reviewed: {msg}."
            )),
            EngineError::StageTimeout { stage, after } => {
                let hint = match stage {
                    Stage::Execute => "Use fewer or faster subtasks.",
                    _ => "Keep the response shorter.",
                };
                RecoveryAction::RetryWithFeedback(format!(
                    "The {stage} stage timed out after {}s. {hint}",
                    after.as_secs()
                ))
            }
            EngineError::MemoryUnavailable(msg) => RecoveryAction::Degrade(msg.clone()),
            EngineError::Cancelled => RecoveryAction::Abort("cancelled".to_string()),
            other => RecoveryAction::Abort(other.to_string()),
        }
    }
}
