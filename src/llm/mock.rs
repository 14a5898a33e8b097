//! 测试与演示用后端（无需外部服务）
//!
//! - ScriptedBackend：按顺序返回预设结果，记录收到的 prompt
//! - MockBackend：按 prompt 类型给出确定性回答（规划返回单步 JSON 计划，评审返回固定分数）

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::llm::{BackendError, Generation, ReasoningBackend};

/// 规划 prompt 的标题行；MockBackend 据此识别请求类型
pub const PLAN_PROMPT_HEADER: &str = "# Task Planning";
pub const CRITIQUE_PROMPT_HEADER: &str = "# Result Review";

/// 脚本化后端：依次弹出预设结果，耗尽后返回 fallback
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<Generation, BackendError>>>,
    fallback: Generation,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<Generation, BackendError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Generation::new("", 0.0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 由纯文本回答构造
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            texts
                .into_iter()
                .map(|t| Ok(Generation::new(t, 0.0)))
                .collect(),
        )
    }

    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Generation::new(text, 0.0);
        self
    }

    /// 已收到的 prompt（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    async fn generate(&self, prompt: &str, _context: &str) -> Result<Generation, BackendError> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// 确定性 Mock：规划请求返回单步 echo 计划，评审请求返回 8/10
#[derive(Debug, Default)]
pub struct MockBackend;

#[async_trait]
impl ReasoningBackend for MockBackend {
    async fn generate(&self, prompt: &str, _context: &str) -> Result<Generation, BackendError> {
        if prompt.contains(PLAN_PROMPT_HEADER) {
            let description = prompt
                .lines()
                .find_map(|l| l.strip_prefix("Task: "))
                .unwrap_or("(no task)");
            let plan = serde_json::json!({
                "subtasks": [{
                    "id": "step-1",
                    "description": description,
                    "tool": "echo",
                    "args": { "text": description },
                    "depends_on": [],
                    "estimated_cost": 0.01,
                    "estimated_time_secs": 1.0,
                    "estimated_risk": 0.1
                }]
            });
            return Ok(Generation::new(plan.to_string(), 0.01));
        }
        if prompt.contains(CRITIQUE_PROMPT_HEADER) {
            return Ok(Generation::new(
                "Score: 8/10\nFeedback: Output addresses the task.\nAreas for Improvement:\n- Add more detail",
                0.01,
            ));
        }
        Ok(Generation::new(format!("Mock: {}", prompt), 0.0))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_backend_plays_in_order() {
        let backend = ScriptedBackend::from_texts(["a", "b"]).with_fallback("z");
        assert_eq!(backend.generate("1", "").await.unwrap().text, "a");
        assert_eq!(backend.generate("2", "").await.unwrap().text, "b");
        assert_eq!(backend.generate("3", "").await.unwrap().text, "z");
        assert_eq!(backend.prompts(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_mock_backend_plans_as_json() {
        let prompt = format!("{}\nTask: say hi\n", PLAN_PROMPT_HEADER);
        let g = MockBackend.generate(&prompt, "").await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&g.text).unwrap();
        assert_eq!(v["subtasks"][0]["args"]["text"], "say hi");
    }
}
