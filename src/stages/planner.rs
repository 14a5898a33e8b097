//! Plan 阶段实现
//!
//! - LlmPlanner：拼接任务、历史反馈、记忆上下文、可用工具与计划 JSON Schema 后调用推理后端，
//!   解析出 Plan；输出不是合法 JSON 时退化为单步计划，结构非法（有环、引用未知工具）时报 Planning 错误
//! - DirectPlanner：不调用后端，直接生成单步计划

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::task::FEEDBACK_KEY;
use crate::core::{EngineError, Task};
use crate::llm::{ReasoningBackend, PLAN_PROMPT_HEADER};
use crate::memory::MemoryContext;
use crate::stages::{plan_schema_json, Plan, PlanStage};

/// 从模型输出中截取 JSON：优先 ```json 代码块，其次第一个 '{' 到最后一个 '}'
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

pub struct LlmPlanner {
    backend: Arc<dyn ReasoningBackend>,
    /// (name, description)
    tools: Vec<(String, String)>,
    schema: String,
}

impl LlmPlanner {
    pub fn new(backend: Arc<dyn ReasoningBackend>, tools: Vec<(String, String)>) -> Self {
        Self {
            backend,
            tools,
            schema: plan_schema_json(),
        }
    }

    fn build_prompt(&self, task: &Task, memory: &MemoryContext) -> String {
        let mut s = format!("{}\nTask: {}\nPriority: {:?}\n\n", PLAN_PROMPT_HEADER, task.description, task.priority);

        let extra: Vec<_> = task
            .context
            .iter()
            .filter(|(k, _)| !k.starts_with(FEEDBACK_KEY))
            .collect();
        if !extra.is_empty() {
            s.push_str("## Task Context\n");
            for (k, v) in extra {
                s.push_str(&format!("- {}: {}\n", k, v));
            }
            s.push('\n');
        }

        if task.retry_count > 0 {
            s.push_str("## Feedback From Previous Attempts\n");
            for n in 1..=task.retry_count {
                if let Some(fb) = task.context.get(&format!("{}_{}", FEEDBACK_KEY, n)) {
                    s.push_str(&format!("Attempt {}:\n{}\n", n, fb));
                }
            }
            s.push('\n');
        }

        let memory_section = memory.to_prompt_section();
        if !memory_section.is_empty() {
            s.push_str(&memory_section);
        }

        if !self.tools.is_empty() {
            s.push_str("## Available Tools\n");
            for (name, description) in &self.tools {
                s.push_str(&format!("- {}: {}\n", name, description));
            }
            s.push('\n');
        }

        s.push_str("## Plan Schema\n");
        s.push_str(&self.schema);
        s.push_str("\n\nRespond with one JSON object matching the schema. Subtask dependencies must not form a cycle.\n");
        s
    }

    fn check_tools(&self, plan: &Plan) -> Result<(), EngineError> {
        if self.tools.is_empty() {
            return Ok(());
        }
        for subtask in &plan.subtasks {
            if let Some(tool) = &subtask.tool {
                if !self.tools.iter().any(|(name, _)| name == tool) {
                    return Err(EngineError::Planning(format!(
                        "subtask {} uses unknown tool {:?}",
                        subtask.id, tool
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PlanStage for LlmPlanner {
    fn name(&self) -> &str {
        "llm"
    }

    async fn plan(&self, task: &Task, memory: &MemoryContext) -> Result<Plan, EngineError> {
        let prompt = self.build_prompt(task, memory);
        let generation = self
            .backend
            .generate(&prompt, &memory.to_prompt_section())
            .await
            .map_err(|e| EngineError::Planning(e.to_string()))?;

        let parsed = extract_json(&generation.text)
            .and_then(|json| serde_json::from_str::<Plan>(json).ok());
        let plan = match parsed {
            Some(plan) => plan,
            None => {
                tracing::warn!(task_id = %task.id, "Planner output was not a JSON plan, using single-step fallback");
                Plan::single_step(&task.description, None)
            }
        };
        plan.validate()?;
        self.check_tools(&plan)?;
        tracing::debug!(
            task_id = %task.id,
            subtasks = plan.len(),
            cost = plan.total_estimated_cost(),
            "Plan produced"
        );
        Ok(plan)
    }
}

/// 单步计划：用配置的工具直接处理任务描述
pub struct DirectPlanner {
    tool: String,
}

impl DirectPlanner {
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }
}

impl Default for DirectPlanner {
    fn default() -> Self {
        Self::new("echo")
    }
}

#[async_trait]
impl PlanStage for DirectPlanner {
    fn name(&self) -> &str {
        "direct"
    }

    async fn plan(&self, task: &Task, _memory: &MemoryContext) -> Result<Plan, EngineError> {
        let args = serde_json::json!({ "text": task.description });
        Ok(Plan::single_step(&task.description, Some((self.tool.as_str(), args))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedBackend;

    fn tools() -> Vec<(String, String)> {
        vec![("echo".to_string(), "echo text".to_string())]
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("Here: {\"a\": {\"b\": 2}} done"), Some("{\"a\": {\"b\": 2}}"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[tokio::test]
    async fn test_parses_plan_and_injects_feedback() {
        let backend = Arc::new(ScriptedBackend::from_texts([r#"{"subtasks": [
            {"id": "a", "description": "fetch", "tool": "echo", "args": {"text": "x"}},
            {"id": "b", "description": "summarize", "depends_on": ["a"]}
        ]}"#]));
        let planner = LlmPlanner::new(backend.clone(), tools());
        let mut task = Task::new("collect release notes");
        task.record_retry("Previous attempt scored 4.0/10. Include links.");

        let plan = planner.plan(&task, &MemoryContext::empty()).await.unwrap();
        assert_eq!(plan.len(), 2);

        let prompt = &backend.prompts()[0];
        assert!(prompt.contains("Task: collect release notes"));
        assert!(prompt.contains("Include links."));
        assert!(prompt.contains("## Plan Schema"));
        assert!(prompt.contains("- echo: echo text"));
    }

    #[tokio::test]
    async fn test_unparsable_output_falls_back_to_single_step() {
        let backend = Arc::new(ScriptedBackend::from_texts(["I would first look around."]));
        let planner = LlmPlanner::new(backend, tools());
        let plan = planner.plan(&Task::new("explore"), &MemoryContext::empty()).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.subtasks[0].description, "explore");
    }

    #[tokio::test]
    async fn test_cyclic_plan_is_planning_error() {
        let backend = Arc::new(ScriptedBackend::from_texts([r#"{"subtasks": [
            {"id": "a", "description": "a", "depends_on": ["b"]},
            {"id": "b", "description": "b", "depends_on": ["a"]}
        ]}"#]));
        let planner = LlmPlanner::new(backend, tools());
        let err = planner.plan(&Task::new("t"), &MemoryContext::empty()).await.unwrap_err();
        assert!(matches!(err, EngineError::Planning(_)));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_planning_error() {
        let backend = Arc::new(ScriptedBackend::from_texts([
            r#"{"subtasks": [{"id": "a", "description": "a", "tool": "rm_rf"}]}"#,
        ]));
        let planner = LlmPlanner::new(backend, tools());
        let err = planner.plan(&Task::new("t"), &MemoryContext::empty()).await.unwrap_err();
        assert!(matches!(err, EngineError::Planning(msg) if msg.contains("rm_rf")));
    }

    #[tokio::test]
    async fn test_direct_planner() {
        let plan = DirectPlanner::default()
            .plan(&Task::new("hello"), &MemoryContext::empty())
            .await
            .unwrap();
        assert_eq!(plan.subtasks[0].tool.as_deref(), Some("echo"));
        assert_eq!(plan.subtasks[0].args["text"], "hello");
    }
}
