//! Execute 阶段：按拓扑序调用工具执行子任务
//!
//! 依赖失败（或被跳过）的子任务标记为 Skipped；可重试的工具错误（超时、暂时性失败）
//! 在本次 Execute 内最多尝试 max_attempts 次，权限拒绝不重试。
//! 只要有一个子任务成功就返回 Ok，由 Critique 判断质量；全部失败时返回 Execution 错误。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::core::{EngineError, Task};
use crate::stages::{ExecuteStage, ExecutionResult, Plan, Subtask, SubtaskReport, SubtaskStatus};
use crate::tools::{Permissions, ToolInvoker};

pub struct ToolExecutorStage {
    tools: Arc<dyn ToolInvoker>,
    permissions: Permissions,
    max_attempts: u32,
}

impl ToolExecutorStage {
    pub fn new(tools: Arc<dyn ToolInvoker>, permissions: Permissions) -> Self {
        Self {
            tools,
            permissions,
            max_attempts: 2,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn run_subtask(&self, task: &Task, subtask: &Subtask) -> SubtaskReport {
        let Some(tool) = subtask.tool.as_deref() else {
            return SubtaskReport {
                id: subtask.id.clone(),
                status: SubtaskStatus::Succeeded,
                output: Some(subtask.description.clone()),
                error: None,
                attempts: 0,
                cost: 0.0,
            };
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .tools
                .invoke(tool, subtask.args.clone(), &self.permissions)
                .await
            {
                Ok(output) => {
                    return SubtaskReport {
                        id: subtask.id.clone(),
                        status: SubtaskStatus::Succeeded,
                        output: Some(output.result),
                        error: None,
                        attempts,
                        cost: output.cost,
                    };
                }
                Err(e) if e.is_retryable() && attempts < self.max_attempts => {
                    tracing::warn!(
                        task_id = %task.id,
                        subtask = %subtask.id,
                        attempt = attempts,
                        error = %e,
                        "Tool call failed, retrying"
                    );
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, subtask = %subtask.id, error = %e, "Subtask failed");
                    return SubtaskReport {
                        id: subtask.id.clone(),
                        status: SubtaskStatus::Failed,
                        output: None,
                        error: Some(e.to_string()),
                        attempts,
                        cost: 0.0,
                    };
                }
            }
        }
    }
}

#[async_trait]
impl ExecuteStage for ToolExecutorStage {
    fn name(&self) -> &str {
        "tools"
    }

    async fn execute(&self, task: &Task, plan: &Plan) -> Result<ExecutionResult, EngineError> {
        let start = Instant::now();
        let order = plan.execution_order()?;

        let mut unusable: HashSet<&str> = HashSet::new();
        let mut reports = Vec::with_capacity(order.len());
        for i in order {
            let subtask = &plan.subtasks[i];
            if let Some(dep) = subtask.depends_on.iter().find(|d| unusable.contains(d.as_str())) {
                unusable.insert(subtask.id.as_str());
                reports.push(SubtaskReport {
                    id: subtask.id.clone(),
                    status: SubtaskStatus::Skipped,
                    output: None,
                    error: Some(format!("dependency {} did not succeed", dep)),
                    attempts: 0,
                    cost: 0.0,
                });
                continue;
            }
            let report = self.run_subtask(task, subtask).await;
            if report.status != SubtaskStatus::Succeeded {
                unusable.insert(subtask.id.as_str());
            }
            reports.push(report);
        }

        let succeeded: Vec<&SubtaskReport> = reports
            .iter()
            .filter(|r| r.status == SubtaskStatus::Succeeded)
            .collect();
        if succeeded.is_empty() {
            let errors = reports
                .iter()
                .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.id, e)))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(EngineError::Execution(errors));
        }

        let success = plan.subtasks.iter().filter(|s| s.required).all(|s| {
            reports
                .iter()
                .any(|r| r.id == s.id && r.status == SubtaskStatus::Succeeded)
        });
        let output = succeeded
            .iter()
            .filter_map(|r| r.output.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        let artifacts = succeeded.iter().map(|r| r.id.clone()).collect();
        let cost = reports.iter().map(|r| r.cost).sum();

        Ok(ExecutionResult {
            output,
            artifacts,
            cost,
            duration: start.elapsed(),
            success,
            subtasks: reports,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::{json, Value};

    use super::*;
    use crate::tools::{EchoTool, Permission, Tool, ToolError, ToolOutput, ToolRegistry};

    /// 前 n 次返回暂时性错误
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails a few times"
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ToolError::transient("flaky", "try again"))
            } else {
                Ok(ToolOutput::new("finally").with_cost(0.5))
            }
        }
    }

    struct Writer;

    #[async_trait]
    impl Tool for Writer {
        fn name(&self) -> &str {
            "write_file"
        }
        fn description(&self) -> &str {
            "writes"
        }
        fn required_permissions(&self) -> &[Permission] {
            &[Permission::Write]
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::new("written"))
        }
    }

    fn stage(failures: u32) -> ToolExecutorStage {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        registry
            .register(Flaky {
                failures,
                calls: AtomicU32::new(0),
            })
            .unwrap();
        registry.register(Writer).unwrap();
        ToolExecutorStage::new(Arc::new(registry), [Permission::Read].into_iter().collect())
            .with_max_attempts(2)
    }

    #[tokio::test]
    async fn test_runs_in_dependency_order() {
        let plan = Plan::new(vec![
            Subtask::new("b", "second").with_tool("echo", json!({"text": "world"})).depends_on("a"),
            Subtask::new("a", "first").with_tool("echo", json!({"text": "hello"})),
        ]);
        let result = stage(0).execute(&Task::new("t"), &plan).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "hello\nworld");
        assert_eq!(result.artifacts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_within_budget() {
        let plan = Plan::new(vec![Subtask::new("a", "flaky").with_tool("flaky", json!({}))]);
        let result = stage(1).execute(&Task::new("t"), &plan).await.unwrap();
        assert_eq!(result.subtasks[0].attempts, 2);
        assert_eq!(result.cost, 0.5);

        let err = stage(5).execute(&Task::new("t"), &plan).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution(msg) if msg.contains("try again")));
    }

    #[tokio::test]
    async fn test_denied_is_not_retried_and_dependents_skipped() {
        let plan = Plan::new(vec![
            Subtask::new("a", "note"),
            Subtask::new("w", "write").with_tool("write_file", json!({})),
            Subtask::new("after", "after write").depends_on("w"),
        ]);
        let result = stage(0).execute(&Task::new("t"), &plan).await.unwrap();
        assert!(!result.success);
        let by_id = |id: &str| result.subtasks.iter().find(|r| r.id == id).unwrap();
        assert_eq!(by_id("w").status, SubtaskStatus::Failed);
        assert_eq!(by_id("w").attempts, 1);
        assert_eq!(by_id("after").status, SubtaskStatus::Skipped);
        assert_eq!(result.output, "note");
    }

    #[tokio::test]
    async fn test_optional_failure_keeps_success() {
        let plan = Plan::new(vec![
            Subtask::new("a", "main").with_tool("echo", json!({"text": "ok"})),
            Subtask::new("w", "nice to have").with_tool("write_file", json!({})).optional(),
        ]);
        let result = stage(0).execute(&Task::new("t"), &plan).await.unwrap();
        assert!(result.success);
        assert_eq!(result.failed_subtasks().count(), 1);
    }
}
