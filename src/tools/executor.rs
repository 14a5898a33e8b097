//! 工具执行器
//!
//! 包装 ToolRegistry：每次调用施加超时、受全局并发上限约束，并输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::tools::{Permissions, ToolError, ToolInvoker, ToolOutput, ToolRegistry};

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64, max_concurrent: usize) -> Self {
        Self {
            registry: Arc::new(registry),
            timeout: Duration::from_secs(timeout_secs),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

#[async_trait]
impl ToolInvoker for ToolExecutor {
    /// 执行指定工具；超时返回 ToolError::Timeout；输出 JSON 审计日志
    async fn invoke(
        &self,
        tool: &str,
        args: Value,
        permissions: &Permissions,
    ) -> Result<ToolOutput, ToolError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ToolError::failed(tool, "tool executor closed"))?;

        let start = Instant::now();
        let preview = args_preview(&args);
        let result = match timeout(self.timeout, self.registry.invoke(tool, args, permissions)).await {
            Ok(r) => r,
            Err(_) => Err(ToolError::Timeout {
                tool: tool.to_string(),
                after: self.timeout,
            }),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ToolError::Denied { .. }) => "denied",
            Err(ToolError::Timeout { .. }) => "timeout",
            Err(ToolError::Unknown(_)) => "unknown",
            Err(ToolError::InvalidArgs { .. }) => "invalid_args",
            Err(ToolError::Failed { .. }) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool,
            "ok": result.is_ok(),
            "outcome": outcome,
            "cost": result.as_ref().map(|o| o.cost).unwrap_or(0.0),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");

        result
    }

    fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.registry.tool_descriptions()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, Tool};

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ToolOutput::new("late"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported() {
        let mut registry = ToolRegistry::new();
        registry.register(Sleepy).unwrap();
        let executor = ToolExecutor::new(registry, 1, 2);
        let err = executor
            .invoke("sleepy", Value::Null, &Permissions::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_invoke_passes_through() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        let executor = ToolExecutor::new(registry, 5, 1);
        let out = executor
            .invoke("echo", serde_json::json!({"text": "ping"}), &Permissions::none())
            .await
            .unwrap();
        assert_eq!(out.result, "ping");
        assert_eq!(executor.tool_descriptions().len(), 1);
    }
}
