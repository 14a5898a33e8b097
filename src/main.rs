//! Hive - Rust 自主任务执行平台
//!
//! 入口：加载配置、初始化日志，组装记忆 / 工具 / 阶段 / 引擎 / 调度器，
//! 先恢复上次中断的任务，再把命令行参数作为任务提交，打印终态后优雅关闭。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures_util::future::join_all;
use hive::config::load_config;
use hive::core::shutdown::run_with_graceful_shutdown;
use hive::core::{
    Engine, MemoryFlush, Resolution, SchedulerDrain, ShutdownCoordinator, ShutdownManager, Task,
    TaskScheduler, TerminalOutcome,
};
use hive::llm::{MockBackend, RetryConfig, RetryingBackend};
use hive::memory::MemoryManager;
use hive::stages::StageSet;
use hive::tools::{EchoTool, ToolExecutor, ToolRegistry};

fn print_outcome(outcome: &TerminalOutcome) {
    match &outcome.resolution {
        Resolution::Completed { result, critique } => {
            println!(
                "[completed] {} (score {:.1}, retries {})\n{}",
                outcome.task.description, critique.score, outcome.task.retry_count, result.output
            );
        }
        Resolution::Failed { reason } => {
            println!("[failed] {}: {}", outcome.task.description, reason);
            for cause in outcome.cause_chain() {
                println!("  - {}", cause);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::var_os("HIVE_CONFIG").map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let memory = Arc::new(MemoryManager::from_config(&config.memory).context("Failed to open memory")?);

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool).context("Failed to register tools")?;
    let tools = Arc::new(ToolExecutor::new(
        registry,
        config.tools.tool_timeout_secs,
        config.scheduler.max_concurrent_tools,
    ));
    let backend = Arc::new(RetryingBackend::new(Arc::new(MockBackend), RetryConfig::default()));

    let stages = StageSet::from_config(&config, backend, tools, Arc::clone(&memory))
        .context("Failed to configure stages")?;
    let engine = Arc::new(Engine::from_config(&config, stages, Arc::clone(&memory)));
    let scheduler = Arc::new(TaskScheduler::start(Arc::clone(&engine), &config.scheduler));

    let shutdown = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new();
    coordinator.register(SchedulerDrain::new(Arc::clone(&scheduler), shutdown.token()));
    coordinator.register(MemoryFlush::new(Arc::clone(&memory)));

    let mut descriptions: Vec<String> = std::env::args().skip(1).collect();
    if descriptions.is_empty() {
        descriptions.push("Summarize what a plan-execute-critique loop does".to_string());
    }
    let unfinished = engine.history().unfinished().context("Failed to read task history")?;
    let max_retries = config.engine.max_retries;
    let token = shutdown.token();

    let app = async {
        for record in unfinished {
            match engine.resume(record.task.id, &token).await {
                Ok(outcome) => print_outcome(&outcome),
                Err(e) => tracing::warn!(task_id = %record.task.id, error = %e, "Resume failed"),
            }
        }

        let handles: Vec<_> = descriptions
            .into_iter()
            .filter_map(|d| match scheduler.submit(Task::new(d).with_max_retries(max_retries)) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "Submission rejected");
                    None
                }
            })
            .collect();

        for outcome in join_all(handles.into_iter().map(|h| h.outcome())).await {
            match outcome {
                Ok(outcome) => print_outcome(&outcome),
                Err(e) => tracing::warn!(error = %e, "Task did not finish"),
            }
        }
        tracing::info!(stats = ?scheduler.stats(), memory = ?memory.stats(), "All tasks finished");
    };

    let (reason, report) = run_with_graceful_shutdown(shutdown, app, || coordinator.run_cleanup()).await;
    if let Some(reason) = reason {
        tracing::info!(?reason, "Stopped by shutdown signal");
    }
    if !report.is_clean() {
        tracing::warn!(failed = ?report.failed, timed_out = ?report.timed_out, "Shutdown cleanup incomplete");
    }
    Ok(())
}
