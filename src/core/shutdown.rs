//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM 后：
//! - 取消正在运行的任务（在下一个阶段边界进入 Failed）
//! - 等待调度器工作协程退出
//! - flush 记忆持久化底座
//!
//! 应用正常结束时调度器只排空、不取消；清理结果汇总为 CleanupReport。

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::task_scheduler::TaskScheduler;
use crate::memory::MemoryManager;

/// 关闭信号管理器
///
/// 所有正在运行的任务共用 token()；第一次触发的原因被保留，之后的触发只记日志。
#[derive(Clone, Default)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 传给 Engine / 调度器的取消 token
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        match *current {
            Some(first) => tracing::debug!(?first, ?reason, "Shutdown already requested"),
            None => {
                tracing::info!(?reason, "Shutdown requested");
                *current = Some(reason);
            }
        }
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 第一次触发关闭的原因；未触发时为 None
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装 Ctrl+C 与（unix 下）SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        manager.shutdown(ShutdownReason::Signal);
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to install SIGTERM handler"),
                }
            });
        }
    }
}

/// 关闭时执行的清理
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 日志与 CleanupReport 中使用的名称
    fn name(&self) -> &'static str;
}

/// 各清理项的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
    pub timed_out: Vec<&'static str>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

/// 按注册顺序执行清理；单项失败或超时不影响后续项
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// 每个清理项的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) -> CleanupReport {
        tracing::info!(count = self.cleanup_tasks.len(), "Running cleanup tasks");
        let mut report = CleanupReport::default();
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!(task = name, "Cleanup completed");
                    report.completed.push(name);
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = name, error = %e, "Cleanup failed");
                    report.failed.push((name, e.to_string()));
                }
                Err(_) => {
                    tracing::warn!(task = name, timeout = ?self.timeout, "Cleanup timed out");
                    report.timed_out.push(name);
                }
            }
        }
        report
    }
}

/// 停止调度器：关闭已触发时取消运行中的任务，否则等它们自然结束
pub struct SchedulerDrain {
    scheduler: Arc<TaskScheduler>,
    shutdown: CancellationToken,
}

impl SchedulerDrain {
    pub fn new(scheduler: Arc<TaskScheduler>, shutdown: CancellationToken) -> Self {
        Self { scheduler, shutdown }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SchedulerDrain {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let cancel_running = self.shutdown.is_cancelled();
        self.scheduler.shutdown(cancel_running).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scheduler"
    }
}

/// flush 记忆持久化底座
pub struct MemoryFlush {
    memory: Arc<MemoryManager>,
}

impl MemoryFlush {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for MemoryFlush {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let swept = self.memory.sweep()?;
        tracing::debug!(
            short_term_expired = swept.short_term_expired,
            semantic_removed = swept.semantic_removed,
            "Memory swept before flush"
        );
        self.memory.flush()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// 运行 app 直到结束或收到关闭信号，然后执行清理
///
/// 返回关闭原因（app 正常结束时为 None）与清理结果。
pub async fn run_with_graceful_shutdown<F, C, Fut, R>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: C,
) -> (Option<ShutdownReason>, R)
where
    F: Future<Output = ()>,
    C: FnOnce() -> Fut,
    Fut: Future<Output = R>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => tracing::info!("Application finished normally"),
        _ = shutdown_manager.wait_for_shutdown() => tracing::info!("Shutdown signal received"),
    }

    let reason = shutdown_manager.reason();
    (reason, cleanup().await)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::config::MemoryConfig;

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        assert_eq!(manager.reason(), None);

        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }

    struct Flag(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl ShutdownCleanup for Flag {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "flag"
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Broken {
        async fn cleanup(&self) -> anyhow::Result<()> {
            anyhow::bail!("disk gone")
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Stuck {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_reports_each_cleanup() {
        let memory = Arc::new(MemoryManager::in_memory(&MemoryConfig::default()).unwrap());
        memory.short_term().put("k", "v");

        let called = Arc::new(AtomicBool::new(false));
        let mut coordinator = ShutdownCoordinator::new().with_timeout(Duration::from_secs(1));
        coordinator.register(MemoryFlush::new(Arc::clone(&memory)));
        coordinator.register(Stuck);
        coordinator.register(Broken);
        coordinator.register(Flag(Arc::clone(&called)));
        let report = coordinator.run_cleanup().await;

        assert!(called.load(Ordering::SeqCst));
        assert_eq!(memory.stats().short_term, 1);
        assert_eq!(report.completed, vec!["memory", "flag"]);
        assert_eq!(report.timed_out, vec!["stuck"]);
        assert_eq!(report.failed, vec![("broken", "disk gone".to_string())]);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_normal_finish_has_no_reason() {
        let manager = Arc::new(ShutdownManager::new());
        let (reason, report) = run_with_graceful_shutdown(Arc::clone(&manager), async {}, || async {
            CleanupReport::default()
        })
        .await;
        assert_eq!(reason, None);
        assert!(report.is_clean());
        assert!(!manager.is_shutdown());
    }
}
