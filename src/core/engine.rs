//! 编排引擎：Plan → Execute → Critique → {Learn | Retry} 控制循环
//!
//! - 每个阶段在独立超时下运行；Execute 超时直接进入重试判定，不做 Critique
//! - 阶段失败、超时与低分评审由 RecoveryEngine 决定去向，重试会消耗一次预算并把反馈注入任务上下文
//! - 取消在阶段边界、阶段出错后与退避等待中检查，立即进入 Failed，不消耗重试，不调用 Learn
//! - 阶段报告记忆不可用时，以空记忆上下文重跑一次周期且不消耗重试；再次出现才按普通失败计入预算
//! - 每个周期结束后持久化 TaskRecord，崩溃后可由 resume 继续

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, EngineConfig};
use crate::core::history::{CycleRecord, FailureReason, Resolution, TaskHistoryStore, TaskRecord, TerminalOutcome};
use crate::core::{EngineError, RecoveryAction, RecoveryEngine, Stage, Task, TaskId, TaskStatus, TaskView};
use crate::memory::{EpisodeOutcome, EpisodicEntry, MemoryContext, MemoryItem, MemoryManager};
use crate::stages::{Critique, ExecutionResult, LearnInput, Plan, StageSet};

/// 一个周期的非错误结局
enum CycleOutcome {
    Passed {
        plan: Plan,
        result: ExecutionResult,
        critique: Critique,
    },
    Cancelled,
}

pub struct Engine {
    config: EngineConfig,
    stages: StageSet,
    memory: Arc<MemoryManager>,
    history: TaskHistoryStore,
    recovery: RecoveryEngine,
    context_items: usize,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        stages: StageSet,
        memory: Arc<MemoryManager>,
        history: TaskHistoryStore,
    ) -> Self {
        Self {
            config,
            stages,
            memory,
            history,
            recovery: RecoveryEngine::new(),
            context_items: 10,
        }
    }

    /// 任务历史与记忆共用同一持久化底座
    pub fn from_config(config: &AppConfig, stages: StageSet, memory: Arc<MemoryManager>) -> Self {
        let history = TaskHistoryStore::new(Arc::clone(memory.substrate()));
        Self::new(config.engine.clone(), stages, memory, history)
            .with_context_items(config.memory.context_items)
    }

    /// 每次规划时检索的记忆条数
    pub fn with_context_items(mut self, k: usize) -> Self {
        self.context_items = k;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn history(&self) -> &TaskHistoryStore {
        &self.history
    }

    pub async fn run(&self, task: Task) -> TerminalOutcome {
        self.run_with_progress(task, &CancellationToken::new(), None).await
    }

    /// 运行到终态；progress 在每次状态变化时收到最新 TaskView
    pub async fn run_with_progress(
        &self,
        task: Task,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<TaskView>>,
    ) -> TerminalOutcome {
        self.drive(TaskRecord::new(task), cancel, progress).await
    }

    /// 从持久化记录继续未完成的任务；已到终态的任务直接返回记录中的结局
    pub async fn resume(&self, id: TaskId, cancel: &CancellationToken) -> Result<TerminalOutcome, EngineError> {
        let mut record = self.history.load(id)?.ok_or(EngineError::TaskNotFound(id))?;
        if record.is_finished() {
            return TerminalOutcome::from_record(record)
                .ok_or_else(|| EngineError::Persistence(format!("record {} has no resolution", id)));
        }
        // 评审已通过、中断在 Learn 内：只补做 Learn
        if record.task.status == TaskStatus::Learning {
            if let Some((plan, result, critique)) = record.cycles.last().and_then(CycleRecord::passed) {
                tracing::info!(task_id = %id, "Resuming task into Learn");
                return Ok(self.learn_and_finish(record, plan, result, critique, None).await);
            }
        }
        record.cycles.retain(|c| c.finished_at.is_some());
        record.task.rewind_for_resume();
        tracing::info!(
            task_id = %id,
            retry_count = record.task.retry_count,
            cycles = record.cycles.len(),
            "Resuming task from history"
        );
        Ok(self.drive(record, cancel, None).await)
    }

    fn stage_timeout(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Plan => self.config.plan_timeout_secs,
            Stage::Execute => self.config.execute_timeout_secs,
            Stage::Critique => self.config.critique_timeout_secs,
            Stage::Learn => self.config.learn_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    async fn timed<T>(
        &self,
        stage: Stage,
        fut: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        let after = self.stage_timeout(stage);
        match tokio::time::timeout(after, fut).await {
            Ok(r) => r,
            Err(_) => {
                tracing::warn!(stage = %stage, ?after, "Stage timed out");
                Err(EngineError::StageTimeout { stage, after })
            }
        }
    }

    fn publish(record: &TaskRecord, progress: Option<&watch::Sender<TaskView>>) {
        if let Some(tx) = progress {
            tx.send_replace(TaskView::project(record));
        }
    }

    fn persist(&self, record: &mut TaskRecord, progress: Option<&watch::Sender<TaskView>>) {
        record.updated_at = Utc::now();
        if let Err(e) = self.history.save(record) {
            tracing::warn!(task_id = %record.task.id, error = %e, "Failed to persist task history");
        }
        Self::publish(record, progress);
    }

    fn enter(
        &self,
        record: &mut TaskRecord,
        next: TaskStatus,
        progress: Option<&watch::Sender<TaskView>>,
    ) -> Result<(), EngineError> {
        let from = record.task.status;
        record.task.advance(next)?;
        tracing::info!(task_id = %record.task.id, from = %from, to = %next, "Task status changed");
        Self::publish(record, progress);
        Ok(())
    }

    async fn drive(
        &self,
        mut record: TaskRecord,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<TaskView>>,
    ) -> TerminalOutcome {
        tracing::info!(
            task_id = %record.task.id,
            description = %record.task.description,
            max_retries = record.task.max_retries,
            "Task started"
        );
        self.persist(&mut record, progress);
        let mut memory_degraded: Option<String> = None;

        loop {
            let mut cycle = CycleRecord::start(record.task.retry_count);
            let outcome = self
                .run_cycle(&mut record, &mut cycle, memory_degraded.as_deref(), cancel, progress)
                .await;

            let err = match outcome {
                Ok(CycleOutcome::Passed { plan, result, critique }) => {
                    cycle.finish(None);
                    self.audit(&record, &cycle);
                    record.cycles.push(cycle);
                    return self.complete(record, plan, result, critique, progress).await;
                }
                Ok(CycleOutcome::Cancelled) => {
                    cycle.finish(Some(EngineError::Cancelled.to_string()));
                    self.audit(&record, &cycle);
                    record.cycles.push(cycle);
                    return self.fail(record, FailureReason::Cancelled, progress);
                }
                Err(err) => err,
            };

            // 低分评审的原因已在 critique 中
            let cycle_error = match &err {
                EngineError::CritiqueBelowThreshold { .. } => None,
                other => Some(other.to_string()),
            };
            cycle.finish(cycle_error);
            self.audit(&record, &cycle);
            record.cycles.push(cycle);

            if cancel.is_cancelled() {
                return self.fail(record, FailureReason::Cancelled, progress);
            }

            let feedback = match self.recovery.handle(&err) {
                RecoveryAction::RetryWithFeedback(feedback) => feedback,
                RecoveryAction::Degrade(reason) if memory_degraded.is_none() => {
                    tracing::warn!(
                        task_id = %record.task.id,
                        reason = %reason,
                        "Memory unavailable, rerunning cycle without memory context"
                    );
                    memory_degraded = Some(reason);
                    if let Err(e) = self.enter(&mut record, TaskStatus::Retrying, progress) {
                        return self.fail(record, FailureReason::Fatal(e.to_string()), progress);
                    }
                    self.persist(&mut record, progress);
                    continue;
                }
                RecoveryAction::Degrade(reason) => {
                    tracing::warn!(
                        task_id = %record.task.id,
                        reason = %reason,
                        "Memory still unavailable without context, retrying"
                    );
                    reason
                }
                RecoveryAction::Abort(_) if err == EngineError::Cancelled => {
                    return self.fail(record, FailureReason::Cancelled, progress);
                }
                RecoveryAction::Abort(reason) => {
                    return self.fail(record, FailureReason::Fatal(reason), progress);
                }
            };

            if !record.task.record_retry(&feedback) {
                self.record_failure_episode(&record);
                return self.fail(record, FailureReason::RetriesExhausted, progress);
            }
            if let Err(e) = self.enter(&mut record, TaskStatus::Retrying, progress) {
                return self.fail(record, FailureReason::Fatal(e.to_string()), progress);
            }
            self.persist(&mut record, progress);

            let delay = self.config.backoff(record.task.retry_count);
            tracing::info!(
                task_id = %record.task.id,
                retry = record.task.retry_count,
                max_retries = record.task.max_retries,
                ?delay,
                "Retrying task with feedback"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.fail(record, FailureReason::Cancelled, progress);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 一个 plan–execute–critique 周期；阶段错误与低分评审以 Err 返回
    async fn run_cycle(
        &self,
        record: &mut TaskRecord,
        cycle: &mut CycleRecord,
        memory_degraded: Option<&str>,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<TaskView>>,
    ) -> Result<CycleOutcome, EngineError> {
        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }
        self.enter(record, TaskStatus::Planning, progress)?;
        let context = match memory_degraded {
            Some(reason) => MemoryContext::degraded(reason),
            None => self
                .memory
                .context_for_task(&record.task.description, self.context_items),
        };
        let plan = self
            .timed(Stage::Plan, self.stages.planner.plan(&record.task, &context))
            .await?;
        cycle.plan = Some(plan.clone());

        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }
        self.enter(record, TaskStatus::Executing, progress)?;
        let result = self
            .timed(Stage::Execute, self.stages.executor.execute(&record.task, &plan))
            .await?;
        cycle.result = Some(result.clone());

        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }
        self.enter(record, TaskStatus::Critiquing, progress)?;
        let threshold = self.config.quality_threshold;
        let critique = self
            .timed(
                Stage::Critique,
                self.stages.critic.critique(&record.task, &plan, &result, threshold),
            )
            .await?;
        cycle.critique = Some(critique.clone());

        if !critique.passed {
            return Err(EngineError::CritiqueBelowThreshold {
                score: critique.score,
                threshold: critique.threshold,
                feedback: critique.retry_feedback(),
            });
        }
        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }
        Ok(CycleOutcome::Passed { plan, result, critique })
    }

    async fn complete(
        &self,
        mut record: TaskRecord,
        plan: Plan,
        result: ExecutionResult,
        critique: Critique,
        progress: Option<&watch::Sender<TaskView>>,
    ) -> TerminalOutcome {
        if let Err(e) = self.enter(&mut record, TaskStatus::Learning, progress) {
            return self.fail(record, FailureReason::Fatal(e.to_string()), progress);
        }
        self.persist(&mut record, progress);
        self.learn_and_finish(record, plan, result, critique, progress).await
    }

    /// Learn 失败只记录降级，任务仍以 Completed 结束
    async fn learn_and_finish(
        &self,
        mut record: TaskRecord,
        plan: Plan,
        result: ExecutionResult,
        critique: Critique,
        progress: Option<&watch::Sender<TaskView>>,
    ) -> TerminalOutcome {
        let earlier = record.cycles.len().saturating_sub(1);
        let input = LearnInput {
            task: &record.task,
            plan: &plan,
            result: &result,
            critique: &critique,
            history: &record.cycles[..earlier],
        };
        match self.timed(Stage::Learn, self.stages.learner.learn(input)).await {
            Ok(report) => tracing::debug!(
                task_id = %record.task.id,
                facts = report.facts.len(),
                degraded = report.degraded.len(),
                "Learn finished"
            ),
            Err(e) => tracing::warn!(task_id = %record.task.id, error = %e, "Learn degraded"),
        }

        if let Err(e) = self.enter(&mut record, TaskStatus::Completed, progress) {
            tracing::warn!(task_id = %record.task.id, error = %e, "Unexpected transition error");
        }
        tracing::info!(
            task_id = %record.task.id,
            score = critique.score,
            retry_count = record.task.retry_count,
            cycles = record.cycles.len(),
            "Task completed"
        );
        self.finish(record, Resolution::Completed { result, critique }, progress)
    }

    fn fail(
        &self,
        mut record: TaskRecord,
        reason: FailureReason,
        progress: Option<&watch::Sender<TaskView>>,
    ) -> TerminalOutcome {
        if let Err(e) = self.enter(&mut record, TaskStatus::Failed, progress) {
            tracing::warn!(task_id = %record.task.id, error = %e, "Unexpected transition error");
        }
        tracing::warn!(
            task_id = %record.task.id,
            reason = %reason,
            retry_count = record.task.retry_count,
            cycles = record.cycles.len(),
            "Task failed"
        );
        self.finish(record, Resolution::Failed { reason }, progress)
    }

    fn finish(
        &self,
        mut record: TaskRecord,
        resolution: Resolution,
        progress: Option<&watch::Sender<TaskView>>,
    ) -> TerminalOutcome {
        record.resolution = Some(resolution.clone());
        self.persist(&mut record, progress);
        TerminalOutcome {
            task: record.task,
            cycles: record.cycles,
            resolution,
        }
    }

    /// 重试耗尽：把每个周期的失败原因作为教训写入情景记忆
    fn record_failure_episode(&self, record: &TaskRecord) {
        if !self.config.record_failures {
            return;
        }
        let lessons: Vec<String> = record.cycles.iter().filter_map(CycleRecord::cause).collect();
        let cause = lessons
            .last()
            .cloned()
            .unwrap_or_else(|| FailureReason::RetriesExhausted.to_string());
        let entry = EpisodicEntry::new(record.task.snapshot(), EpisodeOutcome::Failed { cause }, lessons);
        if let Err(e) = self.memory.store(MemoryItem::Episodic(entry)) {
            tracing::warn!(task_id = %record.task.id, error = %e, "Failed to record failure episode");
        }
    }

    fn audit(&self, record: &TaskRecord, cycle: &CycleRecord) {
        let duration_ms = cycle
            .finished_at
            .map(|end| (end - cycle.started_at).num_milliseconds())
            .unwrap_or(0);
        let audit = serde_json::json!({
            "event": "cycle_audit",
            "task_id": record.task.id.to_string(),
            "attempt": cycle.attempt,
            "subtasks": cycle.plan.as_ref().map(Plan::len),
            "success": cycle.result.as_ref().map(|r| r.success),
            "cost": cycle.result.as_ref().map(|r| r.cost),
            "score": cycle.critique.as_ref().map(|c| c.score),
            "passed": cycle.critique.as_ref().map(|c| c.passed),
            "error": cycle.error,
            "duration_ms": duration_ms,
        });
        tracing::info!(audit = %audit, "cycle");
    }
}
