//! 任务调度：有界提交队列 + 固定数量的工作协程
//!
//! 队列满时 submit 立即返回 QueueFull（背压，不缓冲）；每个工作协程从共享接收端取任务，
//! 在 Engine 控制循环中运行到终态。调用方通过 TaskHandle 或 status(id) 查询进度，通过 cancel 取消。
//! 任务结束后从活动表移出，只保留最近 retain_finished 条终态 TaskView。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::core::engine::Engine;
use crate::core::history::{TaskRecord, TerminalOutcome};
use crate::core::{EngineError, Task, TaskId, TaskView};

struct Job {
    task: Task,
    cancel: CancellationToken,
    progress: watch::Sender<TaskView>,
    done: oneshot::Sender<TerminalOutcome>,
}

struct Entry {
    view: watch::Receiver<TaskView>,
    cancel: CancellationToken,
}

/// 活动任务 + 有界的终态视图
struct TaskTable {
    live: HashMap<TaskId, Entry>,
    finished: HashMap<TaskId, TaskView>,
    order: VecDeque<TaskId>,
    retain: usize,
}

impl TaskTable {
    fn new(retain: usize) -> Self {
        Self {
            live: HashMap::new(),
            finished: HashMap::new(),
            order: VecDeque::new(),
            retain,
        }
    }

    fn finish(&mut self, id: TaskId, view: TaskView) {
        self.live.remove(&id);
        if self.retain == 0 {
            return;
        }
        self.finished.insert(id, view);
        self.order.push_back(id);
        while self.order.len() > self.retain {
            if let Some(oldest) = self.order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }
}

type SharedTable = Arc<RwLock<TaskTable>>;

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

/// 调度器整体状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub capacity: usize,
    pub workers: usize,
}

/// 已提交任务的句柄
pub struct TaskHandle {
    id: TaskId,
    cancel: CancellationToken,
    view: watch::Receiver<TaskView>,
    done: oneshot::Receiver<TerminalOutcome>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// 请求取消；在下一个阶段边界生效
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> TaskView {
        self.view.borrow().clone()
    }

    /// 订阅进度变化
    pub fn watch(&self) -> watch::Receiver<TaskView> {
        self.view.clone()
    }

    /// 等待终态
    pub async fn outcome(self) -> Result<TerminalOutcome, EngineError> {
        self.done.await.map_err(|_| EngineError::SchedulerClosed)
    }
}

pub struct TaskScheduler {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    tasks: SharedTable,
    counters: Arc<Counters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
    worker_count: usize,
}

impl TaskScheduler {
    /// 启动工作协程；必须在 tokio 运行时内调用
    pub fn start(engine: Arc<Engine>, config: &SchedulerConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let worker_count = config.workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());
        let tasks: SharedTable = Arc::new(RwLock::new(TaskTable::new(config.retain_finished)));

        let workers = (0..worker_count)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&engine),
                    Arc::clone(&rx),
                    Arc::clone(&counters),
                    Arc::clone(&tasks),
                ))
            })
            .collect();
        tracing::info!(workers = worker_count, capacity, "Task scheduler started");

        Self {
            sender: Mutex::new(Some(tx)),
            tasks,
            counters,
            workers: Mutex::new(workers),
            capacity,
            worker_count,
        }
    }

    /// 提交任务；队列满时立即返回 QueueFull
    pub fn submit(&self, task: Task) -> Result<TaskHandle, EngineError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(EngineError::SchedulerClosed)?;

        let id = task.id;
        let (progress, view) = watch::channel(TaskView::project(&TaskRecord::new(task.clone())));
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let job = Job {
            task,
            cancel: cancel.clone(),
            progress,
            done: done_tx,
        };

        // 先登记再入队，工作协程结束任务时表项必然已存在
        self.tasks.write().unwrap_or_else(PoisonError::into_inner).live.insert(
            id,
            Entry {
                view: view.clone(),
                cancel: cancel.clone(),
            },
        );
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = sender.try_send(job) {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            self.tasks.write().unwrap_or_else(PoisonError::into_inner).live.remove(&id);
            return Err(match e {
                TrySendError::Full(_) => {
                    tracing::warn!(task_id = %id, capacity = self.capacity, "Submission rejected, queue full");
                    EngineError::QueueFull {
                        capacity: self.capacity,
                    }
                }
                TrySendError::Closed(_) => EngineError::SchedulerClosed,
            });
        }

        tracing::debug!(task_id = %id, "Task queued");
        Ok(TaskHandle {
            id,
            cancel,
            view,
            done: done_rx,
        })
    }

    /// 活动任务的最新进度，或仍在保留范围内的终态视图
    pub fn status(&self, id: TaskId) -> Option<TaskView> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        match tasks.live.get(&id) {
            Some(entry) => Some(entry.view.borrow().clone()),
            None => tasks.finished.get(&id).cloned(),
        }
    }

    /// 已结束的任务取消为空操作
    pub fn cancel(&self, id: TaskId) -> Result<(), EngineError> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = tasks.live.get(&id) {
            entry.cancel.cancel();
            tracing::info!(task_id = %id, "Cancellation requested");
            return Ok(());
        }
        if tasks.finished.contains_key(&id) {
            return Ok(());
        }
        Err(EngineError::TaskNotFound(id))
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.counters.queued.load(Ordering::SeqCst),
            running: self.counters.running.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            capacity: self.capacity,
            workers: self.worker_count,
        }
    }

    /// 停止接收新任务并等待工作协程退出；cancel_running 为 true 时取消所有未结束的任务
    pub async fn shutdown(&self, cancel_running: bool) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if cancel_running {
            for entry in self.tasks.read().unwrap_or_else(PoisonError::into_inner).live.values() {
                entry.cancel.cancel();
            }
        }
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!(stats = ?self.stats(), "Task scheduler stopped");
    }
}

async fn worker_loop(
    worker: usize,
    engine: Arc<Engine>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    counters: Arc<Counters>,
    tasks: SharedTable,
) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        counters.queued.fetch_sub(1, Ordering::SeqCst);
        counters.running.fetch_add(1, Ordering::SeqCst);

        let id = job.task.id;
        tracing::debug!(worker, task_id = %id, "Worker picked up task");
        let outcome = engine
            .run_with_progress(job.task, &job.cancel, Some(&job.progress))
            .await;

        counters.running.fetch_sub(1, Ordering::SeqCst);
        if outcome.is_completed() {
            counters.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            counters.failed.fetch_add(1, Ordering::SeqCst);
        }
        let view = job.progress.borrow().clone();
        tasks.write().unwrap_or_else(PoisonError::into_inner).finish(id, view);
        if job.done.send(outcome).is_err() {
            tracing::debug!(task_id = %id, "Task handle dropped before completion");
        }
    }
    tracing::debug!(worker, "Worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Task, TaskStatus};

    fn view(task: &Task, status: TaskStatus) -> TaskView {
        let mut view = TaskView::project(&TaskRecord::new(task.clone()));
        view.status = status;
        view
    }

    #[test]
    fn test_finished_views_are_bounded() {
        let mut table = TaskTable::new(2);
        let tasks: Vec<Task> = (0..3).map(|i| Task::new(format!("t{i}"))).collect();
        for task in &tasks {
            let (_tx, rx) = watch::channel(view(task, TaskStatus::Pending));
            table.live.insert(
                task.id,
                Entry {
                    view: rx,
                    cancel: CancellationToken::new(),
                },
            );
        }
        for task in &tasks {
            table.finish(task.id, view(task, TaskStatus::Completed));
        }
        assert!(table.live.is_empty());
        assert_eq!(table.finished.len(), 2);
        assert!(!table.finished.contains_key(&tasks[0].id));
        assert_eq!(table.finished[&tasks[2].id].status, TaskStatus::Completed);
    }

    #[test]
    fn test_zero_retention_keeps_nothing() {
        let mut table = TaskTable::new(0);
        let task = Task::new("t");
        table.finish(task.id, view(&task, TaskStatus::Failed));
        assert!(table.finished.is_empty());
        assert!(table.order.is_empty());
    }
}
