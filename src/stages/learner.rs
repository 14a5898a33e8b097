//! Learn 阶段：把通过评审的周期写入记忆
//!
//! 写入内容：
//! - 情景：任务快照、结果、教训（评审改进项 + 此前失败周期的原因）
//! - 长期：任务与结果摘要，重要度 = score / 10，执行未完全成功时减半（低于准入阈值时被拒绝，不算错误）
//! - 语义：每条教训作为事实，置信度达到下限才写入，教训之间互相关联
//! - 短期：本次结果，供紧随其后的任务参考
//!
//! 情景写入失败视为 Learn 失败；其余写入失败记入 LearnReport::degraded。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::EngineError;
use crate::memory::{EpisodeOutcome, EpisodicEntry, LongTermEntry, MemoryItem, MemoryManager, StoreOutcome};
use crate::stages::{LearnInput, LearnReport, LearnStage};

const RESULT_PREVIEW_CHARS: usize = 500;

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

pub struct MemoryLearner {
    memory: Arc<MemoryManager>,
}

impl MemoryLearner {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }

    fn lessons(input: &LearnInput<'_>) -> Vec<String> {
        let mut lessons: Vec<String> = Vec::new();
        let candidates = input
            .history
            .iter()
            .filter_map(|c| c.cause())
            .chain(input.critique.improvements.iter().cloned());
        for lesson in candidates {
            let lesson = lesson.trim().to_string();
            if !lesson.is_empty() && !lessons.contains(&lesson) {
                lessons.push(lesson);
            }
        }
        lessons
    }
}

#[async_trait]
impl LearnStage for MemoryLearner {
    fn name(&self) -> &str {
        "memory"
    }

    async fn learn(&self, input: LearnInput<'_>) -> Result<LearnReport, EngineError> {
        let mut report = LearnReport::default();
        let lessons = Self::lessons(&input);
        let score = input.critique.score;

        let episode = EpisodicEntry::new(
            input.task.snapshot(),
            EpisodeOutcome::Succeeded { score },
            lessons.clone(),
        );
        match self.memory.store(MemoryItem::Episodic(episode))? {
            StoreOutcome::Episodic { id } => report.episode = Some(id),
            other => tracing::debug!(?other, "Unexpected store outcome for episode"),
        }

        let mut importance = score / 10.0;
        if !input.result.success {
            importance *= 0.5;
        }
        let content = format!(
            "Task: {}\nResult: {}",
            input.task.description,
            truncate(&input.result.output, RESULT_PREVIEW_CHARS)
        );
        match self.memory.store(MemoryItem::LongTerm(LongTermEntry::new(content, importance))) {
            Ok(StoreOutcome::LongTerm(outcome)) => report.long_term = Some(outcome),
            Ok(other) => tracing::debug!(?other, "Unexpected store outcome for long-term entry"),
            Err(e) => report.degraded.push(format!("long_term: {}", e)),
        }

        let confidence = (score / 10.0).clamp(0.0, 1.0);
        if confidence >= self.memory.semantic_min_confidence() {
            for (i, lesson) in lessons.iter().enumerate() {
                let related = lessons
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, l)| l.as_str());
                match self.memory.semantic().upsert(lesson, confidence, related) {
                    Ok(entry) => report.facts.push(entry.key),
                    Err(e) => report.degraded.push(format!("semantic: {}", e)),
                }
            }
        }

        let key = format!("task:{}:result", input.task.id);
        self.memory
            .short_term()
            .put(key.clone(), truncate(&input.result.output, RESULT_PREVIEW_CHARS));
        report.short_term_key = Some(key);

        if !report.degraded.is_empty() {
            tracing::warn!(task_id = %input.task.id, degraded = ?report.degraded, "Learn partially degraded");
        }
        tracing::debug!(
            task_id = %input.task.id,
            lessons = lessons.len(),
            facts = report.facts.len(),
            "Learned from task"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::MemoryConfig;
    use crate::core::{CycleRecord, Task};
    use crate::stages::{Critique, ExecutionResult, Plan};

    fn memory() -> Arc<MemoryManager> {
        Arc::new(MemoryManager::in_memory(&MemoryConfig::default()).unwrap())
    }

    fn result(success: bool) -> ExecutionResult {
        ExecutionResult {
            output: "summary of quarterly sales".into(),
            artifacts: vec![],
            cost: 0.1,
            duration: Duration::from_millis(10),
            success,
            subtasks: vec![],
        }
    }

    #[tokio::test]
    async fn test_learn_writes_all_stores() {
        let memory = memory();
        let learner = MemoryLearner::new(Arc::clone(&memory));
        let task = Task::new("summarize quarterly sales");
        let plan = Plan::single_step("summarize", None);
        let critique = Critique::new(8.0, "good", vec!["include regional breakdown".into()], 7.0);
        let mut failed = CycleRecord::start(0);
        failed.finish(Some("Execution failed: source unreachable".into()));
        let history = vec![failed];

        let report = learner
            .learn(LearnInput {
                task: &task,
                plan: &plan,
                result: &result(true),
                critique: &critique,
                history: &history,
            })
            .await
            .unwrap();

        assert!(report.episode.is_some());
        assert!(report.long_term.as_ref().unwrap().is_stored());
        assert_eq!(report.facts.len(), 2);
        assert!(report.degraded.is_empty());

        let stats = memory.stats();
        assert_eq!(stats.episodic, 1);
        assert_eq!(stats.long_term, 1);
        assert_eq!(stats.semantic, 2);
        assert_eq!(stats.short_term, 1);

        let episode = memory.episodic().get(&report.episode.unwrap()).unwrap();
        assert_eq!(
            episode.lessons,
            vec![
                "Execution failed: source unreachable".to_string(),
                "include regional breakdown".to_string()
            ]
        );
        let fact = memory.semantic().get("include regional breakdown").unwrap();
        assert_eq!(fact.related.len(), 1);
    }

    #[tokio::test]
    async fn test_low_importance_declined_without_error() {
        let memory = memory();
        let learner = MemoryLearner::new(Arc::clone(&memory));
        let task = Task::new("t");
        let plan = Plan::single_step("t", None);
        // 5.0 / 10 * 0.5 = 0.25 < 0.3
        let critique = Critique::new(5.0, "meh", vec![], 5.0);
        let report = learner
            .learn(LearnInput {
                task: &task,
                plan: &plan,
                result: &result(false),
                critique: &critique,
                history: &[],
            })
            .await
            .unwrap();
        assert!(!report.long_term.unwrap().is_stored());
        assert_eq!(memory.stats().long_term, 0);
        assert_eq!(memory.stats().episodic, 1);
    }
}
