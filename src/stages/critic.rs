//! Critique 阶段实现
//!
//! LlmCritic 要求模型按固定格式回复（Score / Feedback / Areas for Improvement），
//! 用正则解析；解析不到分数时按 5.0 计。是否通过只由分数与阈值比较决定，不采信模型的自我判断。
//! OutcomeCritic 不调用模型，按必需子任务的成功比例打分。

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::core::{EngineError, Task};
use crate::llm::{ReasoningBackend, CRITIQUE_PROMPT_HEADER};
use crate::stages::{Critique, CritiqueStage, ExecutionResult, Plan, SubtaskStatus};

const DEFAULT_SCORE: f32 = 5.0;
const OUTPUT_PREVIEW_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCritique {
    pub score: Option<f32>,
    pub feedback: String,
    pub improvements: Vec<String>,
}

/// 解析评审回复
pub fn parse_critique(text: &str) -> ParsedCritique {
    let score_re = Regex::new(r"(?i)score\s*[:=]\s*(-?\d+(?:\.\d+)?)\s*(?:/\s*10)?").ok();
    let score = score_re
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f32>().ok());

    let mut feedback = Vec::new();
    let mut improvements = Vec::new();
    let mut section = "";
    for line in text.lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_lowercase();
        if lower.starts_with("score") {
            section = "";
            continue;
        }
        if let Some(rest) = strip_label(trimmed, "feedback:") {
            section = "feedback";
            if !rest.is_empty() {
                feedback.push(rest.to_string());
            }
            continue;
        }
        if lower.starts_with("areas for improvement") || lower.starts_with("improvements:") {
            section = "improvements";
            continue;
        }
        match section {
            "feedback" if !trimmed.is_empty() => feedback.push(trimmed.to_string()),
            "improvements" => {
                if let Some(item) = bullet(trimmed) {
                    improvements.push(item.to_string());
                }
            }
            _ => {}
        }
    }

    ParsedCritique {
        score,
        feedback: feedback.join("\n"),
        improvements,
    }
}

fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let head = line.get(..label.len())?;
    head.eq_ignore_ascii_case(label)
        .then(|| line[label.len()..].trim())
}

fn bullet(line: &str) -> Option<&str> {
    let item = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("• "))
        .or_else(|| {
            let digits = line.find(|c: char| !c.is_ascii_digit())?;
            (digits > 0).then(|| line[digits..].strip_prefix(". "))?
        })?
        .trim();
    (!item.is_empty()).then_some(item)
}

fn preview(s: &str) -> String {
    if s.chars().count() > OUTPUT_PREVIEW_CHARS {
        format!("{}...", s.chars().take(OUTPUT_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

pub struct LlmCritic {
    backend: Arc<dyn ReasoningBackend>,
}

impl LlmCritic {
    pub fn new(backend: Arc<dyn ReasoningBackend>) -> Self {
        Self { backend }
    }

    fn build_prompt(task: &Task, plan: &Plan, result: &ExecutionResult, threshold: f32) -> String {
        let mut s = format!(
            "{}\nTask: {}\nPass threshold: {:.1}/10\n\n## Plan\n",
            CRITIQUE_PROMPT_HEADER, task.description, threshold
        );
        for subtask in &plan.subtasks {
            s.push_str(&format!("- [{}] {}\n", subtask.id, subtask.description));
        }
        s.push_str(&format!(
            "\n## Execution\nAll required subtasks succeeded: {}\n",
            result.success
        ));
        for report in result.failed_subtasks() {
            let status = match report.status {
                SubtaskStatus::Skipped => "skipped",
                _ => "failed",
            };
            s.push_str(&format!(
                "- {} {}: {}\n",
                report.id,
                status,
                report.error.as_deref().unwrap_or("")
            ));
        }
        s.push_str("\n## Output\n");
        s.push_str(&preview(&result.output));
        s.push_str(
            "\n\nReply exactly in this format:\nScore: <0-10>/10\nFeedback: <one paragraph>\nAreas for Improvement:\n- <item>\n",
        );
        s
    }
}

#[async_trait]
impl CritiqueStage for LlmCritic {
    fn name(&self) -> &str {
        "llm"
    }

    async fn critique(
        &self,
        task: &Task,
        plan: &Plan,
        result: &ExecutionResult,
        threshold: f32,
    ) -> Result<Critique, EngineError> {
        let prompt = Self::build_prompt(task, plan, result, threshold);
        let generation = self
            .backend
            .generate(&prompt, "")
            .await
            .map_err(|e| EngineError::CritiqueFailed(e.to_string()))?;

        let parsed = parse_critique(&generation.text);
        let score = parsed.score.unwrap_or_else(|| {
            tracing::warn!(task_id = %task.id, "Critique reply had no score, using default");
            DEFAULT_SCORE
        });
        let feedback = if parsed.feedback.is_empty() {
            generation.text.trim().to_string()
        } else {
            parsed.feedback
        };
        Ok(Critique::new(score, feedback, parsed.improvements, threshold))
    }
}

/// 按必需子任务成功比例打分（0-10）
#[derive(Debug, Default)]
pub struct OutcomeCritic;

#[async_trait]
impl CritiqueStage for OutcomeCritic {
    fn name(&self) -> &str {
        "outcome"
    }

    async fn critique(
        &self,
        _task: &Task,
        plan: &Plan,
        result: &ExecutionResult,
        threshold: f32,
    ) -> Result<Critique, EngineError> {
        let required: Vec<_> = plan.subtasks.iter().filter(|s| s.required).collect();
        let succeeded = required
            .iter()
            .filter(|s| {
                result
                    .subtasks
                    .iter()
                    .any(|r| r.id == s.id && r.status == SubtaskStatus::Succeeded)
            })
            .count();
        let score = if required.is_empty() {
            10.0
        } else {
            10.0 * succeeded as f32 / required.len() as f32
        };
        let improvements: Vec<String> = result
            .failed_subtasks()
            .map(|r| format!("{}: {}", r.id, r.error.as_deref().unwrap_or("did not succeed")))
            .collect();
        let feedback = format!("{}/{} required subtasks succeeded", succeeded, required.len());
        Ok(Critique::new(score, feedback, improvements, threshold))
    }
}
