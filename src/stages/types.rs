//! 执行结果与评审结果

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Succeeded,
    Failed,
    /// 依赖失败，未执行
    Skipped,
}

/// 单个子任务的执行报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskReport {
    pub id: String,
    pub status: SubtaskStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
    pub cost: f64,
}

/// Execute 阶段的汇总结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: String,
    pub artifacts: Vec<String>,
    pub cost: f64,
    pub duration: Duration,
    /// 所有必需子任务是否成功
    pub success: bool,
    #[serde(default)]
    pub subtasks: Vec<SubtaskReport>,
}

impl ExecutionResult {
    pub fn failed_subtasks(&self) -> impl Iterator<Item = &SubtaskReport> {
        self.subtasks
            .iter()
            .filter(|r| r.status != SubtaskStatus::Succeeded)
    }
}

/// 评审结果；score 始终在 [0, 10]，passed 当且仅当 score ≥ threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub score: f32,
    pub feedback: String,
    pub improvements: Vec<String>,
    pub threshold: f32,
    pub passed: bool,
}

impl Critique {
    pub fn new(score: f32, feedback: impl Into<String>, improvements: Vec<String>, threshold: f32) -> Self {
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 10.0) };
        Self {
            score,
            feedback: feedback.into(),
            improvements,
            threshold,
            passed: score >= threshold,
        }
    }

    /// 可直接注入下一轮规划的反馈文本
    pub fn retry_feedback(&self) -> String {
        let mut s = self.feedback.trim().to_string();
        if !self.improvements.is_empty() {
            if !s.is_empty() {
                s.push('\n');
            }
            s.push_str("Areas for improvement:");
            for item in &self.improvements {
                s.push_str(&format!("\n- {}", item));
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_clamped_and_gated() {
        assert_eq!(Critique::new(14.0, "", vec![], 7.0).score, 10.0);
        assert_eq!(Critique::new(-3.0, "", vec![], 7.0).score, 0.0);
        assert_eq!(Critique::new(f32::NAN, "", vec![], 7.0).score, 0.0);
        assert!(Critique::new(7.0, "", vec![], 7.0).passed);
        assert!(!Critique::new(6.99, "", vec![], 7.0).passed);
    }

    #[test]
    fn test_retry_feedback_lists_improvements() {
        let c = Critique::new(4.0, "Too vague.", vec!["cite sources".into()], 7.0);
        assert_eq!(c.retry_feedback(), "Too vague.\nAreas for improvement:\n- cite sources");
    }
}
