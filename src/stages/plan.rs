//! 计划：带依赖与估算的子任务集合
//!
//! 依赖关系必须无环；execution_order 用 Kahn 算法（入度表）给出确定的执行顺序，
//! 入度同时为 0 的子任务按在计划中出现的先后排列。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::EngineError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Plan has no subtasks")]
    Empty,

    #[error("Duplicate subtask id: {0}")]
    DuplicateId(String),

    #[error("Subtask {subtask} depends on unknown subtask {dependency}")]
    UnknownDependency { subtask: String, dependency: String },

    #[error("Dependency cycle among subtasks: {0:?}")]
    Cycle(Vec<String>),

    #[error("Invalid estimate for subtask {subtask}: {reason}")]
    InvalidEstimate { subtask: String, reason: String },
}

impl From<PlanError> for EngineError {
    fn from(e: PlanError) -> Self {
        EngineError::Planning(e.to_string())
    }
}

fn default_required() -> bool {
    true
}

/// 子任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Subtask {
    /// 计划内唯一 ID，如 "step-1"
    pub id: String,
    pub description: String,
    /// 要调用的工具名；为空表示无需工具，直接以描述作为产出
    #[serde(default)]
    pub tool: Option<String>,
    /// 工具参数（JSON 对象）
    #[serde(default)]
    pub args: serde_json::Value,
    /// 依赖的子任务 ID
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default)]
    pub estimated_time_secs: f64,
    /// 0-1
    #[serde(default)]
    pub estimated_risk: f32,
    /// 为 false 时失败不影响整体成功判定
    #[serde(default = "default_required")]
    pub required: bool,
}

impl Subtask {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool: None,
            args: serde_json::Value::Null,
            depends_on: Vec::new(),
            estimated_cost: 0.0,
            estimated_time_secs: 0.0,
            estimated_risk: 0.0,
            required: true,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>, args: serde_json::Value) -> Self {
        self.tool = Some(tool.into());
        self.args = args;
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// 计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    pub subtasks: Vec<Subtask>,
    /// 规划思路（可选）
    #[serde(default)]
    pub rationale: Option<String>,
}

impl Plan {
    pub fn new(subtasks: Vec<Subtask>) -> Self {
        Self {
            subtasks,
            rationale: None,
        }
    }

    /// 单步计划：无法解析规划输出时的兜底
    pub fn single_step(description: &str, tool: Option<(&str, serde_json::Value)>) -> Self {
        let mut step = Subtask::new("step-1", description);
        if let Some((name, args)) = tool {
            step = step.with_tool(name, args);
        }
        Self {
            subtasks: vec![step],
            rationale: Some("fallback single-step plan".to_string()),
        }
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub fn total_estimated_cost(&self) -> f64 {
        self.subtasks.iter().map(|s| s.estimated_cost).sum()
    }

    pub fn total_estimated_time_secs(&self) -> f64 {
        self.subtasks.iter().map(|s| s.estimated_time_secs).sum()
    }

    /// 最高单步风险
    pub fn max_risk(&self) -> f32 {
        self.subtasks
            .iter()
            .map(|s| s.estimated_risk)
            .fold(0.0, f32::max)
    }

    /// 结构校验：非空、ID 唯一、依赖存在、估算合法、无环
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.subtasks.is_empty() {
            return Err(PlanError::Empty);
        }
        let mut seen = HashSet::new();
        for s in &self.subtasks {
            if !seen.insert(s.id.as_str()) {
                return Err(PlanError::DuplicateId(s.id.clone()));
            }
        }
        for s in &self.subtasks {
            for dep in &s.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        subtask: s.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            let invalid = |reason: &str| PlanError::InvalidEstimate {
                subtask: s.id.clone(),
                reason: reason.to_string(),
            };
            let negative = |v: f64| v.is_nan() || v < 0.0;
            if negative(s.estimated_cost) || negative(s.estimated_time_secs) {
                return Err(invalid("cost and time must be non-negative"));
            }
            if !(0.0..=1.0).contains(&s.estimated_risk) {
                return Err(invalid("risk must be within [0, 1]"));
            }
        }
        self.execution_order().map(|_| ())
    }

    /// 拓扑序（子任务下标）；存在环时返回 Cycle，列出无法排序的子任务
    pub fn execution_order(&self) -> Result<Vec<usize>, PlanError> {
        let index: HashMap<&str, usize> = self
            .subtasks
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.subtasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.subtasks.len()];
        for (i, s) in self.subtasks.iter().enumerate() {
            let deps: HashSet<&str> = s.depends_on.iter().map(String::as_str).collect();
            for dep in deps {
                let Some(&d) = index.get(dep) else {
                    return Err(PlanError::UnknownDependency {
                        subtask: s.id.clone(),
                        dependency: dep.to_string(),
                    });
                };
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(self.subtasks.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push(Reverse(j));
                }
            }
        }

        if order.len() != self.subtasks.len() {
            let stuck = in_degree
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > 0)
                .map(|(i, _)| self.subtasks[i].id.clone())
                .collect();
            return Err(PlanError::Cycle(stuck));
        }
        Ok(order)
    }
}
