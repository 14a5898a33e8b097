//! 阶段层：Plan / Execute / Critique / Learn 四个可插拔阶段
//!
//! 每个阶段是一个固定方法集的 trait；具体实现由 StageSet::from_config 按配置中的名称选择。

pub mod critic;
pub mod executor;
pub mod learner;
pub mod plan;
pub mod planner;
pub mod schema;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::{CycleRecord, EngineError, Task};
use crate::llm::ReasoningBackend;
use crate::memory::{MemoryContext, MemoryManager, WriteOutcome};
use crate::tools::ToolInvoker;

pub use critic::{parse_critique, LlmCritic, OutcomeCritic, ParsedCritique};
pub use executor::ToolExecutorStage;
pub use learner::MemoryLearner;
pub use plan::{Plan, PlanError, Subtask};
pub use planner::{extract_json, DirectPlanner, LlmPlanner};
pub use schema::plan_schema_json;
pub use types::{Critique, ExecutionResult, SubtaskReport, SubtaskStatus};

#[async_trait]
pub trait PlanStage: Send + Sync {
    fn name(&self) -> &str;

    /// 由任务描述（含上一轮注入的反馈）与记忆上下文生成无环计划
    async fn plan(&self, task: &Task, memory: &MemoryContext) -> Result<Plan, EngineError>;
}

#[async_trait]
pub trait ExecuteStage: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, task: &Task, plan: &Plan) -> Result<ExecutionResult, EngineError>;
}

#[async_trait]
pub trait CritiqueStage: Send + Sync {
    fn name(&self) -> &str;

    async fn critique(
        &self,
        task: &Task,
        plan: &Plan,
        result: &ExecutionResult,
        threshold: f32,
    ) -> Result<Critique, EngineError>;
}

/// Learn 阶段的输入：通过评审的最后一个周期与此前全部周期
pub struct LearnInput<'a> {
    pub task: &'a Task,
    pub plan: &'a Plan,
    pub result: &'a ExecutionResult,
    pub critique: &'a Critique,
    pub history: &'a [CycleRecord],
}

/// Learn 阶段实际写入的内容
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearnReport {
    pub episode: Option<Uuid>,
    pub long_term: Option<WriteOutcome>,
    /// 写入或合并的语义事实键
    pub facts: Vec<String>,
    pub short_term_key: Option<String>,
    /// 部分写入失败的说明
    pub degraded: Vec<String>,
}

#[async_trait]
pub trait LearnStage: Send + Sync {
    fn name(&self) -> &str;

    async fn learn(&self, input: LearnInput<'_>) -> Result<LearnReport, EngineError>;
}

/// 一组阶段实现
#[derive(Clone)]
pub struct StageSet {
    pub planner: Arc<dyn PlanStage>,
    pub executor: Arc<dyn ExecuteStage>,
    pub critic: Arc<dyn CritiqueStage>,
    pub learner: Arc<dyn LearnStage>,
}

impl StageSet {
    pub fn new(
        planner: Arc<dyn PlanStage>,
        executor: Arc<dyn ExecuteStage>,
        critic: Arc<dyn CritiqueStage>,
        learner: Arc<dyn LearnStage>,
    ) -> Self {
        Self {
            planner,
            executor,
            critic,
            learner,
        }
    }

    /// 按 [stages] 段的名称选择实现；未知名称返回 Config 错误
    pub fn from_config(
        config: &AppConfig,
        backend: Arc<dyn ReasoningBackend>,
        tools: Arc<dyn ToolInvoker>,
        memory: Arc<MemoryManager>,
    ) -> Result<Self, EngineError> {
        let unknown = |stage: &str, name: &str| {
            EngineError::Config(format!("unknown {} implementation: {:?}", stage, name))
        };

        let planner: Arc<dyn PlanStage> = match config.stages.planner.as_str() {
            "llm" => Arc::new(LlmPlanner::new(Arc::clone(&backend), tools.tool_descriptions())),
            "direct" => Arc::new(DirectPlanner::default()),
            other => return Err(unknown("planner", other)),
        };
        let executor: Arc<dyn ExecuteStage> = match config.stages.executor.as_str() {
            "tools" => Arc::new(
                ToolExecutorStage::new(Arc::clone(&tools), config.tools.granted())
                    .with_max_attempts(config.tools.max_attempts),
            ),
            other => return Err(unknown("executor", other)),
        };
        let critic: Arc<dyn CritiqueStage> = match config.stages.critic.as_str() {
            "llm" => Arc::new(LlmCritic::new(Arc::clone(&backend))),
            "outcome" => Arc::new(OutcomeCritic),
            other => return Err(unknown("critic", other)),
        };
        let learner: Arc<dyn LearnStage> = match config.stages.learner.as_str() {
            "memory" => Arc::new(MemoryLearner::new(memory)),
            other => return Err(unknown("learner", other)),
        };

        tracing::info!(
            planner = planner.name(),
            executor = executor.name(),
            critic = critic.name(),
            learner = learner.name(),
            "Stages configured"
        );
        Ok(Self::new(planner, executor, critic, learner))
    }
}
