//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ENGINE__MAX_RETRIES=5`）。
//! 加载结果是一个普通值，由调用方按引用传给 Engine / MemoryManager / TaskScheduler。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::memory::long_term::MIN_IMPORTANCE;
use crate::memory::ConfidenceBlend;
use crate::tools::{Permission, Permissions};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub memory: MemoryConfig,
    pub tools: ToolsConfig,
    pub stages: StagesConfig,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [engine] 段：重试预算、质量门槛、退避与各阶段超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_retries: u32,
    /// 评审通过线（0-10）
    pub quality_threshold: f32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub plan_timeout_secs: u64,
    pub execute_timeout_secs: u64,
    pub critique_timeout_secs: u64,
    pub learn_timeout_secs: u64,
    /// 重试耗尽时是否写入失败经验
    pub record_failures: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            quality_threshold: 7.0,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            plan_timeout_secs: 120,
            execute_timeout_secs: 600,
            critique_timeout_secs: 120,
            learn_timeout_secs: 60,
            record_failures: true,
        }
    }
}

impl EngineConfig {
    /// 第 retry 次重试前的等待：base * 2^(retry-1)，不超过 backoff_max_ms
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let ms = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.backoff_max_ms))
    }
}

/// [scheduler] 段：工作协程数与提交队列容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: usize,
    /// 队列满时新提交立即被拒绝
    pub queue_capacity: usize,
    /// 全局同时进行的工具调用数
    pub max_concurrent_tools: usize,
    /// 终态任务保留的 TaskView 条数，超出后最早结束的被移除
    pub retain_finished: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            max_concurrent_tools: 3,
            retain_finished: 256,
        }
    }
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// 持久化目录；未设置时只在内存中保存
    pub persist_dir: Option<PathBuf>,
    pub embedding_dim: usize,
    pub short_term_capacity: usize,
    pub short_term_ttl_secs: u64,
    pub long_term_min_importance: f32,
    /// 语义事实的准入置信度，同时是 sweep 时的清理线
    pub semantic_min_confidence: f32,
    /// 每次规划注入的记忆条数
    pub context_items: usize,
    pub rank: RankConfig,
    pub semantic: SemanticConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            persist_dir: None,
            embedding_dim: 256,
            short_term_capacity: 100,
            short_term_ttl_secs: 3600,
            long_term_min_importance: 0.3,
            semantic_min_confidence: 0.3,
            context_items: 10,
            rank: RankConfig::default(),
            semantic: SemanticConfig::default(),
        }
    }
}

/// [memory.rank] 段：score = similarity^a × importance^b × 0.5^(age / half_life)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RankConfig {
    pub similarity_exponent: f32,
    pub importance_exponent: f32,
    pub recency_half_life_secs: u64,
    /// 短期记忆的最低相似度（短期记忆按时间而非内容召回）
    pub similarity_floor: f32,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            similarity_exponent: 1.0,
            importance_exponent: 1.0,
            recency_half_life_secs: 86_400,
            similarity_floor: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendKind {
    RecencyWeighted,
    Max,
    Mean,
}

/// [memory.semantic] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    pub blend: BlendKind,
    pub recency_weight: f32,
    pub fuzzy_threshold: f32,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            blend: BlendKind::RecencyWeighted,
            recency_weight: 0.6,
            fuzzy_threshold: 0.5,
        }
    }
}

impl SemanticConfig {
    pub fn blend_policy(&self) -> ConfidenceBlend {
        match self.blend {
            BlendKind::RecencyWeighted => ConfidenceBlend::RecencyWeighted {
                weight: self.recency_weight,
            },
            BlendKind::Max => ConfidenceBlend::Max,
            BlendKind::Mean => ConfidenceBlend::Mean,
        }
    }
}

/// [tools] 段：单次调用超时、子任务重试次数、授予的权限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub tool_timeout_secs: u64,
    /// 单个子任务的最多尝试次数（仅瞬时失败会重试）
    pub max_attempts: u32,
    pub permissions: Vec<Permission>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            max_attempts: 2,
            permissions: vec![Permission::Read],
        }
    }
}

impl ToolsConfig {
    pub fn granted(&self) -> Permissions {
        Permissions::from_iter(self.permissions.iter().copied())
    }
}

/// [stages] 段：按名称选择各阶段实现
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    /// llm / direct
    pub planner: String,
    /// tools
    pub executor: String,
    /// llm / outcome
    pub critic: String,
    /// memory
    pub learner: String,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            planner: "llm".to_string(),
            executor: "tools".to_string(),
            critic: "llm".to_string(),
            learner: "memory".to_string(),
        }
    }
}

impl AppConfig {
    /// 取值范围检查
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let fail = |msg: &str| Err(config::ConfigError::Message(msg.to_string()));
        if !(0.0..=10.0).contains(&self.engine.quality_threshold) {
            return fail("engine.quality_threshold must be within [0, 10]");
        }
        if self.scheduler.workers == 0 || self.scheduler.queue_capacity == 0 {
            return fail("scheduler.workers and scheduler.queue_capacity must be positive");
        }
        if self.memory.embedding_dim == 0 || self.memory.short_term_capacity == 0 {
            return fail("memory.embedding_dim and memory.short_term_capacity must be positive");
        }
        if !(MIN_IMPORTANCE..=1.0).contains(&self.memory.long_term_min_importance) {
            return fail("memory.long_term_min_importance must be within [0.3, 1]");
        }
        if !(0.0..=1.0).contains(&self.memory.semantic_min_confidence) {
            return fail("memory.semantic_min_confidence must be within [0, 1]");
        }
        if self.memory.rank.recency_half_life_secs == 0 {
            return fail("memory.rank.recency_half_life_secs must be positive");
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c: AppConfig = builder.build()?.try_deserialize()?;
    c.validate()?;
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = AppConfig::default();
        assert_eq!(c.engine.max_retries, 3);
        assert_eq!(c.engine.quality_threshold, 7.0);
        assert_eq!(c.memory.short_term_capacity, 100);
        assert_eq!(c.memory.short_term_ttl_secs, 3600);
        assert_eq!(c.memory.long_term_min_importance, 0.3);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let e = EngineConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 350,
            ..EngineConfig::default()
        };
        assert_eq!(e.backoff(1), Duration::from_millis(100));
        assert_eq!(e.backoff(2), Duration::from_millis(200));
        assert_eq!(e.backoff(3), Duration::from_millis(350));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            "[engine]\nmax_retries = 5\n\n[memory.semantic]\nblend = \"max\"\n\n[tools]\npermissions = [\"read\", \"network\"]\n",
        )
        .unwrap();
        let c = load_config(Some(path)).unwrap();
        assert_eq!(c.engine.max_retries, 5);
        assert_eq!(c.engine.quality_threshold, 7.0);
        assert_eq!(c.memory.semantic.blend_policy(), ConfidenceBlend::Max);
        assert!(c.tools.granted().contains(Permission::Network));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut c = AppConfig::default();
        c.engine.quality_threshold = 11.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_importance_floor_enforced() {
        let mut c = AppConfig::default();
        c.memory.long_term_min_importance = 0.1;
        assert!(c.validate().is_err());
        c.memory.long_term_min_importance = 0.5;
        assert!(c.validate().is_ok());
    }
}
