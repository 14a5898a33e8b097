//! Hive - Rust 自主任务执行平台
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排引擎、任务状态机、错误恢复、任务历史、调度与关闭
//! - **stages**: Plan / Execute / Critique / Learn 阶段接口与实现
//! - **memory**: 短期 / 长期 / 情景 / 语义记忆与持久化
//! - **llm**: 推理后端与嵌入接口（含确定性 Mock）
//! - **tools**: 工具注册表、权限与执行器
//! - **observability**: 日志初始化

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod stages;
pub mod tools;
