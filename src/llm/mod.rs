//! 推理后端层：后端抽象、重试包装、Mock 实现与文本嵌入

pub mod embedding;
pub mod mock;
pub mod traits;

pub use embedding::{Embedder, HashingEmbedder};
pub use mock::{MockBackend, ScriptedBackend, CRITIQUE_PROMPT_HEADER, PLAN_PROMPT_HEADER};
pub use traits::{BackendError, Generation, ReasoningBackend, RetryConfig, RetryingBackend};
