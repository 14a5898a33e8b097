//! 推理后端抽象
//!
//! 所有后端实现 ReasoningBackend：generate(prompt, context) -> (text, cost)。
//! 错误分为瞬时（可重试）与永久（不可重试）两类。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// 网络抖动、限流等，可重试
    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("Permanent backend error: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// 一次生成的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub cost: f64,
}

impl Generation {
    pub fn new(text: impl Into<String>, cost: f64) -> Self {
        Self {
            text: text.into(),
            cost,
        }
    }
}

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn generate(&self, prompt: &str, context: &str) -> Result<Generation, BackendError>;

    /// 后端名称，用于日志
    fn name(&self) -> &str {
        "backend"
    }
}

/// 重试配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// 对瞬时错误做指数退避重试的包装后端；永久错误直接返回
pub struct RetryingBackend {
    inner: Arc<dyn ReasoningBackend>,
    config: RetryConfig,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn ReasoningBackend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl ReasoningBackend for RetryingBackend {
    async fn generate(&self, prompt: &str, context: &str) -> Result<Generation, BackendError> {
        let attempts = self.config.max_attempts.max(1);
        let mut delay = self.config.initial_delay;
        let mut attempt = 1;
        loop {
            match self.inner.generate(prompt, context).await {
                Ok(g) => return Ok(g),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        backend = self.inner.name(),
                        attempt,
                        "Backend call failed, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.max_delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedBackend;

    #[tokio::test(start_paused = true)]
    async fn test_retrying_backend_recovers_from_transient() {
        let scripted = Arc::new(ScriptedBackend::new(vec![
            Err(BackendError::Transient("429".into())),
            Ok(Generation::new("ok", 0.1)),
        ]));
        let backend = RetryingBackend::new(scripted.clone(), RetryConfig::default());
        let g = backend.generate("p", "").await.unwrap();
        assert_eq!(g.text, "ok");
        assert_eq!(scripted.prompts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_backend_stops_on_permanent() {
        let scripted = Arc::new(ScriptedBackend::new(vec![
            Err(BackendError::Permanent("bad key".into())),
            Ok(Generation::new("never", 0.0)),
        ]));
        let backend = RetryingBackend::new(scripted.clone(), RetryConfig::default());
        assert!(backend.generate("p", "").await.is_err());
        assert_eq!(scripted.prompts().len(), 1);
    }
}
