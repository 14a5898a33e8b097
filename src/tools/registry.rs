//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! 注册时校验名称与参数 schema，调用时校验权限与必填参数；ToolExecutor 在外层加超时、并发上限与审计日志。

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 工具所需的能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Network,
    Execute,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Network => "network",
            Permission::Execute => "execute",
        };
        f.write_str(s)
    }
}

/// 一次调用被授予的权限集合
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions(BTreeSet<Permission>);

impl Permissions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self::from_iter([
            Permission::Read,
            Permission::Write,
            Permission::Network,
            Permission::Execute,
        ])
    }

    pub fn contains(&self, p: Permission) -> bool {
        self.0.contains(&p)
    }

    /// 返回 required 中未被授予的权限
    pub fn missing(&self, required: &[Permission]) -> Vec<Permission> {
        required
            .iter()
            .copied()
            .filter(|p| !self.0.contains(p))
            .collect()
    }
}

impl FromIterator<Permission> for Permissions {
    fn from_iter<T: IntoIterator<Item = Permission>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// 工具执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub result: String,
    pub cost: f64,
}

impl ToolOutput {
    pub fn new(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    Unknown(String),

    /// 权限不足，不可重试
    #[error("Permission denied for tool {tool}: missing {missing:?}")]
    Denied { tool: String, missing: Vec<Permission> },

    #[error("Tool {tool} failed: {message}")]
    Failed {
        tool: String,
        message: String,
        transient: bool,
    },

    #[error("Tool {tool} timed out after {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("Invalid arguments for tool {tool}: {message}")]
    InvalidArgs { tool: String, message: String },
}

impl ToolError {
    pub fn failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        ToolError::Failed {
            tool: tool.into(),
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(tool: impl Into<String>, message: impl Into<String>) -> Self {
        ToolError::Failed {
            tool: tool.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// 是否值得在同一次 Execute 内重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ToolError::Timeout { .. } | ToolError::Failed { transient: true, .. }
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("Tool name must be non-empty and use [a-z0-9_-]: {0:?}")]
    InvalidName(String),

    #[error("Tool already registered: {0}")]
    Duplicate(String),

    #[error("Invalid parameter schema for tool {tool}: {reason}")]
    InvalidSchema { tool: String, reason: String },
}

/// 工具 trait：名称、描述（供规划器理解）、参数 schema、所需权限、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn required_permissions(&self) -> &[Permission] {
        &[]
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError>;
}

/// 工具调用能力：Execute 阶段只依赖此接口
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        tool: &str,
        args: Value,
        permissions: &Permissions,
    ) -> Result<ToolOutput, ToolError>;

    /// 可用工具的 (name, description)，用于规划 prompt
    fn tool_descriptions(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// 参数 schema 校验：必须是 object 类型，required 中的字段必须在 properties 中声明
fn validate_schema(schema: &Value) -> Result<(), String> {
    let obj = schema.as_object().ok_or("schema must be a JSON object")?;
    if obj.get("type").and_then(Value::as_str) != Some("object") {
        return Err("schema type must be \"object\"".to_string());
    }
    let properties = match obj.get("properties") {
        None => None,
        Some(Value::Object(p)) => Some(p),
        Some(_) => return Err("properties must be an object".to_string()),
    };
    if let Some(required) = obj.get("required") {
        let required = required.as_array().ok_or("required must be an array")?;
        for field in required {
            let field = field.as_str().ok_or("required entries must be strings")?;
            if !properties.is_some_and(|p| p.contains_key(field)) {
                return Err(format!("required field {:?} not declared in properties", field));
            }
        }
    }
    Ok(())
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；名称非法、重名或 schema 不合法时拒绝
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistrationError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistrationError> {
        let name = tool.name().to_string();
        if !valid_name(&name) {
            return Err(RegistrationError::InvalidName(name));
        }
        if self.tools.contains_key(&name) {
            return Err(RegistrationError::Duplicate(name));
        }
        validate_schema(&tool.parameters_schema()).map_err(|reason| {
            RegistrationError::InvalidSchema {
                tool: name.clone(),
                reason,
            }
        })?;
        tracing::debug!(tool = %name, "Tool registered");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// 按名称排序
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 工具 schema 列表 JSON，可拼入规划 prompt
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tool_names()
            .iter()
            .filter_map(|name| self.tools.get(name).map(|t| (name, t)))
            .map(|(name, tool)| {
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

fn check_required_args(tool: &dyn Tool, args: &Value) -> Result<(), ToolError> {
    let invalid = |message: String| ToolError::InvalidArgs {
        tool: tool.name().to_string(),
        message,
    };
    let schema = tool.parameters_schema();
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if required.is_empty() {
        return Ok(());
    }
    let obj = args
        .as_object()
        .ok_or_else(|| invalid("arguments must be a JSON object".to_string()))?;
    for field in required.iter().filter_map(Value::as_str) {
        if !obj.contains_key(field) {
            return Err(invalid(format!("missing required argument {:?}", field)));
        }
    }
    Ok(())
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    async fn invoke(
        &self,
        tool: &str,
        args: Value,
        permissions: &Permissions,
    ) -> Result<ToolOutput, ToolError> {
        let t = self
            .tools
            .get(tool)
            .ok_or_else(|| ToolError::Unknown(tool.to_string()))?;
        let missing = permissions.missing(t.required_permissions());
        if !missing.is_empty() {
            return Err(ToolError::Denied {
                tool: tool.to_string(),
                missing,
            });
        }
        check_required_args(t.as_ref(), &args)?;
        t.execute(args).await
    }

    fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tool_names()
            .into_iter()
            .filter_map(|name| {
                let description = self.tools.get(&name)?.description().to_string();
                Some((name, description))
            })
            .collect()
    }
}
