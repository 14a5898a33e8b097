//! 计划格式的 JSON Schema（schemars 自动生成）
//!
//! 拼入规划 prompt，减少模型输出格式错误。

use schemars::schema_for;

use crate::stages::Plan;

/// 返回 Plan 的 JSON Schema 字符串
pub fn plan_schema_json() -> String {
    let schema = schema_for!(Plan);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
