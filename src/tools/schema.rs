//! 工具参数与调用格式的 JSON Schema（schemars 自动生成）
//!
//! 参数 schema 填入 ToolDescriptor.parameters；调用格式 schema 拼入决策提示词，减少 LLM 输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 工具调用请求格式：与决策解析的 `{"type": "...", "tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 动作类型：gui / code / mcp
    #[serde(rename = "type")]
    pub kind: String,
    /// 工具名，如 navigate、click、input、mcp_xxx
    pub tool: String,
    /// 工具参数，依工具不同而不同（url、target、value 等）
    pub args: serde_json::Map<String, Value>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
pub struct NavigateParams {
    /// 目标 URL
    pub url: String,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
pub struct ClickParams {
    /// CSS 选择器；缺省时由元素定位器推断
    pub target: Option<String>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
pub struct InputParams {
    /// CSS 选择器；缺省时由元素定位器推断
    pub target: Option<String>,
    /// 要输入的文本
    pub value: String,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
pub struct ScrollParams {
    /// up / down
    pub direction: Option<String>,
    /// 像素，默认 500
    pub amount: Option<i64>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
pub struct ScreenshotParams {
    /// 保存路径，默认 screenshot.png
    pub path: Option<String>,
    pub full_page: Option<bool>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
pub struct WaitParams {
    /// 毫秒，默认 1000
    pub timeout: Option<u64>,
    /// 可选：等待该元素出现
    pub selector: Option<String>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
pub struct EchoParams {
    pub text: String,
}

/// 某个参数结构的 JSON Schema（serde_json::Value）
pub fn params_schema<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// 返回工具调用的 JSON Schema 字符串，可拼入提示词
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}
