//! LLM 输出解析与 JSON 修复
//!
//! 提取顺序：```json 代码块 → 花括号匹配扫描 → 以 "subtasks" 为锚的花括号匹配 → 原文。
//! 每个候选都要能解析为 JSON 对象才被接受。
//!
//! 修复流水线（对合法 JSON 每一步都是恒等变换）：
//! 去注释 → 单引号转双引号 → 转义字符串内控制字符 → 补缺失的逗号 → 去尾随逗号。
//!
//! 规划解析（PlanParser）永不失败：修复失败后依次尝试部分提取 subtasks、LLM 修复，
//! 最后退化为单子任务占位计划。

use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::core::AgentError;
use crate::llm::{prompts, LlmClient, SamplingParams};

/// JSON 解析错误位置信息（字符位置从 0 开始，行列从 1 开始）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonErrorInfo {
    pub message: String,
    pub line: usize,
    pub column: usize,
    pub position: usize,
}

impl JsonErrorInfo {
    pub fn from_error(text: &str, err: &serde_json::Error) -> Self {
        let line = err.line().max(1);
        let column = err.column().max(1);
        let mut position = 0usize;
        for (idx, l) in text.split('\n').enumerate() {
            if idx + 1 == line {
                position += l.chars().take(column - 1).count();
                break;
            }
            position += l.chars().count() + 1;
        }
        Self {
            message: err.to_string(),
            line,
            column,
            position: position.min(text.chars().count()),
        }
    }
}

/// 规划解析来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseSource {
    Direct,
    Repaired,
    Partial,
    LlmRepaired,
    Fallback,
}

/// 规划解析结果：已校验补全的 `{"subtasks": [...]}` 文档
#[derive(Debug, Clone)]
pub struct ParsedPlan {
    pub data: Value,
    pub source: ParseSource,
    pub error: Option<String>,
}

fn parse_object(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

/// 能否解析为 JSON 对象
pub fn is_valid_json_object(s: &str) -> bool {
    parse_object(s).is_some()
}

/// 取第一个代码块的内容（优先 ```json），不存在时返回 None
pub fn fenced_block(text: &str) -> Option<&str> {
    let (start, skip) = if let Some(i) = text.find("```json") {
        (i, 7)
    } else {
        (text.find("```")?, 3)
    };
    let body_start = start + skip;
    let rest = &text[body_start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

/// 代码块感知的文本提取（不做修复）：有代码块取代码块，否则取去空白后的原文
pub fn strip_fences(text: &str) -> &str {
    fenced_block(text).unwrap_or_else(|| text.trim())
}

/// 从 `open`（'{' 的字节位置）开始查找匹配的 '}'，跳过字符串内容
fn match_brace(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for (i, c) in text[open..].char_indices() {
        if let Some(q) = in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' => in_string = Some('"'),
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// 提取最可能的 JSON 文本
pub fn extract_json(response: &str) -> String {
    let text = response.trim();

    // 1. 代码块
    if let Some(block) = fenced_block(text) {
        if is_valid_json_object(block) {
            return block.to_string();
        }
    }

    // 2. 顶层花括号匹配
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find('{') {
        let open = search_from + rel;
        match match_brace(text, open) {
            Some(close) => {
                let candidate = &text[open..=close];
                if is_valid_json_object(candidate) {
                    return candidate.trim().to_string();
                }
                search_from = close + 1;
            }
            None => break,
        }
    }

    // 3. 以 "subtasks" 为锚
    let anchor = text.find("\"subtasks\"").or_else(|| text.find("'subtasks'"));
    if let Some(anchor) = anchor {
        if let Some(open) = text[..anchor].rfind('{') {
            if let Some(close) = match_brace(text, open) {
                let candidate = &text[open..=close];
                if is_valid_json_object(candidate) {
                    return candidate.trim().to_string();
                }
            }
        }
    }

    // 4. 原文（有代码块时取代码块，其次取首个 '{' 到最后一个 '}'）
    if let Some(block) = fenced_block(text) {
        return block.to_string();
    }
    if let (Some(s), Some(e)) = (text.find('{'), text.rfind('}')) {
        if s < e {
            return text[s..=e].to_string();
        }
    }
    text.to_string()
}

/// 去掉字符串外的 `//` 行注释与 `/* */` 块注释
pub fn strip_comments(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                in_string = None;
            }
            i += 1;
            continue;
        }
        if c == '"' || c == '\'' {
            in_string = Some(c);
            out.push(c);
            i += 1;
        } else if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i = (i + 2).min(chars.len());
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// 把双引号字符串之外的单引号字符串改写为双引号字符串
pub fn fix_single_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    let mut in_double = false;
    let mut escaped = false;
    while let Some(c) = chars.next() {
        if in_double {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_double = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_double = true;
                out.push(c);
            }
            '\'' => {
                out.push('"');
                while let Some(inner) = chars.next() {
                    match inner {
                        '\\' => match chars.next() {
                            Some('\'') => out.push('\''),
                            Some(next) => {
                                out.push('\\');
                                out.push(next);
                            }
                            None => out.push('\\'),
                        },
                        '\'' => break,
                        '"' => out.push_str("\\\""),
                        other => out.push(other),
                    }
                }
                out.push('"');
            }
            _ => out.push(c),
        }
    }
    out
}

/// 逐字符跟踪引号 / 转义状态，转义字符串内未转义的控制字符与非法转义
pub fn escape_control_chars(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }
        match c {
            '"' => {
                in_string = false;
                out.push(c);
            }
            '\\' => match chars.peek() {
                Some(&n) if "nrtbfu\"\\/".contains(n) => {
                    out.push('\\');
                    out.push(n);
                    chars.next();
                }
                _ => out.push_str("\\\\"),
            },
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn is_bare_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-' | '_')
}

/// 在相邻的值（字符串 / 数字 / 布尔 / null / 对象 / 数组）之间补逗号
pub fn insert_missing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 8);
    // 上一个值结束后在 out 中的字节位置
    let mut value_end: Option<usize> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let starts_value = c == '"' || c == '{' || c == '[' || is_bare_char(c);
        if starts_value {
            if let Some(pos) = value_end.take() {
                out.insert(pos, ',');
            }
        }
        match c {
            '"' => {
                out.push(c);
                i += 1;
                let mut escaped = false;
                while i < chars.len() {
                    let sc = chars[i];
                    out.push(sc);
                    i += 1;
                    if escaped {
                        escaped = false;
                    } else if sc == '\\' {
                        escaped = true;
                    } else if sc == '"' {
                        break;
                    }
                }
                value_end = Some(out.len());
            }
            '}' | ']' => {
                out.push(c);
                i += 1;
                value_end = Some(out.len());
            }
            c if is_bare_char(c) => {
                while i < chars.len() && is_bare_char(chars[i]) {
                    out.push(chars[i]);
                    i += 1;
                }
                value_end = Some(out.len());
            }
            c if c.is_whitespace() => {
                out.push(c);
                i += 1;
            }
            _ => {
                // ':' ',' '{' '[' 及其它符号
                out.push(c);
                i += 1;
                value_end = None;
            }
        }
    }
    out
}

/// 去掉 `}` / `]` 之前的尾随逗号（字符串外）
pub fn strip_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// 修复流水线；输入已是合法 JSON 时原样返回
pub fn repair_json(s: &str) -> String {
    if serde_json::from_str::<Value>(s.trim()).is_ok() {
        return s.trim().to_string();
    }
    let s = strip_comments(s);
    let s = fix_single_quotes(&s);
    let s = escape_control_chars(&s);
    let s = insert_missing_commas(&s);
    let s = strip_trailing_commas(&s);
    s.trim().to_string()
}

/// 提取 + 修复 + 解析为 JSON 值（决策、投票样本等使用）
pub fn parse_json_value(response: &str) -> Result<Value, AgentError> {
    let extracted = extract_json(response);
    if let Ok(v) = serde_json::from_str::<Value>(&extracted) {
        return Ok(v);
    }
    let repaired = repair_json(&extracted);
    serde_json::from_str::<Value>(&repaired).map_err(AgentError::from)
}

/// 部分提取：定位 `"subtasks": [`，逐个收集数组内平衡的 `{...}`，能解析（必要时修复）的保留
pub fn extract_partial_subtasks(response: &str) -> Option<Value> {
    let re = Regex::new(r#"["']subtasks["']\s*:\s*\["#).ok()?;
    let m = re.find(response)?;
    let body = &response[m.end()..];

    let mut subtasks = Vec::new();
    let mut idx = 0;
    while idx < body.len() {
        let rest = &body[idx..];
        let Some(c) = rest.chars().next() else { break };
        if c == ']' {
            break;
        }
        if c == '{' {
            match match_brace(body, idx) {
                Some(close) => {
                    let candidate = &body[idx..=close];
                    let parsed = parse_object(candidate).or_else(|| parse_object(&repair_json(candidate)));
                    if let Some(obj) = parsed {
                        subtasks.push(obj);
                    }
                    idx = close + 1;
                    continue;
                }
                None => break,
            }
        }
        idx += c.len_utf8();
    }

    if subtasks.is_empty() {
        None
    } else {
        Some(json!({ "subtasks": subtasks }))
    }
}

/// 规划数据校验与补全：缺 id / description / actions / args / type 时补默认值，丢弃缺 tool 的动作
pub fn validate_plan(mut plan: Value) -> Result<Value, AgentError> {
    let obj = plan
        .as_object_mut()
        .ok_or_else(|| AgentError::Validation("Plan data must be a dictionary".to_string()))?;

    let raw = match obj.remove("subtasks") {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };

    let mut subtasks = Vec::with_capacity(raw.len());
    for (idx, item) in raw.into_iter().enumerate() {
        let Value::Object(mut subtask) = item else {
            tracing::warn!(index = idx, "Subtask is not an object, skipping");
            continue;
        };
        subtask
            .entry("id")
            .or_insert_with(|| json!(format!("subtask_{}", idx + 1)));
        subtask
            .entry("description")
            .or_insert_with(|| json!(format!("Subtask {}", idx + 1)));

        let actions = match subtask.remove("actions") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        let mut kept = Vec::with_capacity(actions.len());
        for (a_idx, action) in actions.into_iter().enumerate() {
            let Value::Object(mut action) = action else {
                tracing::warn!(index = a_idx, "Action is not an object, skipping");
                continue;
            };
            if !action.get("tool").map(|t| t.is_string()).unwrap_or(false) {
                tracing::warn!(index = a_idx, "Action missing 'tool' field, skipping");
                continue;
            }
            if !action.get("args").map(Value::is_object).unwrap_or(false) {
                action.insert("args".to_string(), Value::Object(Map::new()));
            }
            action.entry("type").or_insert_with(|| json!("gui"));
            kept.push(Value::Object(action));
        }
        subtask.insert("actions".to_string(), Value::Array(kept));
        subtasks.push(Value::Object(subtask));
    }

    obj.insert("subtasks".to_string(), Value::Array(subtasks));
    Ok(plan)
}

/// 占位计划：单个子任务，描述中带错误文本
pub fn fallback_plan(error: &str) -> Value {
    json!({
        "subtasks": [{
            "id": "subtask_1",
            "description": format!("解析规划失败: {error}"),
            "actions": []
        }]
    })
}

/// 规划响应解析器；持有 LLM 时失败后可走 LLM 修复
#[derive(Clone, Default)]
pub struct PlanParser {
    llm: Option<Arc<dyn LlmClient>>,
}

impl PlanParser {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }

    /// 解析规划响应，永不失败
    pub async fn parse(&self, response: &str) -> ParsedPlan {
        let extracted = extract_json(response);

        if let Ok(v) = serde_json::from_str::<Value>(&extracted) {
            return self.finish(v, ParseSource::Direct);
        }

        let repaired = repair_json(&extracted);
        let info = match serde_json::from_str::<Value>(&repaired) {
            Ok(v) => return self.finish(v, ParseSource::Repaired),
            Err(e) => JsonErrorInfo::from_error(&repaired, &e),
        };
        tracing::warn!(
            line = info.line,
            column = info.column,
            position = info.position,
            error = %info.message,
            "Failed to parse plan response as JSON"
        );

        if let Some(partial) = extract_partial_subtasks(response) {
            tracing::info!("Extracted partial subtasks from plan response");
            return self.finish(partial, ParseSource::Partial);
        }

        if let Some(fixed) = self.repair_with_llm(&repaired, &info).await {
            return self.finish(fixed, ParseSource::LlmRepaired);
        }

        tracing::error!("All JSON repair strategies failed, returning fallback plan");
        ParsedPlan {
            data: fallback_plan(&info.message),
            source: ParseSource::Fallback,
            error: Some(info.message),
        }
    }

    fn finish(&self, value: Value, source: ParseSource) -> ParsedPlan {
        match validate_plan(value) {
            Ok(data) => ParsedPlan { data, source, error: None },
            Err(e) => {
                let msg = e.to_string();
                ParsedPlan {
                    data: fallback_plan(&msg),
                    source: ParseSource::Fallback,
                    error: Some(msg),
                }
            }
        }
    }

    async fn repair_with_llm(&self, broken: &str, info: &JsonErrorInfo) -> Option<Value> {
        let llm = self.llm.as_ref()?;
        tracing::info!("Attempting LLM-based JSON repair");
        let prompt = prompts::json_repair_prompt(broken, info);
        let fixed = match llm.generate(&prompt, &SamplingParams::with_temperature(0.0)).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "LLM-based JSON repair failed");
                return None;
            }
        };

        let has_subtasks = |v: &Value| v.get("subtasks").is_some();

        if let Some(v) = parse_object(&fixed).filter(has_subtasks) {
            return Some(v);
        }
        let extracted = extract_json(&fixed);
        if let Some(v) = parse_object(&extracted).filter(has_subtasks) {
            return Some(v);
        }
        let repaired = repair_json(&extracted);
        match parse_object(&repaired) {
            Some(v) if has_subtasks(&v) => Some(v),
            Some(_) => {
                tracing::warn!("LLM fixed JSON but missing 'subtasks' field");
                None
            }
            None => {
                tracing::warn!("LLM fixed JSON still has errors");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn plan_ok(s: &str) -> Value {
        let v: Value = serde_json::from_str(&repair_json(&extract_json(s))).expect("repaired json parses");
        validate_plan(v).unwrap()
    }

    #[test]
    fn test_extract_fenced() {
        let text = "Here:\n```json\n{\"subtasks\": []}\n```\nbye";
        assert_eq!(extract_json(text), "{\"subtasks\": []}");
    }

    #[test]
    fn test_extract_brace_scan_skips_invalid_prefix() {
        let text = "noise {not json} then {\"a\": \"}\"} tail";
        assert_eq!(extract_json(text), "{\"a\": \"}\"}");
    }

    #[test]
    fn test_repair_single_quotes_and_trailing_commas() {
        let v = plan_ok("{'subtasks': [{'id': 's1', 'actions': [{'tool': 'navigate', 'args': {'url': 'https://x.com'},},],},]}");
        assert_eq!(v["subtasks"][0]["actions"][0]["args"]["url"], "https://x.com");
        assert_eq!(v["subtasks"][0]["actions"][0]["type"], "gui");
    }

    #[test]
    fn test_repair_missing_commas() {
        let v = plan_ok("{\"subtasks\": [{\"id\": \"s1\" \"description\": \"d\" \"actions\": [] } {\"id\": \"s2\"}]}");
        assert_eq!(v["subtasks"].as_array().unwrap().len(), 2);
        assert_eq!(v["subtasks"][1]["description"], "Subtask 2");
    }

    #[test]
    fn test_repair_control_chars_and_comments() {
        let raw = "{\n  // plan\n  \"subtasks\": [{\"description\": \"line1\nline2\ttab\", \"actions\": []}] /* end */\n}";
        let v = plan_ok(raw);
        assert_eq!(v["subtasks"][0]["description"], "line1\nline2\ttab");
        assert_eq!(v["subtasks"][0]["id"], "subtask_1");
    }

    #[test]
    fn test_repair_keeps_urls_in_strings() {
        let raw = "{\"subtasks\": [{\"actions\": [{\"tool\": \"navigate\", \"args\": {\"url\": \"http://a.com\"}},]}]}";
        let v = plan_ok(raw);
        assert_eq!(v["subtasks"][0]["actions"][0]["args"]["url"], "http://a.com");
    }

    #[test]
    fn test_steps_are_identity_on_valid_json() {
        let valid = r#"{"a": [1, -2.5e3, true, null, "x // y", {"b": "it's"}], "c": "\n"}"#;
        assert_eq!(strip_comments(valid), valid);
        assert_eq!(fix_single_quotes(valid), valid);
        assert_eq!(escape_control_chars(valid), valid);
        assert_eq!(insert_missing_commas(valid), valid);
        assert_eq!(strip_trailing_commas(valid), valid);
    }

    #[test]
    fn test_validate_drops_actions_without_tool() {
        let v = validate_plan(json!({"subtasks": [{"actions": [{"args": {}}, {"tool": "click"}], "id": "x"}, 3]})).unwrap();
        let subtasks = v["subtasks"].as_array().unwrap();
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0]["actions"].as_array().unwrap().len(), 1);
        assert_eq!(subtasks[0]["actions"][0]["args"], json!({}));
        assert!(validate_plan(json!([1])).is_err());
    }

    #[test]
    fn test_partial_extraction_from_truncated_output() {
        let text = r#"{"subtasks": [{"id": "s1", "actions": [{"tool": "navigate"}]}, {"id": "s2", "actions": [{"tool": "cl"#;
        let v = extract_partial_subtasks(text).unwrap();
        assert_eq!(v["subtasks"].as_array().unwrap().len(), 1);
        assert_eq!(v["subtasks"][0]["id"], "s1");
    }

    #[tokio::test]
    async fn test_parser_falls_back_without_llm() {
        let parsed = PlanParser::new(None).parse("I cannot help with that").await;
        assert_eq!(parsed.source, ParseSource::Fallback);
        let desc = parsed.data["subtasks"][0]["description"].as_str().unwrap();
        assert!(desc.starts_with("解析规划失败: "));
        assert_eq!(parsed.data["subtasks"][0]["id"], "subtask_1");
    }

    #[tokio::test]
    async fn test_parser_llm_repair() {
        let llm = Arc::new(MockLlmClient::scripted([r#"{"subtasks": [{"id": "fixed", "actions": []}]}"#]));
        let parsed = PlanParser::new(Some(llm.clone())).parse("{\"subtasks\": [ {\"id\": ").await;
        assert_eq!(parsed.source, ParseSource::LlmRepaired);
        assert_eq!(parsed.data["subtasks"][0]["id"], "fixed");
        assert!(llm.prompts()[0].contains("错误位置"));
    }

    #[test]
    fn test_parse_json_value_decision() {
        let v = parse_json_value("decision: {'should_continue': false, 'reasoning': 'done',}").unwrap();
        assert_eq!(v["should_continue"], false);
    }
}
