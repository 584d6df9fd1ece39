//! 提示词模板：规划、逐步决策、反思、元素查找、错误分析、JSON 修复

use serde_json::Value;

use crate::core::{ActionResult, Context};
use crate::llm::output_parser::JsonErrorInfo;
use crate::tools::ToolDescriptor;

/// 决策提示词中展示的最近结果条数
pub const RECENT_RESULTS: usize = 5;
/// 决策提示词中展示的最近变量个数
pub const RECENT_VARIABLES: usize = 10;
/// 变量值在提示词中的最大字符数
pub const VARIABLE_PREVIEW_CHARS: usize = 100;

const TOOL_NAME_RULES: &str = "**重要：工具名称使用规则**
1. 必须使用工具列表中每个工具的\"name\"字段的精确值（区分大小写）
2. 工具名称必须完全匹配，不能使用中文名称或别名
3. 例如：如果工具列表中有\"navigate\"，必须使用\"navigate\"，不能使用\"浏览器\"、\"导航\"等";

const JSON_FORMAT_RULES: &str = "1. 必须使用双引号（\"），不能使用单引号（'）
2. 属性名必须用双引号括起来
3. 不能包含注释（// 或 /* */）
4. 最后一个元素后不能有尾随逗号
5. 只返回纯JSON，不要包含markdown代码块标记或其他文本";

fn tools_text(tools: &[ToolDescriptor]) -> String {
    tools
        .iter()
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect::<Vec<_>>()
        .join("\n")
}

fn preview(value: &Value, max: usize) -> String {
    let s = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    s.chars().take(max).collect()
}

/// 任务规划提示词
pub fn planning_prompt(goal: &str, tools: &[ToolDescriptor], context: &str) -> String {
    let context_text = if context.is_empty() {
        String::new()
    } else {
        format!("上下文信息：{context}")
    };
    format!(
        r#"你是一个智能任务规划助手。请根据用户目标，生成详细的执行计划。

用户目标：{goal}

可用工具：
{tools}

{rules}
4. 工具名称示例：navigate, click, input, scroll, screenshot, wait

请生成一个JSON格式的执行计划，包含以下结构：
{{
  "subtasks": [
    {{
      "id": "subtask_1",
      "description": "子任务描述",
      "actions": [
        {{
          "type": "gui|code|mcp",
          "tool": "工具名称（必须使用工具列表中的精确name字段）",
          "args": {{"参数名": "参数值"}},
          "description": "动作描述",
          "dependencies": []
        }}
      ],
      "dependencies": []
    }}
  ]
}}

**重要：JSON格式要求**
{json_rules}

要求：
1. 将复杂任务分解为多个子任务
2. 每个子任务包含多个动作
3. 明确动作之间的依赖关系
4. 动作类型：gui（浏览器操作）、code（代码执行）、mcp（MCP工具，名称以"mcp_"开头）

{context_text}

请生成执行计划："#,
        tools = tools_text(tools),
        rules = TOOL_NAME_RULES,
        json_rules = JSON_FORMAT_RULES,
    )
}

/// 逐步决策提示词：目标 + 工具目录 + 最近 5 条结果 + 最近 10 个变量
pub fn agent_step_prompt(goal: &str, ctx: &Context, tools: &[ToolDescriptor]) -> String {
    let mut results_text = String::new();
    if !ctx.action_results.is_empty() {
        results_text.push_str("\n已执行的动作：\n");
        let start = ctx.action_results.len().saturating_sub(RECENT_RESULTS);
        for (idx, r) in ctx.action_results[start..].iter().enumerate() {
            results_text.push_str(&format!(
                "{}. {}: {} - {}\n",
                idx + 1,
                r.action_id,
                if r.success { "成功" } else { "失败" },
                r.message
            ));
        }
    }

    let mut variables_text = String::new();
    if !ctx.variables.is_empty() {
        variables_text.push_str("\n上下文变量：\n");
        let start = ctx.variables.len().saturating_sub(RECENT_VARIABLES);
        for (key, value) in &ctx.variables[start..] {
            variables_text.push_str(&format!("- {}: {}\n", key, preview(value, VARIABLE_PREVIEW_CHARS)));
        }
    }

    format!(
        r#"你是一个智能任务执行助手，需要逐步决策每一步操作来完成用户目标。

用户目标：{goal}

可用工具：
{tools}
{results_text}
{variables_text}

{rules}

请分析当前状态，决定下一步操作。返回JSON格式：
{{
  "action": {{
    "type": "gui|code|mcp",
    "tool": "工具名称（必须使用工具列表中的精确name字段）",
    "args": {{"参数名": "参数值"}},
    "description": "动作描述"
  }},
  "should_continue": true/false,
  "should_retry": false,
  "should_skip": false,
  "reasoning": "决策理由",
  "confidence": 0.0-1.0,
  "next_step_description": "下一步描述"
}}

**决策规则：**
1. 如果任务已完成，设置 should_continue 为 false
2. 如果上一步失败且可以重试，设置 should_retry 为 true
3. 如果当前步骤应该跳过，设置 should_skip 为 true
4. 给出决策的置信度（0-1之间）

**JSON格式要求：**
{json_rules}

请生成下一步决策："#,
        tools = tools_text(tools),
        rules = TOOL_NAME_RULES,
        json_rules = JSON_FORMAT_RULES,
    )
}

/// 反思提示词
pub fn reflection_prompt(goal: &str, results: &[ActionResult], current_state: &str) -> String {
    let results_text = results
        .iter()
        .map(|r| {
            format!(
                "- 动作：{}\n  结果：{}\n  信息：{}\n  错误：{}",
                r.action_id,
                if r.success { "成功" } else { "失败" },
                r.message,
                r.error.as_deref().filter(|e| !e.is_empty()).unwrap_or("无")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let state = if current_state.is_empty() { "未知" } else { current_state };

    format!(
        r#"你是一个智能反思助手。请评估任务执行结果，分析问题并给出调整建议。

用户目标：{goal}

执行结果：
{results_text}

当前状态：
{state}

请生成一个JSON格式的反思结果，包含以下结构：
{{
  "success": true/false,
  "analysis": "详细分析执行结果，包括成功和失败的原因",
  "suggestions": ["建议1", "建议2"],
  "needs_replan": true/false,
  "confidence": 0.0-1.0
}}

要求：
1. 客观评估执行结果
2. 分析失败原因（如果有）
3. 提供具体的调整建议
4. 判断是否需要重新规划
5. 只返回JSON，不要其他解释

请生成反思结果："#
    )
}

/// 元素查找提示词
pub fn element_finding_prompt(action_description: &str, element_type: &str, available_elements: &str) -> String {
    format!(
        r#"你是一个智能元素查找助手。请根据动作描述，从页面元素中找到最匹配的目标元素。

动作描述：{action_description}
目标元素类型：{element_type}

页面可用元素：
{available_elements}

**重要提示**：
1. 对于搜索相关操作，优先匹配 name/id/placeholder 含 "wd"、"q"、"kw"、"search"、"搜索" 的元素
2. 对于按钮操作，优先匹配包含"搜索"、"search"、"提交"、"submit"等文本的按钮
3. 优先使用ID和name属性作为选择器

请返回JSON格式：
{{
  "selector": "CSS选择器",
  "reason": "选择理由"
}}

如果找不到匹配的元素，selector 返回 null。只返回JSON，不要其他解释。

请返回查找结果："#
    )
}

/// 错误分析提示词
pub fn error_analysis_prompt(error: &str, action: &Value, context: &str) -> String {
    let kind = action.get("type").and_then(|v| v.as_str()).unwrap_or("unknown");
    let tool = action.get("tool").and_then(|v| v.as_str()).unwrap_or("unknown");
    let args = action.get("args").cloned().unwrap_or_else(|| Value::Object(Default::default()));
    let context_text = if context.is_empty() {
        String::new()
    } else {
        format!("上下文：{context}")
    };
    format!(
        r#"请分析以下错误，并提供解决方案。

错误信息：{error}

动作信息：
- 类型：{kind}
- 工具：{tool}
- 参数：{args}

{context_text}

请返回JSON格式：
{{
  "error_type": "错误类型",
  "cause": "可能原因",
  "solution": "解决方案",
  "should_retry": true/false,
  "alternative_action": {{"tool": "...", "args": {{}}}}
}}

只返回JSON，不要其他解释："#
    )
}

/// LLM 修复 JSON 的提示词：标出错误位置与前后各 100 字符的上下文
pub fn json_repair_prompt(broken: &str, info: &JsonErrorInfo) -> String {
    let chars: Vec<char> = broken.chars().collect();
    let start = info.position.saturating_sub(100);
    let end = (info.position + 100).min(chars.len());
    let start = start.min(end);
    let snippet: String = chars[start..end].iter().collect();
    let marker = format!("{}^", " ".repeat(info.position.saturating_sub(start)));

    format!(
        r#"以下是一个格式错误的 JSON 字符串，请修复它使其成为有效的 JSON。

错误信息：{msg}
错误位置：第 {line} 行，第 {column} 列（字符位置 {pos}）

错误位置附近的上下文：
{snippet}
{marker}

完整的损坏 JSON：
{broken}

**重要要求：**
1. 仔细检查错误位置（第 {line} 行，第 {column} 列）附近的代码
2. 修复所有格式错误（缺少逗号、尾随逗号、缺少引号、单引号、未转义的控制字符等）
3. 保持原有的数据结构不变，不要修改数据内容
4. 确保所有字符串和属性名使用双引号
5. **只返回修复后的 JSON，不要任何解释、markdown 代码块标记或其他文字**

修复后的 JSON："#,
        msg = info.message,
        line = info.line,
        column = info.column,
        pos = info.position,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Task;
    use serde_json::json;

    #[test]
    fn test_step_prompt_windows_results_and_vars() {
        let mut ctx = Context::new(Task::new("goal"));
        for i in 0..8 {
            ctx.action_results
                .push(ActionResult::failure(format!("gui_click_{i}"), "click", "e", "m"));
        }
        for i in 0..12 {
            ctx.set_var(format!("v{i}"), json!("x".repeat(300)));
        }
        let prompt = agent_step_prompt("goal", &ctx, &[]);
        assert!(!prompt.contains("gui_click_2:"));
        assert!(prompt.contains("gui_click_3:"));
        assert!(!prompt.contains("- v1:"));
        assert!(prompt.contains("- v11:"));
        assert!(!prompt.contains(&"x".repeat(101)));
    }

    #[test]
    fn test_repair_prompt_marks_position() {
        let info = JsonErrorInfo {
            message: "expected `,`".into(),
            line: 1,
            column: 5,
            position: 4,
        };
        let prompt = json_repair_prompt("{\"a\" 1}", &info);
        assert!(prompt.contains("    ^"));
        assert!(prompt.contains("第 1 行，第 5 列"));
    }
}
