//! 浏览器交互工具：navigate / click / input / scroll / screenshot / wait
//!
//! 所有 GUI 工具共享一个显式构造的 BrowserSession（Arc），不存在全局单例。
//! 会话本身只维护页面状态（当前 URL、已知元素、输入值、滚动位置、操作记录）；
//! 真正的渲染由外部驱动（如 MCP 浏览器服务）负责，这里只保证工具契约。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tools::schema::{
    params_schema, ClickParams, InputParams, NavigateParams, ScreenshotParams, ScrollParams, WaitParams,
};
use crate::tools::{Tool, ToolOutcome, ToolRegistry};

/// 页面上的可交互元素
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageElement {
    pub selector: String,
    /// 标签名：input / button / a / textarea ...
    pub tag: String,
    /// type 属性
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub placeholder: String,
    #[serde(default)]
    pub class_name: String,
}

impl PageElement {
    pub fn new(selector: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            tag: tag.into(),
            kind: String::new(),
            text: String::new(),
            placeholder: String::new(),
            class_name: String::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }

    /// 是否匹配元素类别（input / button / link / 其它标签名）
    pub fn matches_type(&self, element_type: &str) -> bool {
        let tag = self.tag.to_lowercase();
        let kind = self.kind.to_lowercase();
        match element_type {
            "input" => {
                (tag == "input" && matches!(kind.as_str(), "text" | "search" | "email" | "password" | ""))
                    || tag == "textarea"
            }
            "button" => tag == "button" || kind == "button" || self.class_name.to_lowercase().contains("button"),
            "link" => tag == "a",
            other => tag == other,
        }
    }
}

#[derive(Debug, Default)]
struct PageState {
    current_url: Option<String>,
    elements: Vec<PageElement>,
    values: HashMap<String, String>,
    scroll_y: i64,
    log: Vec<Value>,
}

/// 浏览器会话：GUI 工具共享的页面状态
#[derive(Debug, Default)]
pub struct BrowserSession {
    state: Mutex<PageState>,
}

impl BrowserSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PageState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_url(&self) -> Option<String> {
        self.lock().current_url.clone()
    }

    /// 设置当前页面的可交互元素（由外部驱动或测试提供）
    pub fn set_elements(&self, elements: Vec<PageElement>) {
        self.lock().elements = elements;
    }

    pub fn elements(&self) -> Vec<PageElement> {
        self.lock().elements.clone()
    }

    pub fn value_of(&self, selector: &str) -> Option<String> {
        self.lock().values.get(selector).cloned()
    }

    pub fn scroll_y(&self) -> i64 {
        self.lock().scroll_y
    }

    /// 已执行的操作记录
    pub fn history(&self) -> Vec<Value> {
        self.lock().log.clone()
    }

    /// 环境快照（供 Context.screen_state）
    pub fn snapshot(&self) -> Value {
        let state = self.lock();
        json!({
            "url": state.current_url,
            "scroll_y": state.scroll_y,
            "elements": state.elements.len(),
        })
    }

    fn navigate(&self, url: &str) {
        let mut state = self.lock();
        state.current_url = Some(url.to_string());
        state.elements.clear();
        state.values.clear();
        state.scroll_y = 0;
        state.log.push(json!({"action": "navigate", "url": url}));
    }

    /// 元素已知时才校验存在性；页面元素未知则视为可交互
    fn has_element(&self, selector: &str) -> bool {
        let state = self.lock();
        state.elements.is_empty() || state.elements.iter().any(|e| e.selector == selector)
    }

    fn record(&self, entry: Value) {
        self.lock().log.push(entry);
    }
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str()).filter(|s| !s.trim().is_empty())
}

/// 注册全部浏览器工具
pub fn register_browser_tools(registry: &ToolRegistry, session: &Arc<BrowserSession>) {
    registry.register(NavigateTool::new(session.clone()));
    registry.register(ClickTool::new(session.clone()));
    registry.register(InputTool::new(session.clone()));
    registry.register(ScrollTool::new(session.clone()));
    registry.register(ScreenshotTool::new(session.clone()));
    registry.register(WaitTool::new(session.clone()));
}

macro_rules! session_tool {
    ($name:ident) => {
        pub struct $name {
            session: Arc<BrowserSession>,
        }

        impl $name {
            pub fn new(session: Arc<BrowserSession>) -> Self {
                Self { session }
            }
        }
    };
}

session_tool!(NavigateTool);
session_tool!(ClickTool);
session_tool!(InputTool);
session_tool!(ScrollTool);
session_tool!(ScreenshotTool);
session_tool!(WaitTool);

#[async_trait]
impl Tool for NavigateTool {
    fn name(&self) -> &str {
        "navigate"
    }

    fn description(&self) -> &str {
        "navigate - 在浏览器中导航到指定URL"
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<NavigateParams>()
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let Some(url) = arg_str(&args, "url") else {
            return ToolOutcome::fail("URL is required", "需要提供URL");
        };
        self.session.navigate(url);
        ToolOutcome::ok(json!({"url": url}), format!("已导航到 {url}"))
    }
}

#[async_trait]
impl Tool for ClickTool {
    fn name(&self) -> &str {
        "click"
    }

    fn description(&self) -> &str {
        "click - 点击页面上的元素（通过CSS选择器）"
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<ClickParams>()
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let Some(target) = arg_str(&args, "target").or_else(|| arg_str(&args, "selector")) else {
            return ToolOutcome::fail("Target is required", "需要提供目标元素");
        };
        if !self.session.has_element(target) {
            return ToolOutcome::fail(
                format!("Element not found: {target}"),
                format!("点击失败: 元素不存在 {target}"),
            );
        }
        self.session.record(json!({"action": "click", "target": target}));
        ToolOutcome::ok(json!({"target": target}), format!("已点击 {target}"))
    }
}

#[async_trait]
impl Tool for InputTool {
    fn name(&self) -> &str {
        "input"
    }

    fn description(&self) -> &str {
        "input - 在输入框中输入文本"
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<InputParams>()
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let Some(target) = arg_str(&args, "target").or_else(|| arg_str(&args, "selector")) else {
            return ToolOutcome::fail("Target is required", "需要提供目标元素");
        };
        let value = args
            .get("value")
            .or_else(|| args.get("text"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if !self.session.has_element(target) {
            return ToolOutcome::fail(
                format!("Element not found: {target}"),
                format!("输入失败: 元素不存在 {target}"),
            );
        }
        {
            let mut state = self.session.lock();
            state.values.insert(target.to_string(), value.to_string());
            state.log.push(json!({"action": "input", "target": target, "value": value}));
        }
        ToolOutcome::ok(
            json!({"target": target, "value": value}),
            format!("已输入文本到 {target}"),
        )
    }
}

#[async_trait]
impl Tool for ScrollTool {
    fn name(&self) -> &str {
        "scroll"
    }

    fn description(&self) -> &str {
        "scroll - 滚动页面"
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<ScrollParams>()
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let direction = arg_str(&args, "direction").unwrap_or("down").to_string();
        let amount = args.get("amount").and_then(|v| v.as_i64()).unwrap_or(500);
        {
            let mut state = self.session.lock();
            if direction == "up" {
                state.scroll_y = (state.scroll_y - amount).max(0);
            } else {
                state.scroll_y += amount;
            }
            state.log.push(json!({"action": "scroll", "direction": direction, "amount": amount}));
        }
        ToolOutcome::ok(
            json!({"direction": direction, "amount": amount}),
            format!("已向{direction}滚动{amount}px"),
        )
    }
}

#[async_trait]
impl Tool for ScreenshotTool {
    fn name(&self) -> &str {
        "screenshot"
    }

    fn description(&self) -> &str {
        "screenshot - 截取当前页面"
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<ScreenshotParams>()
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let path = arg_str(&args, "path").unwrap_or("screenshot.png").to_string();
        let full_page = args.get("full_page").and_then(|v| v.as_bool()).unwrap_or(false);
        let snapshot = self.session.snapshot();
        self.session
            .record(json!({"action": "screenshot", "path": path, "full_page": full_page}));
        ToolOutcome::ok(
            json!({"path": path, "page": snapshot}),
            format!("截图已保存到 {path}"),
        )
    }
}

#[async_trait]
impl Tool for WaitTool {
    fn name(&self) -> &str {
        "wait"
    }

    fn description(&self) -> &str {
        "wait - 等待指定时间（毫秒）或等待元素出现"
    }

    fn parameters_schema(&self) -> Value {
        params_schema::<WaitParams>()
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let timeout_ms = args.get("timeout").and_then(|v| v.as_u64()).unwrap_or(1000);
        if let Some(selector) = arg_str(&args, "selector") {
            if !self.session.has_element(selector) {
                return ToolOutcome::fail(
                    format!("Timeout waiting for element: {selector}"),
                    format!("等待元素超时: {selector}"),
                );
            }
        } else {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
        }
        self.session.record(json!({"action": "wait", "timeout": timeout_ms}));
        ToolOutcome::ok(json!({"timeout": timeout_ms}), "等待完成")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (ToolRegistry, Arc<BrowserSession>) {
        let registry = ToolRegistry::new();
        let session = BrowserSession::new();
        register_browser_tools(&registry, &session);
        (registry, session)
    }

    #[tokio::test]
    async fn test_navigate_then_click() {
        let (registry, session) = registry();
        let out = registry.execute("navigate", json!({"url": "https://example.com"})).await;
        assert!(out.success);
        assert_eq!(session.current_url().as_deref(), Some("https://example.com"));

        let out = registry.execute("click", json!({"target": "button#go"})).await;
        assert!(out.success);
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test]
    async fn test_click_requires_target() {
        let (registry, _) = registry();
        let out = registry.execute("click", json!({})).await;
        assert!(!out.success);
        assert_eq!(out.message, "需要提供目标元素");
    }

    #[tokio::test]
    async fn test_click_unknown_element_when_page_is_known() {
        let (registry, session) = registry();
        session.set_elements(vec![PageElement::new("#kw", "input")]);
        let out = registry.execute("click", json!({"target": "#nope"})).await;
        assert!(!out.success);
        assert!(out.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_input_and_scroll() {
        let (registry, session) = registry();
        let out = registry.execute("input", json!({"target": "#kw", "value": "rust"})).await;
        assert!(out.success);
        assert_eq!(session.value_of("#kw").as_deref(), Some("rust"));

        registry.execute("scroll", json!({"amount": 300})).await;
        registry.execute("scroll", json!({"direction": "up", "amount": 1000})).await;
        assert_eq!(session.scroll_y(), 0);
    }

    #[test]
    fn test_element_type_matching() {
        let input = PageElement::new("#kw", "input").with_kind("search");
        let button = PageElement::new("#go", "button");
        assert!(input.matches_type("input"));
        assert!(!input.matches_type("button"));
        assert!(button.matches_type("button"));
    }
}
