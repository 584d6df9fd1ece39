//! 元素定位：交互动作缺少 target 时，由 Worker 委托这里推断选择器
//!
//! KeywordElementLocator 只做文本/placeholder 匹配；LlmElementLocator 先让 oracle 选元素，
//! 解析失败时依次尝试选择器模式与序号，最后退回关键词匹配。

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::llm::output_parser::strip_fences;
use crate::llm::prompts::element_finding_prompt;
use crate::llm::{LlmClient, SamplingParams};
use crate::tools::browser::{BrowserSession, PageElement};

/// 元素定位协作者
#[async_trait]
pub trait ElementLocator: Send + Sync {
    /// 根据动作描述返回 CSS 选择器；找不到时返回 None
    async fn locate(&self, description: &str, element_type: &str) -> Option<String>;
}

/// 给定类型的候选元素；没有匹配类型时使用全部元素
fn candidates(elements: &[PageElement], element_type: &str) -> Vec<PageElement> {
    let filtered: Vec<PageElement> = elements
        .iter()
        .filter(|e| e.matches_type(element_type))
        .cloned()
        .collect();
    if filtered.is_empty() {
        tracing::warn!(element_type, "No elements of requested type, using all elements");
        elements.to_vec()
    } else {
        filtered
    }
}

fn format_elements(elements: &[PageElement]) -> String {
    elements
        .iter()
        .enumerate()
        .map(|(i, e)| {
            let mut line = format!("{}. <{}> selector={}", i + 1, e.tag, e.selector);
            if !e.kind.is_empty() {
                line.push_str(&format!(" type={}", e.kind));
            }
            if !e.text.is_empty() {
                line.push_str(&format!(" text=\"{}\"", e.text));
            }
            if !e.placeholder.is_empty() {
                line.push_str(&format!(" placeholder=\"{}\"", e.placeholder));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 关键词匹配：描述与元素 text/placeholder 互相包含即命中，否则取该类型的第一个元素
pub struct KeywordElementLocator {
    session: Arc<BrowserSession>,
}

impl KeywordElementLocator {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }

    fn find(elements: &[PageElement], description: &str, element_type: &str) -> Option<String> {
        let needle = description.to_lowercase();
        let typed: Vec<&PageElement> = elements.iter().filter(|e| e.matches_type(element_type)).collect();
        let hit = typed.iter().find(|e| {
            [&e.text, &e.placeholder].iter().any(|field| {
                let field = field.to_lowercase();
                !field.is_empty() && (needle.contains(&field) || field.contains(&needle))
            })
        });
        hit.or_else(|| typed.first()).map(|e| e.selector.clone())
    }
}

#[async_trait]
impl ElementLocator for KeywordElementLocator {
    async fn locate(&self, description: &str, element_type: &str) -> Option<String> {
        let elements = self.session.elements();
        let found = Self::find(&elements, description, element_type);
        match &found {
            Some(selector) => tracing::info!(selector = %selector, description, "Found element by keyword"),
            None => tracing::warn!(description, "Could not find element by keyword"),
        }
        found
    }
}

/// 由 oracle 从页面元素中挑选目标
pub struct LlmElementLocator {
    llm: Arc<dyn LlmClient>,
    session: Arc<BrowserSession>,
}

impl LlmElementLocator {
    pub fn new(llm: Arc<dyn LlmClient>, session: Arc<BrowserSession>) -> Self {
        Self { llm, session }
    }

    /// 解析 oracle 回复：JSON selector → 选择器模式（需在候选中）→ 元素序号
    pub fn parse_response(response: &str, elements: &[PageElement]) -> Option<String> {
        let body = strip_fences(response.trim());
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body.trim()) {
            let selector = value
                .get("selector")
                .or_else(|| value.get("css_selector"))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty());
            if let Some(s) = selector {
                return Some(s.to_string());
            }
        }

        let patterns = [r"#[\w-]+", r"\.[\w-]+", r"input\[[^\]]+\]", r"button[^\s]*"];
        for pattern in patterns {
            let Ok(re) = Regex::new(pattern) else { continue };
            if let Some(m) = re.find(&body) {
                let selector = m.as_str();
                if elements
                    .iter()
                    .any(|e| e.selector == selector || e.selector.contains(selector))
                {
                    return Some(selector.to_string());
                }
            }
        }

        let number = Regex::new(r"(\d+)").ok()?;
        let index: usize = number.captures(&body)?.get(1)?.as_str().parse().ok()?;
        index
            .checked_sub(1)
            .and_then(|i| elements.get(i))
            .map(|e| e.selector.clone())
    }
}

#[async_trait]
impl ElementLocator for LlmElementLocator {
    async fn locate(&self, description: &str, element_type: &str) -> Option<String> {
        let elements = self.session.elements();
        if elements.is_empty() {
            tracing::warn!("No interactive elements found on page");
            return None;
        }
        let pool = candidates(&elements, element_type);
        let prompt = element_finding_prompt(description, element_type, &format_elements(&pool));
        let params = SamplingParams::with_temperature(0.1);
        match self.llm.generate(&prompt, &params).await {
            Ok(response) => {
                if let Some(selector) = Self::parse_response(&response, &pool) {
                    tracing::info!(selector = %selector, description, "Found element selector");
                    return Some(selector);
                }
                tracing::warn!(description, "Could not parse element selector, falling back to keywords");
            }
            Err(e) => tracing::error!(error = %e, "Error finding element"),
        }
        KeywordElementLocator::find(&elements, description, element_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn page() -> Arc<BrowserSession> {
        let session = BrowserSession::new();
        session.set_elements(vec![
            PageElement::new("#kw", "input").with_kind("text").with_placeholder("搜索"),
            PageElement::new("#su", "button").with_text("百度一下"),
            PageElement::new("a.news", "a").with_text("新闻"),
        ]);
        session
    }

    #[tokio::test]
    async fn test_keyword_locator() {
        let locator = KeywordElementLocator::new(page());
        assert_eq!(locator.locate("点击百度一下", "button").await.as_deref(), Some("#su"));
        assert_eq!(locator.locate("在搜索框输入", "input").await.as_deref(), Some("#kw"));
        assert_eq!(locator.locate("whatever", "link").await.as_deref(), Some("a.news"));
    }

    #[tokio::test]
    async fn test_llm_locator_json() {
        let llm = Arc::new(MockLlmClient::scripted([r##"```json
{"selector": "#su", "reason": "按钮"}
```"##]));
        let locator = LlmElementLocator::new(llm, page());
        assert_eq!(locator.locate("点击搜索", "button").await.as_deref(), Some("#su"));
    }

    #[tokio::test]
    async fn test_llm_locator_falls_back_to_keywords() {
        let llm = Arc::new(MockLlmClient::failing("offline"));
        let locator = LlmElementLocator::new(llm, page());
        assert_eq!(locator.locate("百度一下", "button").await.as_deref(), Some("#su"));
    }

    #[test]
    fn test_parse_response_patterns_and_index() {
        let elements = vec![
            PageElement::new("#kw", "input"),
            PageElement::new("#su", "button"),
        ];
        assert_eq!(
            LlmElementLocator::parse_response("I think #su is right", &elements).as_deref(),
            Some("#su")
        );
        assert_eq!(LlmElementLocator::parse_response("选第 2 个", &elements).as_deref(), Some("#su"));
        assert_eq!(LlmElementLocator::parse_response("none", &elements), None);
    }
}
