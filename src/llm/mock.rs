//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序回放预设响应；脚本耗尽后重复最后一条。未设置脚本时回显一个 stop 决策。
//! 可按提示词关键词路由响应，便于同一个客户端同时驱动规划、决策与反思。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::llm::{LlmClient, SamplingParams};

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<Vec<String>>,
    /// (提示词关键词, 响应)，优先于顺序脚本
    routes: Mutex<Vec<(String, String)>>,
    cursor: AtomicUsize,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    fail_with: Mutex<Option<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以顺序脚本构造
    pub fn scripted<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::default();
        *client.script.lock().unwrap_or_else(|e| e.into_inner()) =
            responses.into_iter().map(Into::into).collect();
        client
    }

    /// 提示词包含 `keyword` 时返回 `response`
    pub fn with_route(self, keyword: impl Into<String>, response: impl Into<String>) -> Self {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((keyword.into(), response.into()));
        self
    }

    /// 每次调用都返回 LLM 错误
    pub fn failing(message: impl Into<String>) -> Self {
        let client = Self::default();
        *client.fail_with.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
        client
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 收到过的提示词
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, prompt: &str, _params: &SamplingParams) -> Result<String, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());

        if let Some(msg) = self.fail_with.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(AgentError::Llm(msg));
        }

        {
            let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((_, resp)) = routes.iter().find(|(k, _)| prompt.contains(k.as_str())) {
                return Ok(resp.clone());
            }
        }

        let script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        if script.is_empty() {
            return Ok(r#"{"should_continue": false, "reasoning": "mock: no script"}"#.to_string());
        }
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst).min(script.len() - 1);
        Ok(script[idx].clone())
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_repeats_last() {
        let client = MockLlmClient::scripted(["a", "b"]);
        let p = SamplingParams::default();
        assert_eq!(client.generate("x", &p).await.unwrap(), "a");
        assert_eq!(client.generate("x", &p).await.unwrap(), "b");
        assert_eq!(client.generate("x", &p).await.unwrap(), "b");
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_route_wins() {
        let client = MockLlmClient::scripted(["seq"]).with_route("反思", "routed");
        let p = SamplingParams::default();
        assert_eq!(client.generate("请反思", &p).await.unwrap(), "routed");
        assert_eq!(client.generate("other", &p).await.unwrap(), "seq");
    }
}
