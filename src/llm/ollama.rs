//! Ollama 客户端
//!
//! POST {base_url}/api/generate（非流式），options.temperature 取自 SamplingParams；
//! check_connection / list_models 走 GET /api/tags。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::core::AgentError;
use crate::llm::{LlmClient, SamplingParams};

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    default_temperature: f64,
    usage: crate::llm::TokenUsage,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            default_temperature: 0.7,
            usage: crate::llm::TokenUsage::new(),
        })
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.default_temperature = temperature;
        self
    }

    /// 服务可达性检查
    pub async fn check_connection(&self) -> bool {
        match self.http.get(format!("{}/api/tags", self.base_url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!(error = %e, "Ollama connection check failed");
                false
            }
        }
    }

    pub async fn list_models(&self) -> Result<Vec<String>, AgentError> {
        let resp = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let tags: TagsResponse = resp.json().await.map_err(map_reqwest_error)?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

fn map_reqwest_error(e: reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::Timeout(format!("LLM request timed out: {e}"))
    } else if e.is_connect() || e.is_request() {
        AgentError::Network(format!("connection failed: {e}"))
    } else if e.is_decode() {
        AgentError::JsonParse(e.to_string())
    } else {
        AgentError::Llm(e.to_string())
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String, AgentError> {
        let mut body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": params.temperature.unwrap_or(self.default_temperature),
            },
        });
        if let Some(max) = params.max_tokens {
            body["options"]["num_predict"] = json!(max);
        }
        if let Some(system) = &params.system {
            body["system"] = json!(system);
        }

        tracing::debug!(model = %self.model, prompt_len = prompt.len(), "ollama generate");
        let resp = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::Llm(format!("ollama returned {status}: {text}")));
        }

        let parsed: GenerateResponse = resp.json().await.map_err(map_reqwest_error)?;
        self.usage.add(
            parsed.prompt_eval_count.unwrap_or(0),
            parsed.eval_count.unwrap_or(0),
        );
        Ok(parsed.response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
