use crate::retry::{post_json_with_retry, RetryPolicy};
use crate::{GenerateRequest, GenerateResponse, Provider, ProviderError, DEFAULT_TIMEOUT_SECS};
use anyhow::Result;
use async_trait::async_trait;
use kestrel_config::GenerationOptions;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

// Ollama also serves this API under /v1.
const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Any server speaking the `/chat/completions` dialect (llama.cpp, vLLM, LM Studio).
pub struct OpenAICompatibleProvider {
    client: Client,
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    options: GenerationOptions,
    timeout: Duration,
}

impl OpenAICompatibleProvider {
    pub fn new(
        name: String,
        base_url: Option<String>,
        api_key: Option<String>,
        model: Option<String>,
        options: GenerationOptions,
        timeout_secs: Option<u64>,
    ) -> Self {
        Self {
            client: Client::new(),
            name,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.unwrap_or_else(|| "local-model".to_string()),
            options,
            timeout: Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS).max(1)),
        }
    }

    fn build_body(&self, request: &GenerateRequest) -> Value {
        let mut messages = Vec::new();
        if !request.system.trim().is_empty() {
            messages.push(json!({"role": "system", "content": request.system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.options.temperature,
            "top_p": self.options.top_p,
            "max_tokens": self.options.num_predict,
            "stream": false,
        })
    }

    fn parse_body(&self, raw: &str) -> Result<(String, String)> {
        let parsed: ChatResponse =
            serde_json::from_str(raw).map_err(|e| ProviderError::InvalidResponse {
                provider: self.name.clone(),
                detail: e.to_string(),
            })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: self.name.clone(),
                detail: "no choices in response".to_string(),
            })?;
        Ok((
            content.trim().to_string(),
            parsed.model.unwrap_or_else(|| self.model.clone()),
        ))
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        retry_policy: Option<&RetryPolicy>,
    ) -> Result<GenerateResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(request);
        let policy = retry_policy.cloned().unwrap_or_default();

        let started = Instant::now();
        let raw = post_json_with_retry(
            &self.client,
            &self.name,
            &url,
            self.api_key.as_deref(),
            &body,
            request.timeout.unwrap_or(self.timeout),
            &policy,
        )
        .await?;
        let (text, model) = self.parse_body(&raw)?;

        Ok(GenerateResponse {
            text,
            model,
            elapsed: started.elapsed(),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        let mut request = self.client.get(&url).timeout(Duration::from_secs(10));
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        let response = request.send().await?;
        Ok(response.status().is_success())
    }
}
