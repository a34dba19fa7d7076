use crate::retry::{post_json_with_retry, RetryPolicy};
use crate::{GenerateRequest, GenerateResponse, Provider, ProviderError, DEFAULT_TIMEOUT_SECS};
use anyhow::Result;
use async_trait::async_trait;
use kestrel_config::GenerationOptions;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.1";

/// Ollama's native `/api/generate` endpoint, non-streaming.
pub struct OllamaProvider {
    client: Client,
    name: String,
    base_url: String,
    model: String,
    options: GenerationOptions,
    timeout: Duration,
}

impl OllamaProvider {
    pub fn new(
        name: String,
        base_url: Option<String>,
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
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            options,
            timeout: Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS).max(1)),
        }
    }

    fn build_body(&self, request: &GenerateRequest) -> Value {
        let mut options = json!({
            "temperature": self.options.temperature,
            "num_predict": self.options.num_predict,
            "top_p": self.options.top_p,
            "repeat_penalty": self.options.repeat_penalty,
        });
        if let Some(threads) = self.options.num_thread {
            options["num_thread"] = json!(threads);
        }

        let mut body = json!({
            "model": self.model,
            "prompt": request.prompt,
            "stream": false,
            "options": options,
        });
        if !request.system.trim().is_empty() {
            body["system"] = json!(request.system);
        }
        body
    }

    fn parse_body(&self, raw: &str) -> Result<(String, String)> {
        let value: Value = serde_json::from_str(raw).map_err(|e| ProviderError::InvalidResponse {
            provider: self.name.clone(),
            detail: e.to_string(),
        })?;

        if let Some(error) = value.get("error").and_then(|v| v.as_str()) {
            return Err(ProviderError::InvalidResponse {
                provider: self.name.clone(),
                detail: error.to_string(),
            }
            .into());
        }

        let text = value
            .get("response")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: self.name.clone(),
                detail: "missing 'response' field".to_string(),
            })?
            .trim()
            .to_string();
        let model = value
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.model)
            .to_string();
        Ok((text, model))
    }
}

#[async_trait]
impl Provider for OllamaProvider {
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
        let url = format!("{}/api/generate", self.base_url);
        let body = self.build_body(request);
        let policy = retry_policy.cloned().unwrap_or_default();
        let timeout = request.timeout.unwrap_or(self.timeout);

        let started = Instant::now();
        let raw = post_json_with_retry(
            &self.client,
            &self.name,
            &url,
            None,
            &body,
            timeout,
            &policy,
        )
        .await?;
        let (text, model) = self.parse_body(&raw)?;

        tracing::debug!(
            provider = %self.name,
            model = %model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ollama generation finished"
        );

        Ok(GenerateResponse {
            text,
            model,
            elapsed: started.elapsed(),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn provider(base_url: Option<String>) -> OllamaProvider {
        OllamaProvider::new(
            "local".to_string(),
            base_url,
            Some("tiny".to_string()),
            GenerationOptions {
                num_thread: Some(4),
                ..GenerationOptions::default()
            },
            Some(5),
        )
    }

    #[test]
    fn body_is_non_streaming_with_sampling_options() {
        let body = provider(None).build_body(&GenerateRequest::new("be brief", "hello"));
        assert_eq!(body["stream"], json!(false));
        assert_eq!(body["model"], json!("tiny"));
        assert_eq!(body["system"], json!("be brief"));
        assert_eq!(body["options"]["num_predict"], json!(1024));
        assert_eq!(body["options"]["num_thread"], json!(4));
    }

    #[test]
    fn body_omits_blank_system_prompt() {
        let body = provider(None).build_body(&GenerateRequest::new("  ", "hello"));
        assert!(body.get("system").is_none());
    }

    #[test]
    fn parse_body_surfaces_server_error() {
        let err = provider(None)
            .parse_body(r#"{"error":"model 'tiny' not found"}"#)
            .expect_err("should fail");
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn generate_posts_to_api_generate() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/generate")
                    .json_body_partial(r#"{"model":"tiny","stream":false}"#);
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({"model": "tiny", "response": "  hi there \n", "done": true}));
            })
            .await;

        let response = provider(Some(server.base_url()))
            .generate(&GenerateRequest::new("sys", "hello"), None)
            .await
            .expect("generate");

        mock.assert_async().await;
        assert_eq!(response.text, "hi there");
        assert_eq!(response.model, "tiny");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(404).body("no such model");
            })
            .await;

        let err = provider(Some(server.base_url()))
            .generate(&GenerateRequest::new("", "hello"), None)
            .await
            .expect_err("should fail");

        mock.assert_hits_async(1).await;
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::Http { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn unavailable_backend_is_retried_inside_the_window() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(503)
                    .header("retry-after-ms", "50")
                    .body("loading model");
            })
            .await;
        let policy = RetryPolicy {
            window_secs: 1,
            ..RetryPolicy::default()
        };

        let err = provider(Some(server.base_url()))
            .generate(&GenerateRequest::new("", "hello"), Some(&policy))
            .await
            .expect_err("should give up");

        assert!(mock.hits_async().await > 1);
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::Http { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn slow_backend_surfaces_as_timeout() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200)
                    .delay(Duration::from_secs(2))
                    .json_body(json!({"model": "tiny", "response": "late", "done": true}));
            })
            .await;

        let request =
            GenerateRequest::new("", "hello").with_timeout(Duration::from_millis(200));
        let err = provider(Some(server.base_url()))
            .generate(&request, None)
            .await
            .expect_err("should time out");

        assert!(crate::is_timeout(&err));
    }

    #[tokio::test]
    async fn health_check_reads_tags_endpoint() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/tags");
                then.status(200).json_body(json!({"models": []}));
            })
            .await;

        assert!(provider(Some(server.base_url()))
            .health_check()
            .await
            .expect("health"));
    }
}
