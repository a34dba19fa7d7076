//! Kestrel Providers
//!
//! Local LLM backends: Ollama over HTTP, OpenAI-compatible servers, and
//! a model CLI driven through stdin.

mod command;
mod ollama;
mod openai;
mod retry;

pub use command::CommandProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAICompatibleProvider;
pub use retry::RetryPolicy;

use anyhow::Result;
use async_trait::async_trait;
use kestrel_config::{BackendConfig, ProviderConfig, ProviderKind};
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("backend '{provider}' timed out after {secs}s")]
    Timeout { provider: String, secs: u64 },

    #[error("backend '{provider}' returned HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("backend '{provider}' exited with status {code:?}: {stderr}")]
    Process {
        provider: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("backend '{provider}' sent an unusable response: {detail}")]
    InvalidResponse { provider: String, detail: String },

    #[error("backend '{0}' is not configured")]
    UnknownProvider(String),
}

/// True when the error chain carries a backend timeout.
pub fn is_timeout(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ProviderError>(),
        Some(ProviderError::Timeout { .. })
    )
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub system: String,
    pub prompt: String,
    /// Overrides the provider's configured timeout.
    pub timeout: Option<Duration>,
}

impl GenerateRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub text: String,
    pub model: String,
    pub elapsed: Duration,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    async fn generate(
        &self,
        request: &GenerateRequest,
        retry_policy: Option<&RetryPolicy>,
    ) -> Result<GenerateResponse>;
    async fn health_check(&self) -> Result<bool>;
}

pub fn build_provider(config: &ProviderConfig) -> Result<Box<dyn Provider>> {
    let provider: Box<dyn Provider> = match config.kind {
        ProviderKind::Ollama => Box::new(OllamaProvider::new(
            config.name.clone(),
            config.base_url.clone(),
            config.model.clone(),
            config.options.clone(),
            config.timeout_secs,
        )),
        ProviderKind::Openai => Box::new(OpenAICompatibleProvider::new(
            config.name.clone(),
            config.base_url.clone(),
            config.api_key.clone(),
            config.model.clone(),
            config.options.clone(),
            config.timeout_secs,
        )),
        ProviderKind::Command => {
            let command = config.command.as_deref().ok_or_else(|| {
                anyhow::anyhow!("command backend '{}' has no command", config.name)
            })?;
            Box::new(CommandProvider::from_command_line(
                config.name.clone(),
                command,
                &config.args,
                config.model.clone(),
                config.timeout_secs,
            )?)
        }
    };
    Ok(provider)
}

pub struct ProviderRouter {
    providers: Vec<Box<dyn Provider>>,
    default_provider: String,
    retry_policy: RetryPolicy,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            default_provider: String::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let mut router = Self::new();
        for provider in &config.providers {
            router.add_provider(build_provider(provider)?);
        }
        if !config.default_provider.trim().is_empty() {
            router.set_default(&config.default_provider);
        }
        if let Some(retry) = &config.retry {
            router.retry_policy = RetryPolicy::from(retry);
        }
        Ok(router)
    }

    pub fn add_provider(&mut self, provider: Box<dyn Provider>) {
        if self.default_provider.is_empty() {
            self.default_provider = provider.name().to_string();
        }
        self.providers.push(provider);
    }

    pub fn set_default(&mut self, name: &str) {
        self.default_provider = name.to_string();
    }

    pub fn default_name(&self) -> &str {
        &self.default_provider
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn get_provider(&self, name: Option<&str>) -> Option<&dyn Provider> {
        let target = name.unwrap_or(&self.default_provider);
        self.providers
            .iter()
            .find(|p| p.name() == target)
            .map(|p| p.as_ref())
    }

    pub fn providers(&self) -> impl Iterator<Item = &dyn Provider> {
        self.providers.iter().map(|p| p.as_ref())
    }

    pub async fn generate(
        &self,
        request: &GenerateRequest,
        provider: Option<&str>,
    ) -> Result<GenerateResponse> {
        let target = provider.unwrap_or(&self.default_provider);
        let p = self
            .get_provider(Some(target))
            .ok_or_else(|| ProviderError::UnknownProvider(target.to_string()))?;
        p.generate(request, Some(&self.retry_policy)).await
    }
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_config::GenerationOptions;

    struct Echo(&'static str);

    #[async_trait]
    impl Provider for Echo {
        fn name(&self) -> &str {
            self.0
        }

        fn model(&self) -> &str {
            "echo"
        }

        async fn generate(
            &self,
            request: &GenerateRequest,
            _retry_policy: Option<&RetryPolicy>,
        ) -> Result<GenerateResponse> {
            Ok(GenerateResponse {
                text: format!("{}:{}", self.0, request.prompt),
                model: "echo".to_string(),
                elapsed: Duration::ZERO,
            })
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn router_uses_first_provider_as_default() {
        let mut router = ProviderRouter::new();
        router.add_provider(Box::new(Echo("a")));
        router.add_provider(Box::new(Echo("b")));

        let out = router
            .generate(&GenerateRequest::new("", "hi"), None)
            .await
            .expect("generate");
        assert_eq!(out.text, "a:hi");

        let out = router
            .generate(&GenerateRequest::new("", "hi"), Some("b"))
            .await
            .expect("generate");
        assert_eq!(out.text, "b:hi");
    }

    #[tokio::test]
    async fn router_reports_unknown_provider() {
        let router = ProviderRouter::new();
        let err = router
            .generate(&GenerateRequest::new("", "hi"), Some("missing"))
            .await
            .expect_err("should fail");
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::UnknownProvider(name)) if name == "missing"
        ));
    }

    #[test]
    fn from_config_builds_each_kind() {
        let config = BackendConfig {
            default_provider: "cli".to_string(),
            providers: vec![
                ProviderConfig {
                    name: "local".to_string(),
                    kind: ProviderKind::Ollama,
                    base_url: None,
                    model: Some("tiny".to_string()),
                    api_key: None,
                    command: None,
                    args: Vec::new(),
                    timeout_secs: None,
                    options: GenerationOptions::default(),
                },
                ProviderConfig {
                    name: "cli".to_string(),
                    kind: ProviderKind::Command,
                    base_url: None,
                    model: None,
                    api_key: None,
                    command: Some("ollama run tiny".to_string()),
                    args: Vec::new(),
                    timeout_secs: Some(30),
                    options: GenerationOptions::default(),
                },
            ],
            retry: None,
        };

        let router = ProviderRouter::from_config(&config).expect("router");
        assert_eq!(router.default_name(), "cli");
        assert_eq!(router.providers().count(), 2);
        assert_eq!(
            router.get_provider(Some("local")).map(|p| p.model()),
            Some("tiny")
        );
    }

    #[test]
    fn timeout_errors_are_detectable_through_anyhow() {
        let err: anyhow::Error = ProviderError::Timeout {
            provider: "local".to_string(),
            secs: 5,
        }
        .into();
        assert!(is_timeout(&err));
        assert!(!is_timeout(&anyhow::anyhow!("other")));
    }
}
