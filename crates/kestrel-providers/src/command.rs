use crate::retry::{truncate_for_error, RetryPolicy};
use crate::{GenerateRequest, GenerateResponse, Provider, ProviderError, DEFAULT_TIMEOUT_SECS};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

fn ansi_escape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("Invalid ANSI escape pattern"))
}

/// Runs a model CLI (for example `ollama run <model>`), writing the prompt to stdin.
pub struct CommandProvider {
    name: String,
    program: String,
    args: Vec<String>,
    model: String,
    timeout: Duration,
}

impl CommandProvider {
    pub fn new(
        name: String,
        program: String,
        args: Vec<String>,
        model: Option<String>,
        timeout_secs: Option<u64>,
    ) -> Self {
        let model = model.unwrap_or_else(|| program.clone());
        Self {
            name,
            program,
            args,
            model,
            timeout: Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS).max(1)),
        }
    }

    /// With no explicit `args`, `command` is split like a shell would.
    pub fn from_command_line(
        name: String,
        command: &str,
        args: &[String],
        model: Option<String>,
        timeout_secs: Option<u64>,
    ) -> Result<Self> {
        let (program, args) = if args.is_empty() {
            let mut parts = shlex::split(command)
                .ok_or_else(|| anyhow!("unbalanced quotes in command '{}'", command))?;
            if parts.is_empty() {
                return Err(anyhow!("command backend '{}' has an empty command", name));
            }
            let program = parts.remove(0);
            (program, parts)
        } else {
            (command.trim().to_string(), args.to_vec())
        };
        Ok(Self::new(name, program, args, model, timeout_secs))
    }

    fn stdin_payload(request: &GenerateRequest) -> String {
        if request.system.trim().is_empty() {
            request.prompt.clone()
        } else {
            format!("{}\n\n{}", request.system.trim(), request.prompt)
        }
    }
}

#[async_trait]
impl Provider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        _retry_policy: Option<&RetryPolicy>,
    ) -> Result<GenerateResponse> {
        let timeout = request.timeout.unwrap_or(self.timeout);
        let started = Instant::now();

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("failed to start '{}': {}", self.program, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = Self::stdin_payload(request);
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    tracing::debug!("Prompt write to backend stdin failed: {}", e);
                }
            });
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    provider = %self.name,
                    timeout_secs = timeout.as_secs(),
                    "Backend command timed out, process killed"
                );
                return Err(ProviderError::Timeout {
                    provider: self.name.clone(),
                    secs: timeout.as_secs(),
                }
                .into());
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Process {
                provider: self.name.clone(),
                code: output.status.code(),
                stderr: truncate_for_error(ansi_escape().replace_all(&stderr, "").trim(), 400),
            }
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let text = ansi_escape().replace_all(&stdout, "").trim().to_string();

        Ok(GenerateResponse {
            text,
            model: self.model.clone(),
            elapsed: started.elapsed(),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(which::which(&self.program).is_ok() || std::path::Path::new(&self.program).is_file())
    }
}
