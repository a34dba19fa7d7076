//! Capture engine backed by a headless Chromium via chromiumoxide.

use crate::filter::{assemble_entries, CaptureEvent};
use crate::{CaptureEngine, CaptureError, CaptureOutcome, CaptureRequest, StepOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventRequestWillBeSent, EventResponseReceived, GetRequestPostDataParams,
    PostDataEntry, ResourceType,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use kestrel_config::{expand_user_path, CaptureStepConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;

pub const CHROMIUM_ENV_VAR: &str = "KESTREL_CHROMIUM_PATH";

const PATH_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];

static NEXT_PROFILE: AtomicU64 = AtomicU64::new(1);

/// Resolves the browser binary: explicit config, then the environment, then PATH.
pub fn find_chromium(configured: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = configured.map(str::trim).filter(|p| !p.is_empty()) {
        let path = expand_user_path(path);
        if path.exists() {
            return Some(path);
        }
        tracing::warn!(path = %path.display(), "Configured chromium_path does not exist");
    }

    if let Ok(p) = std::env::var(CHROMIUM_ENV_VAR) {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    for name in PATH_CANDIDATES {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    if cfg!(target_os = "macos") {
        let common = PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

fn resource_type_name(kind: &ResourceType) -> String {
    format!("{:?}", kind).to_ascii_lowercase()
}

/// Joins the base64 chunks Chrome attaches to a request. Returns `None`
/// when no chunk carried bytes.
fn decode_post_data(entries: &[PostDataEntry]) -> Option<String> {
    let mut body = Vec::new();
    let mut any = false;
    for entry in entries {
        let Some(bytes) = &entry.bytes else {
            continue;
        };
        let encoded: &str = bytes.as_ref();
        match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(decoded) => {
                body.extend_from_slice(&decoded);
                any = true;
            }
            Err(e) => tracing::debug!("Undecodable post data chunk: {}", e),
        }
    }
    any.then(|| String::from_utf8_lossy(&body).into_owned())
}

fn request_event(event: &EventRequestWillBeSent) -> CaptureEvent {
    let post_data = event
        .request
        .post_data_entries
        .as_deref()
        .and_then(decode_post_data);
    CaptureEvent::Request {
        id: event.request_id.inner().clone(),
        method: event.request.method.clone(),
        url: event.request.url.clone(),
        resource_type: event.r#type.as_ref().map(resource_type_name),
        post_data,
    }
}

/// Large bodies are not inlined in the event; ask the browser for them.
async fn fetch_post_data(page: &Page, event: &EventRequestWillBeSent) -> Option<String> {
    match page
        .execute(GetRequestPostDataParams::new(event.request_id.clone()))
        .await
    {
        Ok(response) => Some(response.result.post_data),
        Err(e) => {
            tracing::debug!(url = %event.request.url, "Post data unavailable: {}", e);
            None
        }
    }
}

fn response_event(event: &EventResponseReceived) -> CaptureEvent {
    CaptureEvent::Response {
        id: event.request_id.inner().clone(),
        status: u16::try_from(event.response.status).unwrap_or(0),
        mime_type: event.response.mime_type.clone(),
        resource_type: Some(resource_type_name(&event.r#type)),
    }
}

/// Launches a fresh browser per capture so concurrent jobs never share a profile.
pub struct ChromiumEngine {
    executable: PathBuf,
}

impl ChromiumEngine {
    pub fn new(executable: PathBuf) -> Self {
        Self { executable }
    }

    async fn run_session(
        &self,
        browser: &Browser,
        request: &CaptureRequest,
    ) -> Result<CaptureOutcome> {
        let started = Instant::now();
        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to create new page")?;
        page.execute(EnableParams::default())
            .await
            .context("failed to enable network events")?;

        let mut requests = page.event_listener::<EventRequestWillBeSent>().await?;
        let mut responses = page.event_listener::<EventResponseReceived>().await?;

        // Both listeners feed one channel so entries keep arrival order.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request_tx = tx.clone();
        let body_page = page.clone();
        let request_task = tokio::spawn(async move {
            while let Some(event) = requests.next().await {
                let mut captured = request_event(&event);
                if let CaptureEvent::Request { post_data, .. } = &mut captured {
                    if post_data.is_none() && event.request.has_post_data == Some(true) {
                        *post_data = fetch_post_data(&body_page, &event).await;
                    }
                }
                if request_tx.send(captured).is_err() {
                    break;
                }
            }
        });
        let response_task = tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                if tx.send(response_event(&event)).is_err() {
                    break;
                }
            }
        });

        let mut warnings = Vec::new();
        let navigation =
            tokio::time::timeout(request.navigation_timeout, page.goto(request.url.as_str())).await;
        match navigation {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                request_task.abort();
                response_task.abort();
                let _ = page.close().await;
                return Err(CaptureError::Navigation {
                    url: request.url.clone(),
                    reason: e.to_string(),
                }
                .into());
            }
            Err(_) => {
                tracing::warn!(
                    url = %request.url,
                    timeout_secs = request.navigation_timeout.as_secs(),
                    "Navigation timed out, continuing with partial traffic"
                );
                warnings.push(format!(
                    "page load did not finish within {}s",
                    request.navigation_timeout.as_secs()
                ));
            }
        }
        tokio::time::sleep(request.settle).await;

        let mut steps = Vec::with_capacity(request.steps.len());
        for step in &request.steps {
            let outcome = run_step(&page, step).await;
            if outcome.clicked.is_some() {
                tokio::time::sleep(request.settle).await;
            }
            steps.push(outcome);
        }

        let final_url = page.url().await.ok().flatten();

        request_task.abort();
        response_task.abort();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let _ = page.close().await;

        let entries = assemble_entries(events);
        tracing::info!(
            url = %request.url,
            entries = entries.len(),
            clicked = steps.iter().filter(|s| s.clicked.is_some()).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Capture finished"
        );

        Ok(CaptureOutcome {
            url: request.url.clone(),
            final_url,
            steps,
            entries,
            warnings,
            elapsed: started.elapsed(),
        })
    }
}

/// Clicks the first selector present on the page. Falls back to a DOM
/// `click()` when the element cannot be clicked by coordinates.
async fn run_step(page: &Page, step: &CaptureStepConfig) -> StepOutcome {
    for selector in &step.selectors {
        let element = match page.find_element(selector.as_str()).await {
            Ok(element) => element,
            Err(_) => continue,
        };

        match element.click().await {
            Ok(_) => {
                tracing::debug!(step = %step.name, selector = %selector, "Clicked");
                return StepOutcome {
                    name: step.name.clone(),
                    clicked: Some(selector.clone()),
                };
            }
            Err(e) => {
                tracing::debug!(step = %step.name, selector = %selector, "Pointer click failed: {}", e);
                let literal = serde_json::to_string(selector).unwrap_or_default();
                let script = format!(
                    "(() => {{ const el = document.querySelector({}); if (!el) return false; el.click(); return true; }})()",
                    literal
                );
                let clicked = match page.evaluate(script.as_str()).await {
                    Ok(result) => result.into_value::<bool>().unwrap_or(false),
                    Err(_) => false,
                };
                if clicked {
                    return StepOutcome {
                        name: step.name.clone(),
                        clicked: Some(selector.clone()),
                    };
                }
            }
        }
    }

    tracing::debug!(step = %step.name, "No selector matched; step skipped");
    StepOutcome {
        name: step.name.clone(),
        clicked: None,
    }
}

#[async_trait]
impl CaptureEngine for ChromiumEngine {
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome> {
        let profile_dir = std::env::temp_dir().join(format!(
            "kestrel-capture-{}-{}",
            std::process::id(),
            NEXT_PROFILE.fetch_add(1, Ordering::Relaxed)
        ));

        let config = BrowserConfig::builder()
            .chrome_executable(&self.executable)
            .user_data_dir(&profile_dir)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--mute-audio")
            .build()
            .map_err(|e| CaptureError::Launch(format!("failed to build browser config: {e}")))?;

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CaptureError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::trace!("CDP handler: {}", e);
                }
            }
        });

        let result = self.run_session(&browser, request).await;

        if let Err(e) = browser.close().await {
            tracing::debug!("Browser close failed: {}", e);
        }
        let _ = browser.wait().await;
        handler_task.abort();
        let _ = std::fs::remove_dir_all(&profile_dir);

        result
    }

    fn is_available(&self) -> bool {
        self.executable.exists()
    }
}
