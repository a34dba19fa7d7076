//! Kestrel Capture
//!
//! Headless browser network capture: navigate, replay a configured click
//! sequence, record requests and responses, filter them down to API calls.

pub mod chromium;
mod filter;
mod report;

pub use chromium::{find_chromium, ChromiumEngine};
pub use filter::{assemble_entries, filter_entries, CaptureEvent, CaptureFilter, DEFAULT_IGNORED_HOSTS};
pub use report::CaptureReport;

use anyhow::Result;
use async_trait::async_trait;
use kestrel_config::{CaptureConfig, CaptureStepConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no Chromium browser available: {0}")]
    BrowserUnavailable(String),

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("capture limiter closed")]
    LimiterClosed,
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub url: String,
    pub steps: Vec<CaptureStepConfig>,
    pub navigation_timeout: Duration,
    pub settle: Duration,
}

impl CaptureRequest {
    pub fn from_config(url: &str, config: &CaptureConfig) -> Self {
        Self {
            url: url.to_string(),
            steps: config.steps.clone(),
            navigation_timeout: Duration::from_secs(config.navigation_timeout_secs.max(1)),
            settle: Duration::from_millis(config.settle_ms),
        }
    }
}

/// One observed request, joined with its response when one arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub method: String,
    pub url: String,
    pub resource_type: Option<String>,
    pub status: Option<u16>,
    pub mime_type: Option<String>,
    pub post_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    /// Selector that was clicked; `None` when no selector matched.
    pub clicked: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureOutcome {
    pub url: String,
    pub final_url: Option<String>,
    pub steps: Vec<StepOutcome>,
    /// Every entry in arrival order, unfiltered.
    pub entries: Vec<NetworkEntry>,
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

#[async_trait]
pub trait CaptureEngine: Send + Sync {
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome>;
    fn is_available(&self) -> bool;
}

/// Stand-in used when capture is disabled or no browser was found.
pub struct NoopEngine {
    reason: String,
}

impl NoopEngine {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CaptureEngine for NoopEngine {
    async fn capture(&self, _request: &CaptureRequest) -> Result<CaptureOutcome> {
        Err(CaptureError::BrowserUnavailable(self.reason.clone()).into())
    }

    fn is_available(&self) -> bool {
        false
    }
}

pub fn build_engine(config: &CaptureConfig) -> Arc<dyn CaptureEngine> {
    if !config.enabled {
        return Arc::new(NoopEngine::new("capture is disabled in the configuration"));
    }
    match find_chromium(config.chromium_path.as_deref()) {
        Some(path) => {
            tracing::info!(path = %path.display(), "Capture browser found");
            Arc::new(ChromiumEngine::new(path))
        }
        None => {
            tracing::warn!("No Chromium binary found; capture requests will be refused");
            Arc::new(NoopEngine::new(
                "install Chromium or set capture.chromium_path / KESTREL_CHROMIUM_PATH",
            ))
        }
    }
}

/// Bounds how many browser jobs run at once.
#[derive(Clone)]
pub struct CaptureLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl CaptureLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// `None` when every slot is taken.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| CaptureError::LimiterClosed.into())
    }

    pub fn running(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
