use crate::filter::{filter_entries, CaptureFilter};
use crate::{CaptureOutcome, NetworkEntry, StepOutcome};
use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct CaptureReport {
    pub url: String,
    pub final_url: Option<String>,
    pub steps: Vec<StepOutcome>,
    pub total_entries: usize,
    pub entries: Vec<NetworkEntry>,
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

fn clip(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

impl CaptureReport {
    pub fn from_outcome(outcome: &CaptureOutcome, filter: &CaptureFilter) -> Self {
        Self {
            url: outcome.url.clone(),
            final_url: outcome.final_url.clone(),
            steps: outcome.steps.clone(),
            total_entries: outcome.entries.len(),
            entries: filter_entries(&outcome.entries, filter),
            warnings: outcome.warnings.clone(),
            elapsed: outcome.elapsed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plain-text listing; request bodies are clipped to `max_body_chars`.
    pub fn render(&self, max_body_chars: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Capture of {}", self.url);
        if let Some(final_url) = self.final_url.as_deref().filter(|u| *u != self.url) {
            let _ = writeln!(out, "Final URL: {}", final_url);
        }
        let _ = writeln!(out, "Duration: {:.1}s", self.elapsed.as_secs_f64());

        if !self.steps.is_empty() {
            let steps = self
                .steps
                .iter()
                .map(|s| match &s.clicked {
                    Some(selector) => format!("{} (clicked {})", s.name, selector),
                    None => format!("{} (skipped)", s.name),
                })
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "Steps: {}", steps);
        }
        for warning in &self.warnings {
            let _ = writeln!(out, "Note: {}", warning);
        }

        let _ = writeln!(
            out,
            "Requests: {} kept of {} observed",
            self.entries.len(),
            self.total_entries
        );

        for (idx, entry) in self.entries.iter().enumerate() {
            let _ = write!(out, "\n{}. {} {}", idx + 1, entry.method, entry.url);
            if let Some(kind) = &entry.resource_type {
                let _ = write!(out, " [{}]", kind);
            }
            match entry.status {
                Some(status) => {
                    let _ = write!(out, " -> {}", status);
                }
                None => out.push_str(" -> (no response)"),
            }
            if let Some(mime) = &entry.mime_type {
                let _ = write!(out, " {}", mime);
            }
            if let Some(body) = entry.post_data.as_deref().filter(|b| !b.trim().is_empty()) {
                let _ = write!(out, "\n   body: {}", clip(body.trim(), max_body_chars));
            }
        }

        out.trim_end().to_string()
    }
}
