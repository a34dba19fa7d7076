//! Kestrel Router
//!
//! Keyword routing of chat text to a fixed set of prompt templates

mod prompts;

pub use prompts::PromptTemplates;

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Duration;

const CAPTURE_KEYWORDS: &[&str] = &["capture", "traffic", "network", "requests", "flow", "har"];
const ANALYSIS_KEYWORDS: &[&str] = &[
    "analyze", "analyse", "website", "site", "api", "scrape", "extract",
];
const INTRODUCTION_PHRASES: &[&str] = &[
    "who are you",
    "introduce yourself",
    "introduce",
    "what are you",
    "your name",
    "about you",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    Capture { url: String },
    WebsiteAnalysis { url: Option<String> },
    Introduction,
    General,
}

impl Intent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Capture { .. } => "capture",
            Self::WebsiteAnalysis { .. } => "website_analysis",
            Self::Introduction => "introduction",
            Self::General => "general",
        }
    }

    /// Backend budget for the generation this intent triggers.
    pub fn generation_timeout(&self) -> Duration {
        match self {
            Self::General | Self::Introduction => Duration::from_secs(180),
            Self::Capture { .. } | Self::WebsiteAnalysis { .. } => Duration::from_secs(300),
        }
    }
}

struct Matchers {
    url: Regex,
    capture: Regex,
    analysis: Regex,
    introduction: Regex,
}

fn word_alternation(words: &[&str]) -> Regex {
    let alternation = words
        .iter()
        .map(|w| regex::escape(w).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).expect("Invalid keyword pattern")
}

fn matchers() -> &'static Matchers {
    static MATCHERS: OnceLock<Matchers> = OnceLock::new();
    MATCHERS.get_or_init(|| Matchers {
        url: Regex::new(r#"(?i)\bhttps?://[^\s<>"'`]+"#).expect("Invalid URL pattern"),
        capture: word_alternation(CAPTURE_KEYWORDS),
        analysis: word_alternation(ANALYSIS_KEYWORDS),
        introduction: word_alternation(INTRODUCTION_PHRASES),
    })
}

/// URLs in order of appearance, trailing punctuation removed.
pub fn extract_urls(text: &str) -> Vec<String> {
    matchers()
        .url
        .find_iter(text)
        .filter_map(|m| {
            let candidate = trim_url_tail(m.as_str());
            let parsed = url::Url::parse(candidate).ok()?;
            parsed.host_str()?;
            Some(candidate.to_string())
        })
        .collect()
}

fn trim_url_tail(raw: &str) -> &str {
    let mut end = raw.len();
    loop {
        let trimmed = &raw[..end];
        let Some(last) = trimmed.chars().last() else {
            return trimmed;
        };
        let drop = match last {
            '.' | ',' | ';' | ':' | '!' | '?' | '*' | '_' => true,
            ')' => trimmed.matches('(').count() < trimmed.matches(')').count(),
            ']' => trimmed.matches('[').count() < trimmed.matches(']').count(),
            _ => false,
        };
        if !drop {
            return trimmed;
        }
        end -= last.len_utf8();
    }
}

pub fn detect_intent(text: &str) -> Intent {
    let m = matchers();
    let url = extract_urls(text).into_iter().next();

    if let Some(url) = &url {
        if m.capture.is_match(text) {
            return Intent::Capture { url: url.clone() };
        }
    }

    if url.is_some() || m.analysis.is_match(text) {
        return Intent::WebsiteAnalysis { url };
    }

    if m.introduction.is_match(text) {
        return Intent::Introduction;
    }

    Intent::General
}
