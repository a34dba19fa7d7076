//! Text the bot sends back that is not model output.

use kestrel_providers::is_timeout;
use kestrel_storage::{CacheStats, CaptureRecord, JournalStats};
use std::time::Duration;

pub const ERROR_PREVIEW_CHARS: usize = 400;
pub const TIMEOUT_NOTICE: &str = "⚠️ Response timeout. Try a simpler query.";

fn clip_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn with_footer(text: &str, elapsed: Duration, model: &str, cached: bool) -> String {
    format!(
        "{}\n\n_Response time: {:.2}s • Model: {}{}_",
        text.trim_end(),
        elapsed.as_secs_f64(),
        model,
        if cached { " (cached)" } else { "" }
    )
}

/// What the user sees when handling fails.
pub fn error_text(err: &anyhow::Error) -> String {
    if is_timeout(err) {
        return TIMEOUT_NOTICE.to_string();
    }
    let detail = format!("{:#}", err);
    format!("Error: {}", clip_chars(&detail, ERROR_PREVIEW_CHARS))
}

pub fn cache_text(stats: Option<CacheStats>, ttl_secs: u64) -> String {
    let Some(stats) = stats else {
        return "Response cache is disabled.".to_string();
    };
    let lookups = stats.hits + stats.misses;
    let hit_rate = if lookups == 0 {
        0.0
    } else {
        stats.hits as f64 * 100.0 / lookups as f64
    };
    format!(
        "*Response cache*\nEntries: {}\nHits: {} / Misses: {} ({:.0}% hit rate)\nTTL: {}s\n\nSend /cache clear to empty it.",
        stats.entries, stats.hits, stats.misses, hit_rate, ttl_secs
    )
}

pub fn knowledge_text(files: &[String]) -> String {
    if files.is_empty() {
        return "The knowledge base is empty. Upload .py .txt .md .json or .js files to add some."
            .to_string();
    }
    let mut out = format!("*Knowledge base* ({} files)\n", files.len());
    for name in files {
        out.push_str("• `");
        out.push_str(name);
        out.push_str("`\n");
    }
    out.trim_end().to_string()
}

pub fn stats_text(stats: &JournalStats, running_captures: usize, capture_slots: usize) -> String {
    format!(
        "*Usage*\nAnswered: {} ({} from cache)\nAverage backend time: {:.2}s\nCaptures: {}\nBrowser jobs running: {}/{}",
        stats.exchanges,
        stats.cached_exchanges,
        stats.avg_elapsed_ms as f64 / 1000.0,
        stats.captures,
        running_captures,
        capture_slots
    )
}

pub fn history_text(records: &[CaptureRecord]) -> String {
    if records.is_empty() {
        return "No captures yet. Try /capture <url>.".to_string();
    }
    let mut out = String::from("*Recent captures*\n");
    for record in records {
        out.push_str(&format!(
            "\n{} {}\n  {} of {} requests kept, {:.1}s",
            record.created_at,
            record.url,
            record.kept_entries,
            record.total_entries,
            record.elapsed_ms as f64 / 1000.0
        ));
        if let Some(final_url) = record.final_url.as_deref().filter(|u| *u != record.url) {
            out.push_str(&format!("\n  ended at {}", final_url));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_providers::ProviderError;

    #[test]
    fn footer_marks_cached_answers() {
        let text = with_footer("Answer\n", Duration::from_millis(1234), "llama3.1", false);
        assert_eq!(text, "Answer\n\n_Response time: 1.23s • Model: llama3.1_");

        let cached = with_footer("Answer", Duration::ZERO, "llama3.1", true);
        assert!(cached.ends_with("Model: llama3.1 (cached)_"));
    }

    #[test]
    fn errors_are_clipped_to_preview_length() {
        let err = anyhow::anyhow!("{}", "x".repeat(1000));
        let text = error_text(&err);
        assert_eq!(text.len(), "Error: ".len() + ERROR_PREVIEW_CHARS);
    }

    #[test]
    fn timeouts_get_the_simpler_query_notice() {
        let err: anyhow::Error = ProviderError::Timeout {
            provider: "local".to_string(),
            secs: 180,
        }
        .into();
        assert_eq!(error_text(&err), TIMEOUT_NOTICE);

        let wrapped = err.context("generation failed");
        assert_eq!(error_text(&wrapped), TIMEOUT_NOTICE);
    }

    #[test]
    fn cache_hit_rate_handles_no_lookups() {
        let text = cache_text(
            Some(CacheStats {
                entries: 0,
                hits: 0,
                misses: 0,
            }),
            3600,
        );
        assert!(text.contains("(0% hit rate)"));
        assert_eq!(cache_text(None, 3600), "Response cache is disabled.");
    }

    #[test]
    fn history_mentions_redirected_final_url() {
        let records = vec![CaptureRecord {
            url: "https://a.test".to_string(),
            final_url: Some("https://a.test/login".to_string()),
            total_entries: 40,
            kept_entries: 6,
            elapsed_ms: 9100,
            created_at: "2026-01-02 03:04:05".to_string(),
        }];
        let text = history_text(&records);
        assert!(text.contains("2026-01-02 03:04:05 https://a.test"));
        assert!(text.contains("6 of 40 requests kept, 9.1s"));
        assert!(text.contains("ended at https://a.test/login"));
    }
}
