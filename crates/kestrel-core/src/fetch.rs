use anyhow::{anyhow, Result};
use kestrel_config::FetchConfig;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Plain GET of a page for website analysis. No JavaScript runs here; the
/// browser path lives in kestrel-capture.
pub struct PageFetcher {
    client: Client,
    max_chars: usize,
}

impl PageFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| anyhow!("failed to build fetch client: {}", e))?;

        Ok(Self {
            client,
            max_chars: config.max_chars,
        })
    }

    /// Body text truncated to `max_chars` characters. Error statuses still
    /// return their body: an error page says something about the site too.
    pub async fn fetch(&self, url: &str) -> Result<String> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("fetching {} failed: {}", url, e))?;

        let status = resp.status();
        if !status.is_success() {
            warn!(url = %url, status = %status, "Page fetch returned an error status");
        }

        // A char is at most 4 bytes, so this many bytes always hold the
        // first `max_chars` characters intact.
        let byte_limit = self.max_chars.saturating_mul(4);
        let mut body: Vec<u8> = Vec::new();
        while body.len() < byte_limit {
            let chunk = resp
                .chunk()
                .await
                .map_err(|e| anyhow!("reading {} failed: {}", url, e))?;
            match chunk {
                Some(bytes) => body.extend_from_slice(&bytes),
                None => break,
            }
        }
        debug!(url = %url, bytes = body.len(), "Fetched page");

        Ok(String::from_utf8_lossy(&body)
            .chars()
            .take(self.max_chars)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn fetcher(max_chars: usize) -> PageFetcher {
        PageFetcher::new(&FetchConfig {
            max_chars,
            user_agent: "kestrel-test/1.0".to_string(),
            ..FetchConfig::default()
        })
        .expect("client")
    }

    #[tokio::test]
    async fn sends_user_agent_and_truncates_by_chars() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/page")
                .header("user-agent", "kestrel-test/1.0");
            then.status(200).body("ééééé-rest");
        });

        let body = fetcher(3).fetch(&server.url("/page")).await.expect("fetch");
        mock.assert();
        assert_eq!(body, "ééé");
    }

    #[tokio::test]
    async fn large_multibyte_page_keeps_whole_leading_chars() {
        let server = MockServer::start();
        let page = "a🦅é".repeat(200_000);
        server.mock(|when, then| {
            when.method(GET).path("/big");
            then.status(200).body(page.as_str());
        });

        let body = fetcher(7).fetch(&server.url("/big")).await.expect("fetch");
        assert_eq!(body, "a🦅éa🦅éa");
    }

    #[tokio::test]
    async fn error_status_body_is_still_returned() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/missing");
            then.status(404).body("<h1>Not here</h1>");
        });

        let body = fetcher(100).fetch(&server.url("/missing")).await.expect("fetch");
        assert_eq!(body, "<h1>Not here</h1>");
    }

    #[tokio::test]
    async fn connection_failure_is_an_error() {
        let err = fetcher(100)
            .fetch("http://127.0.0.1:9/unreachable")
            .await
            .expect_err("nothing listens on the discard port");
        assert!(err.to_string().contains("fetching http://127.0.0.1:9/unreachable failed"));
    }
}
