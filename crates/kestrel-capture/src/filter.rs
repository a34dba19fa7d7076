use crate::NetworkEntry;
use kestrel_config::CaptureConfig;
use std::collections::{HashMap, HashSet};

/// Analytics and telemetry hosts never worth reporting.
pub const DEFAULT_IGNORED_HOSTS: &[&str] = &[
    "google-analytics.com",
    "analytics.google.com",
    "googletagmanager.com",
    "doubleclick.net",
    "googlesyndication.com",
    "facebook.net",
    "connect.facebook.net",
    "segment.io",
    "segment.com",
    "hotjar.com",
    "clarity.ms",
    "sentry.io",
    "nr-data.net",
    "newrelic.com",
    "mixpanel.com",
    "amplitude.com",
];

const ASSET_EXTENSIONS: &[&str] = &[
    "css", "js", "mjs", "map", "png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "ico", "bmp",
    "woff", "woff2", "ttf", "otf", "eot", "mp4", "webm", "mp3", "wav", "ogg",
];

const ASSET_MIME_PREFIXES: &[&str] = &["image/", "font/", "video/", "audio/", "text/css"];

/// Raw browser event, already stripped of protocol types.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Request {
        id: String,
        method: String,
        url: String,
        resource_type: Option<String>,
        post_data: Option<String>,
    },
    Response {
        id: String,
        status: u16,
        mime_type: String,
        resource_type: Option<String>,
    },
}

/// Joins responses onto requests by request id, keeping request arrival order.
///
/// A repeated request id (a redirect hop) starts a new entry; later
/// responses attach to the newest one.
pub fn assemble_entries(events: Vec<CaptureEvent>) -> Vec<NetworkEntry> {
    let mut entries: Vec<NetworkEntry> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for event in events {
        match event {
            CaptureEvent::Request {
                id,
                method,
                url,
                resource_type,
                post_data,
            } => {
                by_id.insert(id, entries.len());
                entries.push(NetworkEntry {
                    method,
                    url,
                    resource_type,
                    status: None,
                    mime_type: None,
                    post_data,
                });
            }
            CaptureEvent::Response {
                id,
                status,
                mime_type,
                resource_type,
            } => {
                let Some(&idx) = by_id.get(&id) else {
                    continue;
                };
                let entry = &mut entries[idx];
                entry.status = Some(status);
                if !mime_type.is_empty() {
                    entry.mime_type = Some(mime_type);
                }
                if entry.resource_type.is_none() {
                    entry.resource_type = resource_type;
                }
            }
        }
    }

    entries
}

#[derive(Debug, Clone)]
pub struct CaptureFilter {
    pub ignore_hosts: Vec<String>,
    pub max_entries: usize,
}

impl CaptureFilter {
    pub fn from_config(config: &CaptureConfig) -> Self {
        let mut ignore_hosts: Vec<String> =
            DEFAULT_IGNORED_HOSTS.iter().map(|h| h.to_string()).collect();
        for host in &config.ignore_hosts {
            let host = host.trim().trim_start_matches('.').to_ascii_lowercase();
            if !host.is_empty() && !ignore_hosts.contains(&host) {
                ignore_hosts.push(host);
            }
        }
        Self {
            ignore_hosts,
            max_entries: config.max_entries.max(1),
        }
    }

    fn host_ignored(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.ignore_hosts
            .iter()
            .any(|ignored| host == *ignored || host.ends_with(&format!(".{}", ignored)))
    }
}

fn is_asset(parsed: &url::Url, mime_type: Option<&str>) -> bool {
    if let Some(mime) = mime_type {
        let mime = mime.to_ascii_lowercase();
        if ASSET_MIME_PREFIXES.iter().any(|p| mime.starts_with(p)) || mime.contains("javascript") {
            return true;
        }
    }

    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|last| last.rsplit_once('.'))
        .map(|(_, ext)| ASSET_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn looks_like_api_call(entry: &NetworkEntry) -> bool {
    let kind = entry.resource_type.as_deref().unwrap_or("");
    if kind == "xhr" || kind == "fetch" {
        return true;
    }
    if entry
        .mime_type
        .as_deref()
        .is_some_and(|m| m.to_ascii_lowercase().contains("json"))
    {
        return true;
    }
    // Form submissions show up as document navigations with a body.
    kind == "document"
        && !entry.method.eq_ignore_ascii_case("GET")
        && !entry.method.eq_ignore_ascii_case("OPTIONS")
}

fn dedupe_key(entry: &NetworkEntry, parsed: &url::Url) -> String {
    let mut without_query = parsed.clone();
    without_query.set_query(None);
    without_query.set_fragment(None);
    format!("{} {}", entry.method.to_ascii_uppercase(), without_query)
}

/// Keeps API-looking traffic in arrival order.
pub fn filter_entries(entries: &[NetworkEntry], filter: &CaptureFilter) -> Vec<NetworkEntry> {
    let mut seen = HashSet::new();
    let mut kept = Vec::new();

    for entry in entries {
        if kept.len() >= filter.max_entries {
            break;
        }
        let Ok(parsed) = url::Url::parse(&entry.url) else {
            continue;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            continue;
        }
        if parsed.host_str().is_some_and(|h| filter.host_ignored(h)) {
            continue;
        }
        if is_asset(&parsed, entry.mime_type.as_deref()) {
            continue;
        }
        if !looks_like_api_call(entry) {
            continue;
        }
        if !seen.insert(dedupe_key(entry, &parsed)) {
            continue;
        }
        kept.push(entry.clone());
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(method: &str, url: &str, kind: &str, mime: Option<&str>) -> NetworkEntry {
        NetworkEntry {
            method: method.to_string(),
            url: url.to_string(),
            resource_type: Some(kind.to_string()),
            status: Some(200),
            mime_type: mime.map(str::to_string),
            post_data: None,
        }
    }

    fn filter(max_entries: usize) -> CaptureFilter {
        CaptureFilter::from_config(&CaptureConfig {
            ignore_hosts: vec![".tracker.test".to_string()],
            max_entries,
            ..CaptureConfig::default()
        })
    }

    #[test]
    fn responses_join_requests_by_id() {
        let events = vec![
            CaptureEvent::Request {
                id: "1".into(),
                method: "GET".into(),
                url: "https://a.test/".into(),
                resource_type: Some("document".into()),
                post_data: None,
            },
            CaptureEvent::Request {
                id: "2".into(),
                method: "POST".into(),
                url: "https://a.test/api/cart".into(),
                resource_type: None,
                post_data: Some("{\"sku\":1}".into()),
            },
            CaptureEvent::Response {
                id: "2".into(),
                status: 201,
                mime_type: "application/json".into(),
                resource_type: Some("fetch".into()),
            },
            CaptureEvent::Response {
                id: "orphan".into(),
                status: 500,
                mime_type: String::new(),
                resource_type: None,
            },
        ];

        let entries = assemble_entries(events);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, None);
        assert_eq!(entries[1].status, Some(201));
        assert_eq!(entries[1].resource_type.as_deref(), Some("fetch"));
        assert_eq!(entries[1].post_data.as_deref(), Some("{\"sku\":1}"));
    }

    #[test]
    fn redirect_hops_become_separate_entries() {
        let events = vec![
            CaptureEvent::Request {
                id: "1".into(),
                method: "GET".into(),
                url: "http://a.test/".into(),
                resource_type: Some("document".into()),
                post_data: None,
            },
            CaptureEvent::Request {
                id: "1".into(),
                method: "GET".into(),
                url: "https://a.test/".into(),
                resource_type: Some("document".into()),
                post_data: None,
            },
            CaptureEvent::Response {
                id: "1".into(),
                status: 200,
                mime_type: "text/html".into(),
                resource_type: Some("document".into()),
            },
        ];
        let entries = assemble_entries(events);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, None);
        assert_eq!(entries[1].status, Some(200));
    }

    #[test]
    fn keeps_api_calls_and_drops_noise() {
        let entries = vec![
            entry("GET", "https://shop.test/", "document", Some("text/html")),
            entry("GET", "https://shop.test/app.js", "script", Some("application/javascript")),
            entry("GET", "https://shop.test/logo.PNG", "image", None),
            entry("GET", "https://shop.test/api/items?page=1", "xhr", Some("application/json")),
            entry("POST", "https://www.google-analytics.com/collect", "ping", None),
            entry("POST", "https://eu.tracker.test/t", "fetch", None),
            entry("GET", "data:image/png;base64,AAAA", "image", None),
            entry("GET", "https://shop.test/config", "other", Some("application/json; charset=utf-8")),
            entry("POST", "https://shop.test/checkout", "document", Some("text/html")),
        ];

        let kept: Vec<String> = filter_entries(&entries, &filter(10))
            .into_iter()
            .map(|e| format!("{} {}", e.method, e.url))
            .collect();
        assert_eq!(
            kept,
            vec![
                "GET https://shop.test/api/items?page=1",
                "GET https://shop.test/config",
                "POST https://shop.test/checkout",
            ]
        );
    }

    #[test]
    fn beacons_and_untyped_posts_are_dropped() {
        let entries = vec![
            entry("POST", "https://shop.test/cdn-cgi/rum", "ping", None),
            entry("POST", "https://shop.test/beacon", "other", None),
            entry("PUT", "https://shop.test/telemetry", "other", Some("text/plain")),
            entry("POST", "https://shop.test/login", "document", Some("text/html")),
            entry("OPTIONS", "https://shop.test/form", "document", None),
        ];

        let kept: Vec<String> = filter_entries(&entries, &filter(10))
            .into_iter()
            .map(|e| format!("{} {}", e.method, e.url))
            .collect();
        assert_eq!(kept, vec!["POST https://shop.test/login"]);
    }

    #[test]
    fn duplicates_ignore_query_but_not_method() {
        let entries = vec![
            entry("GET", "https://a.test/api/x?t=1", "xhr", None),
            entry("GET", "https://a.test/api/x?t=2", "xhr", None),
            entry("POST", "https://a.test/api/x", "xhr", None),
        ];
        let kept = filter_entries(&entries, &filter(10));
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].url, "https://a.test/api/x?t=1");
        assert_eq!(kept[1].method, "POST");
    }

    #[test]
    fn output_is_capped() {
        let entries: Vec<NetworkEntry> = (0..20)
            .map(|i| entry("GET", &format!("https://a.test/api/{}", i), "fetch", None))
            .collect();
        let kept = filter_entries(&entries, &filter(5));
        assert_eq!(kept.len(), 5);
        assert_eq!(kept[4].url, "https://a.test/api/4");
    }
}
