//! Kestrel Policy Engine
//!
//! Allowlist, denylist, and per-minute rate limiting

use kestrel_config::PolicyConfig;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

const RATE_BUCKET_RETENTION_MINUTES: i64 = 5;

#[derive(Clone)]
pub struct PolicyEngine {
    allowlist: HashSet<String>,
    denylist: HashSet<String>,
    rate_limit: Option<u32>,
    buckets: Arc<Mutex<HashMap<String, (i64, u32)>>>,
}

impl PolicyEngine {
    pub fn new(config: Option<&PolicyConfig>) -> Self {
        let allowlist = config
            .and_then(|c| c.allowlist.clone())
            .map(|list| list.into_iter().collect())
            .unwrap_or_default();

        let denylist = config
            .and_then(|c| c.denylist.clone())
            .map(|list| list.into_iter().collect())
            .unwrap_or_default();

        let rate_limit = config.and_then(|c| c.rate_limit.as_ref().map(|r| r.messages_per_minute));

        Self {
            allowlist,
            denylist,
            rate_limit,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_allowed(&self, chat_id: &str) -> bool {
        if self.denylist.contains(chat_id) {
            return false;
        }

        if self.allowlist.is_empty() {
            return true;
        }

        self.allowlist.contains(chat_id)
    }

    pub fn check_rate_limit(&self, count: u32) -> bool {
        self.rate_limit.is_none_or(|limit| count <= limit)
    }

    /// Counts one message for `sender_id` and reports whether it is within the limit.
    pub fn record_and_check(&self, sender_id: &str) -> bool {
        self.record_and_check_at(sender_id, chrono::Utc::now().timestamp())
    }

    fn record_and_check_at(&self, sender_id: &str, now_secs: i64) -> bool {
        if self.rate_limit.is_none() {
            return true;
        }

        let minute_bucket = now_secs / 60;
        let mut state = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        state.retain(|_, (bucket, _)| *bucket >= minute_bucket - RATE_BUCKET_RETENTION_MINUTES);

        let entry = state
            .entry(sender_id.to_string())
            .or_insert((minute_bucket, 0));

        if entry.0 != minute_bucket {
            entry.0 = minute_bucket;
            entry.1 = 0;
        }

        entry.1 += 1;
        self.check_rate_limit(entry.1)
    }
}
