use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Content hash over everything that shapes a generation.
pub fn cache_key(provider: &str, model: &str, system: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [provider, model, system, prompt] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheState {
    entries: HashMap<String, (Instant, String)>,
    hits: u64,
    misses: u64,
}

/// In-memory response cache with a fixed TTL.
///
/// Expiry is a linear sweep performed on every insert.
pub struct ResponseCache {
    ttl: Duration,
    max_entries: usize,
    state: Mutex<CacheState>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<String> {
        let mut state = self.lock();
        let fresh = state
            .entries
            .get(key)
            .filter(|(inserted, _)| now.saturating_duration_since(*inserted) < self.ttl)
            .map(|(_, text)| text.clone());
        match fresh {
            Some(text) => {
                state.hits += 1;
                Some(text)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, key: String, text: String) {
        self.insert_at(key, text, Instant::now());
    }

    fn insert_at(&self, key: String, text: String, now: Instant) {
        let mut state = self.lock();
        let ttl = self.ttl;
        state
            .entries
            .retain(|_, (inserted, _)| now.saturating_duration_since(*inserted) < ttl);

        if !state.entries.contains_key(&key) && state.entries.len() >= self.max_entries {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, (inserted, _))| *inserted)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                state.entries.remove(&oldest);
            }
        }

        state.entries.insert(key, (now, text));
    }

    /// Drops every entry; returns how many were removed.
    pub fn purge(&self) -> usize {
        let mut state = self.lock();
        let removed = state.entries.len();
        state.entries.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
        }
    }
}
