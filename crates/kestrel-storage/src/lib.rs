//! Kestrel Storage
//!
//! Response cache, knowledge-base directory, and the SQLite journal

mod cache;
mod journal;
mod knowledge;

pub use cache::{cache_key, CacheStats, ResponseCache};
pub use journal::{CaptureRecord, ExchangeRecord, Journal, JournalStats};
pub use knowledge::{KnowledgeBase, SUPPORTED_EXTENSIONS};
