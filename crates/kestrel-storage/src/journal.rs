use anyhow::Result;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    pub channel: String,
    pub chat_id: Option<i64>,
    pub intent: String,
    pub model: String,
    pub prompt_chars: usize,
    pub response_chars: usize,
    pub elapsed_ms: u64,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureRecord {
    pub url: String,
    pub final_url: Option<String>,
    pub total_entries: usize,
    pub kept_entries: usize,
    pub elapsed_ms: u64,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JournalStats {
    pub exchanges: i64,
    pub cached_exchanges: i64,
    pub captures: i64,
    pub avg_elapsed_ms: i64,
}

/// Append-only record of answered messages and capture runs.
pub struct Journal {
    conn: rusqlite::Connection,
}

impl Journal {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path.as_ref())?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS exchanges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                chat_id INTEGER,
                intent TEXT NOT NULL,
                model TEXT NOT NULL DEFAULT '',
                prompt_chars INTEGER NOT NULL,
                response_chars INTEGER NOT NULL,
                elapsed_ms INTEGER NOT NULL,
                cached INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS captures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                final_url TEXT,
                total_entries INTEGER NOT NULL,
                kept_entries INTEGER NOT NULL,
                elapsed_ms INTEGER NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_exchanges_chat ON exchanges(chat_id);
            ",
        )?;
        Ok(Self { conn })
    }

    pub fn record_exchange(&self, record: &ExchangeRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO exchanges (channel, chat_id, intent, model, prompt_chars, response_chars, elapsed_ms, cached)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            (
                &record.channel,
                record.chat_id,
                &record.intent,
                &record.model,
                record.prompt_chars as i64,
                record.response_chars as i64,
                record.elapsed_ms as i64,
                if record.cached { 1 } else { 0 },
            ),
        )?;
        Ok(())
    }

    pub fn record_capture(
        &self,
        url: &str,
        final_url: Option<&str>,
        total_entries: usize,
        kept_entries: usize,
        elapsed_ms: u64,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO captures (url, final_url, total_entries, kept_entries, elapsed_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                url,
                final_url,
                total_entries as i64,
                kept_entries as i64,
                elapsed_ms as i64,
            ),
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn recent_captures(&self, limit: usize) -> Result<Vec<CaptureRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT url, final_url, total_entries, kept_entries, elapsed_ms, created_at
             FROM captures
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            Ok(CaptureRecord {
                url: row.get(0)?,
                final_url: row.get(1)?,
                total_entries: row.get::<_, i64>(2)? as usize,
                kept_entries: row.get::<_, i64>(3)? as usize,
                elapsed_ms: row.get::<_, i64>(4)? as u64,
                created_at: row.get(5)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn stats(&self) -> Result<JournalStats> {
        let (exchanges, cached_exchanges, avg_elapsed_ms): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(cached), 0), CAST(COALESCE(AVG(elapsed_ms), 0) AS INTEGER)
             FROM exchanges",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let captures: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM captures", [], |row| row.get(0))?;

        Ok(JournalStats {
            exchanges,
            cached_exchanges,
            captures,
            avg_elapsed_ms,
        })
    }
}
