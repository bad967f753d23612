//! SQLite history store with a token index.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, Row, params, params_from_iter};
use thiserror::Error;
use tracing::info;

/// Documents per inline-search page.
pub const SEARCH_PAGE_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One observed chat message. At most one per (chat_id, message_id).
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryDocument {
    pub sender_id: i64,
    pub chat_id: i64,
    pub message_id: i64,
    /// Message text, prefixed with a marker for attachments.
    pub display_text: String,
    pub timestamp: DateTime<Utc>,
    /// Serialized `Message`, replayed when building inline results.
    pub raw_event: String,
    pub tokens: Vec<String>,
}

/// One page of search results.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub documents: Vec<HistoryDocument>,
    /// Matches across all pages.
    pub total: usize,
    /// 1-based page number.
    pub page: usize,
}

impl SearchPage {
    pub fn page_count(&self) -> usize {
        self.total.div_ceil(SEARCH_PAGE_SIZE)
    }
}

/// How the token column is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Exact match on a token table, one row per (token, document).
    Tokens,
    /// FTS5 full-text index over the space-joined tokens.
    FullText,
}

pub struct HistoryStore {
    conn: Mutex<Connection>,
    mode: IndexMode,
}

const COLUMNS: &str = "h.sender_id, h.chat_id, h.message_id, h.display_text, h.timestamp, h.raw_event, h.tokens";

impl HistoryStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: &Path, mode: IndexMode) -> Result<Self, HistoryError> {
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn, mode)?;
        info!("Loaded history from {:?} ({} documents, {:?} index)", path, store.count()?, mode);
        Ok(store)
    }

    /// Create a new in-memory store.
    pub fn in_memory(mode: IndexMode) -> Result<Self, HistoryError> {
        Self::with_connection(Connection::open_in_memory()?, mode)
    }

    fn with_connection(conn: Connection, mode: IndexMode) -> Result<Self, HistoryError> {
        let store = Self { conn: Mutex::new(conn), mode };
        store.init_schema()?;
        store.rebuild_index_if_empty()?;
        Ok(store)
    }

    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<(), HistoryError> {
        let conn = self.lock();

        conn.execute_batch(r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                sender_id INTEGER NOT NULL,
                display_text TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                raw_event TEXT NOT NULL,
                tokens TEXT NOT NULL,
                UNIQUE (chat_id, message_id)
            );

            CREATE TABLE IF NOT EXISTS history_tokens (
                token TEXT NOT NULL,
                doc_id INTEGER NOT NULL REFERENCES history(id) ON DELETE CASCADE,
                PRIMARY KEY (token, doc_id)
            ) WITHOUT ROWID;

            CREATE VIRTUAL TABLE IF NOT EXISTS history_fts USING fts5(tokens);

            CREATE INDEX IF NOT EXISTS idx_history_chat_time ON history(chat_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_history_tokens_doc ON history_tokens(doc_id);
        "#)?;

        Ok(())
    }

    /// Fill the active index from the stored token lists when it is empty,
    /// e.g. after switching index modes.
    fn rebuild_index_if_empty(&self) -> Result<(), HistoryError> {
        let mut conn = self.lock();
        let index_rows: i64 = match self.mode {
            IndexMode::Tokens => conn.query_row("SELECT COUNT(*) FROM history_tokens", [], |r| r.get(0))?,
            IndexMode::FullText => conn.query_row("SELECT COUNT(*) FROM history_fts", [], |r| r.get(0))?,
        };
        let docs: i64 = conn.query_row("SELECT COUNT(*) FROM history", [], |r| r.get(0))?;
        if index_rows > 0 || docs == 0 {
            return Ok(());
        }

        let tx = conn.transaction()?;
        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare("SELECT id, tokens FROM history")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };
        for (doc_id, tokens) in &rows {
            let tokens: Vec<String> = serde_json::from_str(tokens)?;
            index_document(&tx, self.mode, *doc_id, &tokens)?;
        }
        tx.commit()?;

        info!("Rebuilt {:?} index for {} documents", self.mode, rows.len());
        Ok(())
    }

    /// Insert a document, or replace the one with the same (chat_id, message_id).
    pub fn record(&self, doc: &HistoryDocument) -> Result<(), HistoryError> {
        let tokens_json = serde_json::to_string(&doc.tokens)?;
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let doc_id: i64 = tx.query_row(
            "INSERT INTO history (chat_id, message_id, sender_id, display_text, timestamp, raw_event, tokens)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(chat_id, message_id) DO UPDATE SET
                sender_id = excluded.sender_id,
                display_text = excluded.display_text,
                timestamp = excluded.timestamp,
                raw_event = excluded.raw_event,
                tokens = excluded.tokens
             RETURNING id",
            params![
                doc.chat_id,
                doc.message_id,
                doc.sender_id,
                doc.display_text,
                doc.timestamp.timestamp(),
                doc.raw_event,
                tokens_json
            ],
            |row| row.get(0),
        )?;

        index_document(&tx, self.mode, doc_id, &doc.tokens)?;
        tx.commit()?;
        Ok(())
    }

    /// Documents in `chat_id` containing every query token, newest first.
    ///
    /// `page` is 1-based; page 0 is treated as page 1. An empty token list
    /// matches nothing.
    pub fn search(&self, chat_id: i64, tokens: &[String], page: usize) -> Result<SearchPage, HistoryError> {
        let page = page.max(1);
        let mut query: Vec<&String> = Vec::new();
        for token in tokens {
            if !query.contains(&token) {
                query.push(token);
            }
        }
        if query.is_empty() {
            return Ok(SearchPage { documents: Vec::new(), total: 0, page });
        }

        let mut values = vec![Value::Integer(chat_id)];
        let filter = match self.mode {
            IndexMode::Tokens => {
                let placeholders: Vec<String> = (0..query.len()).map(|i| format!("?{}", i + 2)).collect();
                values.extend(query.iter().map(|t| Value::Text((*t).clone())));
                format!(
                    "h.id IN (SELECT doc_id FROM history_tokens WHERE token IN ({}) GROUP BY doc_id HAVING COUNT(*) = {})",
                    placeholders.join(", "),
                    query.len()
                )
            }
            IndexMode::FullText => {
                // FTS folds case and splits punctuation, so it only narrows the
                // candidates; the stored token list decides.
                let mut clauses = Vec::new();
                if let Some(fts) = fts_query(&query) {
                    values.push(Value::Text(fts));
                    clauses.push(format!(
                        "h.id IN (SELECT rowid FROM history_fts WHERE history_fts MATCH ?{})",
                        values.len()
                    ));
                }
                values.push(Value::Text(serde_json::to_string(&query)?));
                clauses.push(format!(
                    "NOT EXISTS (SELECT 1 FROM json_each(?{}) q
                                 WHERE q.value NOT IN (SELECT value FROM json_each(h.tokens)))",
                    values.len()
                ));
                clauses.join(" AND ")
            }
        };

        let conn = self.lock();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM history h WHERE h.chat_id = ?1 AND {filter}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let total = usize::try_from(total).unwrap_or_default();
        let offset = (page - 1)
            .checked_mul(SEARCH_PAGE_SIZE)
            .filter(|&offset| offset < total)
            .and_then(|offset| i64::try_from(offset).ok());
        let Some(offset) = offset else {
            return Ok(SearchPage { documents: Vec::new(), total, page });
        };

        let sql = format!(
            "SELECT {COLUMNS} FROM history h WHERE h.chat_id = ?1 AND {filter}
             ORDER BY h.timestamp DESC, h.message_id DESC LIMIT {SEARCH_PAGE_SIZE} OFFSET {offset}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let documents = stmt
            .query_map(params_from_iter(values.iter()), document_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SearchPage { documents, total, page })
    }

    /// Look up one document.
    pub fn get(&self, chat_id: i64, message_id: i64) -> Result<Option<HistoryDocument>, HistoryError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM history h WHERE h.chat_id = ?1 AND h.message_id = ?2"
        ))?;
        let mut rows = stmt.query_map(params![chat_id, message_id], document_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Total document count.
    pub fn count(&self) -> Result<usize, HistoryError> {
        let conn = self.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Drop every document and index entry.
    pub fn clear(&self) -> Result<(), HistoryError> {
        let conn = self.lock();
        conn.execute_batch("DELETE FROM history_tokens; DELETE FROM history_fts; DELETE FROM history;")?;
        Ok(())
    }
}

fn index_document(conn: &Connection, mode: IndexMode, doc_id: i64, tokens: &[String]) -> Result<(), HistoryError> {
    match mode {
        IndexMode::Tokens => {
            conn.execute("DELETE FROM history_tokens WHERE doc_id = ?1", params![doc_id])?;
            let mut stmt = conn.prepare_cached("INSERT OR IGNORE INTO history_tokens (token, doc_id) VALUES (?1, ?2)")?;
            for token in tokens {
                stmt.execute(params![token, doc_id])?;
            }
        }
        IndexMode::FullText => {
            conn.execute("DELETE FROM history_fts WHERE rowid = ?1", params![doc_id])?;
            conn.execute(
                "INSERT INTO history_fts (rowid, tokens) VALUES (?1, ?2)",
                params![doc_id, tokens.join(" ")],
            )?;
        }
    }
    Ok(())
}

/// FTS5 query requiring every token as a quoted phrase. Tokens without a
/// letter or digit index to nothing and are left to the exact check.
fn fts_query(tokens: &[&String]) -> Option<String> {
    let phrases: Vec<String> = tokens
        .iter()
        .filter(|t| t.chars().any(char::is_alphanumeric))
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    (!phrases.is_empty()).then(|| phrases.join(" AND "))
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryDocument> {
    let tokens_json: String = row.get(6)?;
    let tokens = serde_json::from_str(&tokens_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(HistoryDocument {
        sender_id: row.get(0)?,
        chat_id: row.get(1)?,
        message_id: row.get(2)?,
        display_text: row.get(3)?,
        timestamp: DateTime::from_timestamp(row.get(4)?, 0).unwrap_or_default(),
        raw_event: row.get(5)?,
        tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(chat_id: i64, message_id: i64, ts: i64, text: &str, tokens: &[&str]) -> HistoryDocument {
        HistoryDocument {
            sender_id: 100,
            chat_id,
            message_id,
            display_text: text.to_string(),
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            raw_event: "{}".to_string(),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn toks(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    fn both_modes() -> [HistoryStore; 2] {
        [
            HistoryStore::in_memory(IndexMode::Tokens).unwrap(),
            HistoryStore::in_memory(IndexMode::FullText).unwrap(),
        ]
    }

    #[test]
    fn test_record_replaces_same_key() {
        for store in both_modes() {
            store.record(&doc(-1, 5, 10, "first", &["first"])).unwrap();
            store.record(&doc(-1, 5, 10, "second", &["second"])).unwrap();

            assert_eq!(store.count().unwrap(), 1);
            let stored = store.get(-1, 5).unwrap().unwrap();
            assert_eq!(stored.display_text, "second");
            assert_eq!(stored.tokens, vec!["second"]);

            // Old tokens no longer match
            assert_eq!(store.search(-1, &toks(&["first"]), 1).unwrap().total, 0);
            assert_eq!(store.search(-1, &toks(&["second"]), 1).unwrap().total, 1);
        }
    }

    #[test]
    fn test_same_message_id_in_other_chat_is_separate() {
        let store = HistoryStore::in_memory(IndexMode::Tokens).unwrap();
        store.record(&doc(-1, 5, 10, "a", &["x"])).unwrap();
        store.record(&doc(-2, 5, 10, "b", &["x"])).unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_search_requires_all_tokens() {
        for store in both_modes() {
            store.record(&doc(-1, 1, 1, "a b", &["a", "b"])).unwrap();
            store.record(&doc(-1, 2, 2, "a", &["a"])).unwrap();
            store.record(&doc(-1, 3, 3, "b c", &["b", "c"])).unwrap();

            let page = store.search(-1, &toks(&["a", "b"]), 1).unwrap();
            assert_eq!(page.total, 1);
            assert_eq!(page.documents[0].message_id, 1);
        }
    }

    #[test]
    fn test_search_newest_first() {
        for store in both_modes() {
            store.record(&doc(-1, 1, 1, "cat dog", &["cat", "dog"])).unwrap();
            store.record(&doc(-1, 2, 2, "cat", &["cat"])).unwrap();

            let page = store.search(-1, &toks(&["cat"]), 1).unwrap();
            let ids: Vec<i64> = page.documents.iter().map(|d| d.message_id).collect();
            assert_eq!(ids, vec![2, 1]);
        }
    }

    #[test]
    fn test_search_scoped_to_chat() {
        let store = HistoryStore::in_memory(IndexMode::Tokens).unwrap();
        store.record(&doc(-1, 1, 1, "cat", &["cat"])).unwrap();
        store.record(&doc(-2, 2, 2, "cat", &["cat"])).unwrap();
        let page = store.search(-1, &toks(&["cat"]), 1).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.documents[0].chat_id, -1);
    }

    #[test]
    fn test_empty_query_matches_nothing() {
        let store = HistoryStore::in_memory(IndexMode::Tokens).unwrap();
        store.record(&doc(-1, 1, 1, "cat", &["cat"])).unwrap();
        let page = store.search(-1, &[], 1).unwrap();
        assert_eq!(page.total, 0);
        assert!(page.documents.is_empty());
    }

    #[test]
    fn test_duplicate_query_tokens() {
        let store = HistoryStore::in_memory(IndexMode::Tokens).unwrap();
        store.record(&doc(-1, 1, 1, "cat", &["cat"])).unwrap();
        assert_eq!(store.search(-1, &toks(&["cat", "cat"]), 1).unwrap().total, 1);
    }

    #[test]
    fn test_pagination() {
        let store = HistoryStore::in_memory(IndexMode::Tokens).unwrap();
        for i in 1..=25 {
            store.record(&doc(-1, i, i, "cat", &["cat"])).unwrap();
        }

        let first = store.search(-1, &toks(&["cat"]), 1).unwrap();
        assert_eq!(first.total, 25);
        assert_eq!(first.page_count(), 3);
        assert_eq!(first.documents.len(), SEARCH_PAGE_SIZE);
        assert_eq!(first.documents[0].message_id, 25);

        let third = store.search(-1, &toks(&["cat"]), 3).unwrap();
        assert_eq!(third.documents.len(), 5);
        assert_eq!(third.documents[4].message_id, 1);

        let beyond = store.search(-1, &toks(&["cat"]), 9).unwrap();
        assert!(beyond.documents.is_empty());
        assert_eq!(beyond.total, 25);

        let zero = store.search(-1, &toks(&["cat"]), 0).unwrap();
        assert_eq!(zero.page, 1);
        assert_eq!(zero.documents[0].message_id, 25);
    }

    #[test]
    fn test_cjk_tokens_full_text() {
        let store = HistoryStore::in_memory(IndexMode::FullText).unwrap();
        store.record(&doc(-1, 1, 1, "今天天气", &["今天", "天气"])).unwrap();
        store.record(&doc(-1, 2, 2, "明天", &["明天"])).unwrap();
        let page = store.search(-1, &toks(&["天气"]), 1).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.documents[0].message_id, 1);
    }

    #[test]
    fn test_quote_in_full_text_token() {
        let store = HistoryStore::in_memory(IndexMode::FullText).unwrap();
        store.record(&doc(-1, 1, 1, "say \"hi\"", &["say", "\"hi\""])).unwrap();
        assert!(store.search(-1, &toks(&["\"hi\""]), 1).is_ok());
    }

    #[test]
    fn test_tokens_match_exactly_in_both_modes() {
        for store in both_modes() {
            let mode = store.mode();
            store.record(&doc(-1, 1, 1, "cat", &["cat"])).unwrap();
            store.record(&doc(-1, 2, 2, "hello world", &["hello", "world"])).unwrap();
            store.record(&doc(-1, 3, 3, "c", &["c"])).unwrap();
            store.record(&doc(-1, 4, 4, "[Photo] sunset", &["[Photo]", "sunset"])).unwrap();

            for query in ["Cat", "hello-world", "C++", "Photo", "!!!"] {
                let page = store.search(-1, &toks(&[query]), 1).unwrap();
                assert_eq!(page.total, 0, "{mode:?} {query}");
            }
            let page = store.search(-1, &toks(&["[Photo]"]), 1).unwrap();
            assert_eq!(page.total, 1, "{mode:?}");
            assert_eq!(page.documents[0].message_id, 4);
            assert_eq!(store.search(-1, &toks(&["hello", "world"]), 1).unwrap().total, 1, "{mode:?}");
        }
    }

    #[test]
    fn test_huge_page_is_empty() {
        for store in both_modes() {
            let mode = store.mode();
            store.record(&doc(-1, 1, 1, "cat", &["cat"])).unwrap();
            for page in [usize::MAX, usize::MAX / 2, usize::MAX / SEARCH_PAGE_SIZE] {
                let result = store.search(-1, &toks(&["cat"]), page).unwrap();
                assert!(result.documents.is_empty(), "{mode:?} {page}");
                assert_eq!(result.total, 1);
                assert_eq!(result.page, page);
            }
        }
    }

    #[test]
    fn test_reopen_with_other_mode_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let store = HistoryStore::open(&path, IndexMode::Tokens).unwrap();
            store.record(&doc(-1, 1, 1, "cat", &["cat"])).unwrap();
        }
        let store = HistoryStore::open(&path, IndexMode::FullText).unwrap();
        assert_eq!(store.search(-1, &toks(&["cat"]), 1).unwrap().total, 1);
    }

    #[test]
    fn test_clear() {
        let store = HistoryStore::in_memory(IndexMode::Tokens).unwrap();
        store.record(&doc(-1, 1, 1, "cat", &["cat"])).unwrap();
        store.clear().unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(store.search(-1, &toks(&["cat"]), 1).unwrap().total, 0);
    }
}
