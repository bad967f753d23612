//! Message history: recording, inline search and `/locate`.

pub mod inline;
pub mod record;
pub mod store;

pub use store::{HistoryDocument, HistoryError, HistoryStore, IndexMode, SEARCH_PAGE_SIZE, SearchPage};

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{InlineQuery, Message};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::telegram::TelegramClient;
use crate::tokenize::Tokenizer;
use crate::whitelist::AdminLookup;

/// History recorder and search service for one supervised chat.
pub struct History {
    store: HistoryStore,
    tokenizer: Arc<Tokenizer>,
    supervising_chat_id: i64,
}

impl History {
    pub fn new(store: HistoryStore, tokenizer: Arc<Tokenizer>, supervising_chat_id: i64) -> Self {
        Self { store, tokenizer, supervising_chat_id }
    }

    /// Open the store described by the database config.
    pub fn open(config: &DatabaseConfig, tokenizer: Arc<Tokenizer>) -> Result<Self, HistoryError> {
        let mode = if config.use_text_search { IndexMode::FullText } else { IndexMode::Tokens };
        let store = HistoryStore::open(&config.path, mode)?;
        Ok(Self::new(store, tokenizer, config.supervising_chat_id))
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub fn supervising_chat_id(&self) -> i64 {
        self.supervising_chat_id
    }

    /// Record a new or edited message. Best effort: failures are logged.
    pub async fn record(&self, msg: &Message) {
        let Some(observed) = record::observe(msg) else {
            return;
        };

        let tokenizer = self.tokenizer.clone();
        let segmented = observed.clone();
        let tokens = match tokio::task::spawn_blocking(move || segmented.tokens(&tokenizer)).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("failed to tokenize message {}: {}", msg.id, e);
                return;
            }
        };

        let result = record::document(msg, &observed, tokens)
            .map_err(HistoryError::from)
            .and_then(|doc| self.store.record(&doc));
        match result {
            Ok(()) => debug!("recorded message {} in chat {}", msg.id, msg.chat.id),
            Err(e) => warn!("failed to write history: {}", e),
        }
    }

    /// Search the supervising chat on behalf of `user_id`.
    ///
    /// Returns `None` when there is nothing to search for, the user is not an
    /// administrator of the supervising chat, or any step fails.
    pub async fn search(
        &self,
        user_id: u64,
        query: &str,
        admins: &dyn AdminLookup,
    ) -> Option<SearchPage> {
        let (words, page) = inline::parse_query(query);
        if words.is_empty() {
            return None;
        }

        let tokenizer = self.tokenizer.clone();
        let tokens = tokio::task::spawn_blocking(move || tokenizer.tokens(&words)).await.ok()?;
        if tokens.is_empty() {
            return None;
        }

        match admins.admin_ids(self.supervising_chat_id).await {
            Ok(ids) if ids.contains(&user_id) => {}
            Ok(_) => {
                debug!("inline search denied for user {}", user_id);
                return None;
            }
            Err(e) => {
                debug!("inline search admin lookup failed: {}", e);
                return None;
            }
        }

        match self.store.search(self.supervising_chat_id, &tokens, page) {
            Ok(page) => Some(page),
            Err(e) => {
                warn!("history search failed: {}", e);
                None
            }
        }
    }

    /// Answer an inline query. Unauthorized or empty queries get no answer.
    pub async fn answer_inline(&self, telegram: &TelegramClient, query: &InlineQuery) {
        let Some(page) = self.search(query.from.id.0, &query.query, telegram).await else {
            return;
        };

        info!(
            "🔎 Inline search by {}: {} matches, page {}",
            query.from.id, page.total, page.page
        );

        let results: Vec<_> = inline::format_page(&page)
            .into_iter()
            .map(inline::ResultEntry::into_result)
            .collect();

        if let Err(e) = telegram.bot().answer_inline_query(query.id.clone(), results).await {
            warn!("{}", telegram.redact(&format!("Failed to answer inline query: {e}")));
        }
    }

    /// `/locate <message_id>`: reply to that message so it can be jumped to.
    pub async fn locate(&self, telegram: &TelegramClient, msg: &Message, args: &str) {
        let chat_id = msg.chat.id.0;
        let reply_to = Some(msg.id.0 as i64);

        let Ok(target) = args.trim().parse::<i64>() else {
            let _ = telegram.send_text(chat_id, "Usage: /locate <message id>", reply_to).await;
            return;
        };

        if telegram.send_text(chat_id, "⬆️", Some(target)).await.is_err() {
            let _ = telegram
                .send_text(chat_id, &format!("Message {target} not found."), reply_to)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::record::tests::message;
    use crate::whitelist::tests::FakeAdmins;
    use serde_json::json;

    const GROUP: i64 = -1001234567890;

    fn history() -> History {
        let store = HistoryStore::in_memory(IndexMode::Tokens).unwrap();
        History::new(store, Arc::new(Tokenizer::new()), GROUP)
    }

    #[tokio::test]
    async fn test_record_then_search() {
        let history = history();
        history.record(&message(json!({"message_id": 1, "text": "the cat sat"}))).await;
        history.record(&message(json!({"message_id": 2, "date": 1_700_000_100, "text": "a cat ran"}))).await;

        let admins = FakeAdmins::new(&[(GROUP, &[7])]);
        let page = history.search(7, "cat", &admins).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.documents[0].message_id, 2);
    }

    #[tokio::test]
    async fn test_edit_replaces() {
        let history = history();
        history.record(&message(json!({"text": "before"}))).await;
        history.record(&message(json!({"text": "after", "edit_date": 1_700_000_050}))).await;

        assert_eq!(history.store().count().unwrap(), 1);
        let doc = history.store().get(GROUP, 42).unwrap().unwrap();
        assert_eq!(doc.display_text, "after");
    }

    #[tokio::test]
    async fn test_non_admin_gets_nothing() {
        let history = history();
        history.record(&message(json!({"text": "cat"}))).await;

        let admins = FakeAdmins::new(&[(GROUP, &[1])]);
        assert!(history.search(7, "cat", &admins).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_lookup_gets_nothing() {
        let history = history();
        history.record(&message(json!({"text": "cat"}))).await;

        let admins = FakeAdmins::new(&[]);
        assert!(history.search(7, "cat", &admins).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_query_skips_lookup() {
        let history = history();
        let admins = FakeAdmins::new(&[(GROUP, &[7])]);
        assert!(history.search(7, "   ", &admins).await.is_none());
        assert!(history.search(7, "", &admins).await.is_none());
        assert_eq!(admins.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_search_page_suffix() {
        let history = history();
        for i in 1..=12 {
            history.record(&message(json!({"message_id": i, "date": 1_700_000_000 + i, "text": "cat"}))).await;
        }
        let admins = FakeAdmins::new(&[(GROUP, &[7])]);
        let page = history.search(7, "cat 2", &admins).await.unwrap();
        assert_eq!(page.page, 2);
        assert_eq!(page.documents.len(), 2);
        assert_eq!(page.documents[0].message_id, 2);
    }

    #[tokio::test]
    async fn test_bot_messages_not_recorded() {
        let history = history();
        history
            .record(&message(json!({"text": "beep", "from": {"id": 8, "is_bot": true, "first_name": "Robo"}})))
            .await;
        assert_eq!(history.store().count().unwrap(), 0);
    }
}
