//! Inline-query parsing and result formatting.

use teloxide::types::{
    InlineQueryResult, InlineQueryResultArticle, InputMessageContent, InputMessageContentText,
    Message, ParseMode, User,
};
use teloxide::utils::html;

use super::store::{HistoryDocument, SearchPage};

const TITLE_CHARS: usize = 100;
/// Telegram's limit on message text.
const MESSAGE_CHARS: usize = 4096;
/// Highest page a query can ask for.
pub const MAX_PAGE: usize = 100_000;

/// Split `<words> [page]`. A trailing integer is the page number, clamped
/// to `1..=MAX_PAGE`.
pub fn parse_query(query: &str) -> (String, usize) {
    let mut words: Vec<&str> = query.split(' ').collect();
    let page = match words.last().and_then(|w| page_number(w)) {
        Some(page) => {
            words.pop();
            page
        }
        None => 1,
    };
    (words.join(" ").trim().to_string(), page)
}

fn page_number(word: &str) -> Option<usize> {
    let (negative, digits) = match word.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, word),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if negative {
        return Some(1);
    }
    Some(digits.parse::<usize>().map_or(MAX_PAGE, |page| page.clamp(1, MAX_PAGE)))
}

/// HTML-escape `text`, stopping before the escaped form exceeds `budget` chars.
fn escape_clipped(text: &str, budget: usize) -> String {
    let mut out = String::new();
    let mut used = 0;
    for c in text.chars() {
        let escaped = html::escape(c.encode_utf8(&mut [0; 4]));
        used += escaped.chars().count();
        if used > budget {
            break;
        }
        out.push_str(&escaped);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryContent {
    /// HTML text ending in a link back to the original message.
    Jump(String),
    /// The message text, sent as is.
    Plain(String),
}

/// One inline result before conversion to the Telegram type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEntry {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub content: EntryContent,
}

impl ResultEntry {
    pub fn into_result(self) -> InlineQueryResult {
        let content = match self.content {
            EntryContent::Jump(text) => InputMessageContentText::new(text).parse_mode(ParseMode::Html),
            EntryContent::Plain(text) => InputMessageContentText::new(text),
        };
        let mut article =
            InlineQueryResultArticle::new(self.id, self.title, InputMessageContent::Text(content));
        if let Some(description) = self.description {
            article = article.description(description);
        }
        InlineQueryResult::Article(article)
    }
}

/// The synthetic first entry with totals.
pub fn info_entry(page: &SearchPage) -> ResultEntry {
    ResultEntry {
        id: "info".to_string(),
        title: format!("Total:{}. Page {} of {}", page.total, page.page, page.page_count()),
        description: None,
        content: EntryContent::Plain("/help".to_string()),
    }
}

fn sender_name(user: &User) -> String {
    match &user.username {
        Some(username) => format!("@{username}"),
        None => user.full_name(),
    }
}

/// Format one stored document, replaying its raw event for the sender and link.
pub fn document_entry(doc: &HistoryDocument) -> ResultEntry {
    let replay: Option<Message> = serde_json::from_str(&doc.raw_event).ok();

    let name = replay
        .as_ref()
        .and_then(|m| m.from.as_ref())
        .map(sender_name)
        .unwrap_or_else(|| format!("user {}", doc.sender_id));
    let link = replay.as_ref().and_then(|m| m.url());

    let content = match link {
        Some(url) if doc.message_id > 0 => {
            let suffix = format!("<a href=\"{}\">「From {}」</a>", url, html::escape(&name));
            let budget = MESSAGE_CHARS.saturating_sub(suffix.chars().count());
            EntryContent::Jump(escape_clipped(&doc.display_text, budget) + &suffix)
        }
        _ => EntryContent::Plain(doc.display_text.chars().take(MESSAGE_CHARS).collect()),
    };

    ResultEntry {
        id: format!("{}:{}", doc.chat_id, doc.message_id),
        title: doc.display_text.chars().take(TITLE_CHARS).collect(),
        description: Some(format!("{:<40}{}", doc.timestamp.format("%Y-%m-%d"), name)),
        content,
    }
}

/// Info entry followed by one entry per document.
pub fn format_page(page: &SearchPage) -> Vec<ResultEntry> {
    std::iter::once(info_entry(page))
        .chain(page.documents.iter().map(document_entry))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::record::tests::message;
    use crate::history::record::{document, observe};
    use chrono::DateTime;
    use serde_json::json;

    #[test]
    fn test_parse_query_with_page() {
        assert_eq!(parse_query("cat dog 3"), ("cat dog".to_string(), 3));
    }

    #[test]
    fn test_parse_query_without_page() {
        assert_eq!(parse_query("cat dog"), ("cat dog".to_string(), 1));
        assert_eq!(parse_query(""), (String::new(), 1));
    }

    #[test]
    fn test_parse_query_only_number() {
        assert_eq!(parse_query("2"), (String::new(), 2));
    }

    #[test]
    fn test_parse_query_nonpositive_page() {
        assert_eq!(parse_query("cat 0"), ("cat".to_string(), 1));
        assert_eq!(parse_query("cat -4"), ("cat".to_string(), 1));
    }

    #[test]
    fn test_parse_query_huge_page_is_clamped() {
        assert_eq!(parse_query("cat 9223372036854775807"), ("cat".to_string(), MAX_PAGE));
        assert_eq!(parse_query("cat 1000000000000000000"), ("cat".to_string(), MAX_PAGE));
        assert_eq!(parse_query("cat 99999999999999999999999"), ("cat".to_string(), MAX_PAGE));
        assert_eq!(parse_query("cat -99999999999999999999999"), ("cat".to_string(), 1));
        assert_eq!(parse_query("cat 12ab"), ("cat 12ab".to_string(), 1));
    }

    #[test]
    fn test_long_escaped_text_fits_one_message() {
        let msg = message(json!({"text": "<".repeat(4000)}));
        let observed = observe(&msg).unwrap();
        let doc = document(&msg, &observed, vec![]).unwrap();

        match document_entry(&doc).content {
            EntryContent::Jump(text) => {
                assert!(text.chars().count() <= MESSAGE_CHARS);
                assert!(text.starts_with("&lt;&lt;"));
                // Clipped on an entity boundary
                let body = text.split("<a href=").next().unwrap();
                assert!(body.ends_with("&lt;"));
                assert!(text.ends_with("「From @alice」</a>"));
            }
            other => panic!("expected jump content, got {other:?}"),
        }
    }

    #[test]
    fn test_info_entry() {
        let page = SearchPage { documents: Vec::new(), total: 23, page: 2 };
        let entry = info_entry(&page);
        assert_eq!(entry.id, "info");
        assert_eq!(entry.title, "Total:23. Page 2 of 3");
        assert_eq!(entry.content, EntryContent::Plain("/help".to_string()));
    }

    #[test]
    fn test_supergroup_document_gets_jump_link() {
        let msg = message(json!({"text": "a < b"}));
        let observed = observe(&msg).unwrap();
        let doc = document(&msg, &observed, vec![]).unwrap();

        let entry = document_entry(&doc);
        assert_eq!(entry.title, "a < b");
        let description = entry.description.unwrap();
        assert!(description.starts_with("2023-11-14"));
        assert!(description.ends_with("@alice"));
        assert_eq!(description.len(), 40 + "@alice".len());

        match entry.content {
            EntryContent::Jump(text) => {
                assert!(text.starts_with("a &lt; b<a href=\"https://t.me/testgroup/42\">"));
                assert!(text.ends_with("「From @alice」</a>"));
            }
            other => panic!("expected jump content, got {other:?}"),
        }
    }

    #[test]
    fn test_private_chat_falls_back_to_plain() {
        let msg = message(json!({
            "text": "secret",
            "chat": {"id": 7, "type": "private", "first_name": "Alice"}
        }));
        let observed = observe(&msg).unwrap();
        let doc = document(&msg, &observed, vec![]).unwrap();

        assert_eq!(document_entry(&doc).content, EntryContent::Plain("secret".to_string()));
    }

    #[test]
    fn test_unreadable_raw_event() {
        let doc = HistoryDocument {
            sender_id: 5,
            chat_id: -1,
            message_id: 3,
            display_text: "x".repeat(150),
            timestamp: DateTime::from_timestamp(0, 0).unwrap(),
            raw_event: "not json".to_string(),
            tokens: vec![],
        };
        let entry = document_entry(&doc);
        assert_eq!(entry.title.chars().count(), 100);
        assert!(entry.description.unwrap().ends_with("user 5"));
        assert!(matches!(entry.content, EntryContent::Plain(_)));
    }

    #[test]
    fn test_format_page_puts_info_first() {
        let msg = message(json!({"text": "hello"}));
        let observed = observe(&msg).unwrap();
        let doc = document(&msg, &observed, vec![]).unwrap();
        let page = SearchPage { documents: vec![doc], total: 1, page: 1 };

        let entries = format_page(&page);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "info");
        assert_eq!(entries[1].id, "-1001234567890:42");
    }
}
