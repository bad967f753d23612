//! Turning observed Telegram messages into history documents.

use teloxide::types::Message;

use crate::tokenize::{Tokenizer, trim_tokens};

use super::store::HistoryDocument;

/// The searchable part of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub marker: Option<&'static str>,
    pub text: String,
}

impl Observed {
    /// Text shown in search results: the marker, if any, then the message text.
    pub fn display_text(&self) -> String {
        match self.marker {
            Some(marker) => format!("{marker} {}", self.text),
            None => self.text.clone(),
        }
    }

    /// Search tokens, marker first.
    pub fn tokens(&self, tokenizer: &Tokenizer) -> Vec<String> {
        let segments = tokenizer.segment(&self.text);
        trim_tokens(self.marker.into_iter().chain(segments))
    }
}

/// Marker for a captioned attachment. Checked in a fixed order; the last
/// matching kind wins.
pub fn attachment_marker(msg: &Message) -> Option<&'static str> {
    let kinds = [
        (msg.audio().is_some(), "[Audio]"),
        (msg.document().is_some(), "[File]"),
        (msg.animation().is_some(), "[Animation]"),
        (msg.game().is_some(), "[Game]"),
        (msg.photo().is_some(), "[Photo]"),
        (msg.video().is_some(), "[Video]"),
        (msg.voice().is_some(), "[Voice]"),
    ];

    kinds
        .iter()
        .rev()
        .find(|(present, _)| *present)
        .map(|(_, marker)| *marker)
}

/// Extract what should be recorded, or `None` for bot traffic and messages
/// with nothing to index.
pub fn observe(msg: &Message) -> Option<Observed> {
    if msg.via_bot.is_some() {
        return None;
    }
    let sender = msg.from.as_ref()?;
    if sender.is_bot {
        return None;
    }

    let observed = if let Some(text) = msg.text() {
        Observed { marker: None, text: text.to_string() }
    } else {
        Observed {
            marker: attachment_marker(msg),
            text: msg.caption()?.to_string(),
        }
    };

    if observed.text.trim().is_empty() {
        return None;
    }
    Some(observed)
}

/// Build the stored document for `msg`.
pub fn document(
    msg: &Message,
    observed: &Observed,
    tokens: Vec<String>,
) -> Result<HistoryDocument, serde_json::Error> {
    let sender_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or_default();

    Ok(HistoryDocument {
        sender_id,
        chat_id: msg.chat.id.0,
        message_id: msg.id.0 as i64,
        display_text: observed.display_text(),
        timestamp: msg.date,
        raw_event: serde_json::to_string(msg)?,
        tokens,
    })
}
