//! Debug plugin: echoes message metadata back to the chat.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::types::Message;
use teloxide::utils::html;
use tracing::warn;

use crate::config::{ConfigError, Entry};
use crate::plugin::{BotContext, Plugin};

/// Factory for `chatterbox`.
pub fn build(_entry: &Entry) -> Result<Arc<dyn Plugin>, ConfigError> {
    warn!("chatterbox plugin is for debugging only and answers every message");
    Ok(Arc::new(Chatterbox))
}

pub struct Chatterbox;

fn chat_type(msg: &Message) -> &'static str {
    if msg.chat.is_private() {
        "private"
    } else if msg.chat.is_group() {
        "group"
    } else if msg.chat.is_supergroup() {
        "supergroup"
    } else if msg.chat.is_channel() {
        "channel"
    } else {
        "unknown"
    }
}

pub fn describe(msg: &Message) -> String {
    let sender = msg.from.as_ref().map(|u| u.id.to_string()).unwrap_or_else(|| "none".to_string());
    let content = msg.text().or_else(|| msg.caption()).unwrap_or_default();

    format!(
        "<code>chat_type</code> = <code>{}</code>\n\
         <code>chat_id</code> = <code>{}</code>\n\
         <code>msg_id</code> = <code>{}</code>\n\
         <code>from_user</code> = <code>{}</code>\n\
         <code>is_forward</code> = {}\n\
         <code>is_edited</code> = {}\n\
         <code>content</code> = {}",
        chat_type(msg),
        msg.chat.id.0,
        msg.id.0,
        sender,
        msg.forward_origin().is_some(),
        msg.edit_date().is_some(),
        html::escape(content)
    )
}

#[async_trait]
impl Plugin for Chatterbox {
    fn name(&self) -> &str {
        "chatterbox"
    }

    async fn on_message(&self, ctx: &BotContext, msg: &Message) {
        let _ = ctx.telegram.send_html(msg.chat.id.0, &describe(msg), Some(msg.id.0 as i64)).await;
    }
}
