//! `/saucenao`: reverse image search on a photo or document.

pub mod api;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use teloxide::types::{FileId, Message};
use teloxide::utils::markdown;
use tracing::{info, warn};

use crate::config::{ConfigError, Entry};
use crate::plugin::{BotContext, Command, Plugin};

pub use api::{Sauce, SauceClient, SauceError};

const MAX_REPLY: usize = 3;

fn default_command() -> String {
    "saucenao".to_string()
}

fn default_numres() -> u32 {
    6
}

#[derive(Deserialize)]
struct SauceOptions {
    api_key: Option<String>,
    #[serde(default = "default_command")]
    command: String,
    #[serde(default = "default_numres")]
    numres: u32,
}

/// Factory for `saucenao`.
pub fn build(entry: &Entry) -> Result<Arc<dyn Plugin>, ConfigError> {
    let options: SauceOptions = entry.options()?;
    let client = SauceClient::new(options.api_key, options.numres)
        .map_err(|e| ConfigError::Validation(format!("failed to build HTTP client: {e}")))?;
    Ok(Arc::new(SaucePlugin { command: options.command, client }))
}

pub struct SaucePlugin {
    command: String,
    client: SauceClient,
}

/// Largest photo, or any document.
fn image_file(msg: &Message) -> Option<FileId> {
    if let Some(photos) = msg.photo() {
        return photos.iter().max_by_key(|p| p.width).map(|p| p.file.id.clone());
    }
    msg.document().map(|d| d.file.id.clone())
}

/// Numbered MarkdownV2 list of the top hits: `N. author: [index](url)`.
pub fn format_results(results: &[Sauce]) -> String {
    results
        .iter()
        .take(MAX_REPLY)
        .enumerate()
        .map(|(i, sauce)| {
            let author = markdown::escape(sauce.author.as_deref().unwrap_or("Unknown"));
            let index = markdown::escape(&sauce.index_name);
            match sauce.urls.first() {
                Some(url) => format!("{}\\. {}: [{}]({})", i + 1, author, index, markdown::escape_link_url(url)),
                None => format!("{}\\. {}: {}", i + 1, author, index),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Plugin for SaucePlugin {
    fn name(&self) -> &str {
        "saucenao"
    }

    fn commands(&self) -> Vec<String> {
        vec![self.command.clone()]
    }

    async fn on_command(&self, ctx: &BotContext, msg: &Message, _command: &Command<'_>) {
        let chat_id = msg.chat.id.0;
        let telegram = &ctx.telegram;

        let (target, file_id) = match msg.reply_to_message() {
            Some(reply) => (reply, image_file(reply)),
            None => (msg, image_file(msg)),
        };
        let Some(file_id) = file_id else {
            let _ = telegram.send_text(chat_id, "No image found.", Some(msg.id.0 as i64)).await;
            return;
        };
        if target.id != msg.id {
            let _ = telegram.delete_message(chat_id, msg.id.0 as i64).await;
        }

        let reply_to = Some(target.id.0 as i64);
        let result = match telegram.download(&file_id).await {
            Ok(bytes) => self.client.search(bytes, "image.jpg").await,
            Err(e) => {
                warn!("{}", e);
                let _ = telegram.send_text(chat_id, "Failed to download the image.", reply_to).await;
                return;
            }
        };

        match result {
            Ok(results) if results.is_empty() => {
                let _ = telegram.send_text(chat_id, "No similar images found.", reply_to).await;
            }
            Ok(results) => {
                info!("🔍 SauceNAO: {} hits, best {:.1}%", results.len(), results[0].similarity);
                let _ = telegram.send_markdown(chat_id, &format_results(&results), reply_to).await;
            }
            Err(e) => {
                warn!("SauceNAO search failed: {}", e);
                let _ = telegram
                    .send_text(chat_id, "The server returned an error, please try again later.", reply_to)
                    .await;
            }
        }
    }
}
