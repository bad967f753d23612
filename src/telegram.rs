//! Telegram client using teloxide.

use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, FileId, InputFile, MessageId, ParseMode, ReplyParameters};
use tracing::{info, warn};

use crate::whitelist::AdminLookup;

/// Telegram API client.
#[derive(Clone)]
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }

    /// Replace every part of the bot token found in `text` with asterisks.
    pub fn redact(&self, text: &str) -> String {
        redact_token(text, self.bot.token())
    }

    /// Send plain text, optionally as a reply. Returns the new message id.
    pub async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64, String> {
        self.send(chat_id, text, None, reply_to_message_id).await
    }

    pub async fn send_html(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64, String> {
        self.send(chat_id, text, Some(ParseMode::Html), reply_to_message_id).await
    }

    pub async fn send_markdown(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64, String> {
        self.send(chat_id, text, Some(ParseMode::MarkdownV2), reply_to_message_id).await
    }

    async fn send(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<ParseMode>,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64, String> {
        let mut request = self.bot.send_message(ChatId(chat_id), text);

        if let Some(mode) = parse_mode {
            request = request.parse_mode(mode);
        }

        if let Some(msg_id) = reply_to_message_id {
            let reply_params = ReplyParameters::new(MessageId(msg_id as i32));
            request = request.reply_parameters(reply_params);
        }

        request.await.map(|msg| msg.id.0 as i64).map_err(|e| {
            let msg = self.redact(&format!("Failed to send: {e}"));
            warn!("{}", msg);
            msg
        })
    }

    /// Show the "typing" indicator; Telegram clears it after ~5 seconds.
    pub async fn send_typing(&self, chat_id: i64) -> Result<(), String> {
        self.bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
            .map(|_| ())
            .map_err(|e| self.redact(&format!("Failed to send chat action: {e}")))
    }

    /// Delete a message.
    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), String> {
        info!("🗑️ Deleting message {} in chat {}", message_id, chat_id);

        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id as i32))
            .await
            .map_err(|e| {
                let msg = self.redact(&format!("Failed to delete message: {e}"));
                warn!("{}", msg);
                msg
            })?;

        Ok(())
    }

    /// User ids of the administrators of a chat.
    pub async fn get_chat_admin_ids(&self, chat_id: i64) -> Result<Vec<u64>, String> {
        let admins = self
            .bot
            .get_chat_administrators(ChatId(chat_id))
            .await
            .map_err(|e| self.redact(&format!("Failed to get chat admins: {e}")))?;

        Ok(admins.iter().map(|m| m.user.id.0).collect())
    }

    /// Download a file by file_id.
    pub async fn download(&self, file_id: &FileId) -> Result<Vec<u8>, String> {
        let file = self
            .bot
            .get_file(file_id.clone())
            .await
            .map_err(|e| self.redact(&format!("Failed to get file info: {e}")))?;

        let mut data = Vec::new();
        self.bot
            .download_file(&file.path, &mut data)
            .await
            .map_err(|e| self.redact(&format!("Failed to download file: {e}")))?;

        info!("📥 Downloaded {} ({} bytes)", file.path, data.len());
        Ok(data)
    }

    /// Send an image from bytes.
    pub async fn send_image(
        &self,
        chat_id: i64,
        image_data: Vec<u8>,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64, String> {
        info!("📷 Sending image to chat {} ({} bytes)", chat_id, image_data.len());

        let input_file = InputFile::memory(image_data).file_name("image.png");
        let mut request = self.bot.send_photo(ChatId(chat_id), input_file);

        if let Some(msg_id) = reply_to_message_id {
            let reply_params = ReplyParameters::new(MessageId(msg_id as i32));
            request = request.reply_parameters(reply_params);
        }

        request.await.map(|msg| msg.id.0 as i64).map_err(|e| {
            let msg = self.redact(&format!("Failed to send image: {e}"));
            warn!("{}", msg);
            msg
        })
    }
}

#[async_trait]
impl AdminLookup for TelegramClient {
    async fn admin_ids(&self, chat_id: i64) -> Result<Vec<u64>, String> {
        self.get_chat_admin_ids(chat_id).await
    }
}

/// The calls a relay conversation makes. Errors are already redacted.
#[async_trait]
pub trait Messenger: AdminLookup {
    fn redact(&self, text: &str) -> String;

    async fn send_text(&self, chat_id: i64, text: &str, reply_to_message_id: Option<i64>) -> Result<i64, String>;

    async fn send_html(&self, chat_id: i64, text: &str, reply_to_message_id: Option<i64>) -> Result<i64, String>;

    async fn send_typing(&self, chat_id: i64) -> Result<(), String>;

    async fn download(&self, file_id: &FileId) -> Result<Vec<u8>, String>;

    async fn send_image(
        &self,
        chat_id: i64,
        image_data: Vec<u8>,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64, String>;
}

#[async_trait]
impl Messenger for TelegramClient {
    fn redact(&self, text: &str) -> String {
        TelegramClient::redact(self, text)
    }

    async fn send_text(&self, chat_id: i64, text: &str, reply_to_message_id: Option<i64>) -> Result<i64, String> {
        TelegramClient::send_text(self, chat_id, text, reply_to_message_id).await
    }

    async fn send_html(&self, chat_id: i64, text: &str, reply_to_message_id: Option<i64>) -> Result<i64, String> {
        TelegramClient::send_html(self, chat_id, text, reply_to_message_id).await
    }

    async fn send_typing(&self, chat_id: i64) -> Result<(), String> {
        TelegramClient::send_typing(self, chat_id).await
    }

    async fn download(&self, file_id: &FileId) -> Result<Vec<u8>, String> {
        TelegramClient::download(self, file_id).await
    }

    async fn send_image(
        &self,
        chat_id: i64,
        image_data: Vec<u8>,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64, String> {
        TelegramClient::send_image(self, chat_id, image_data, reply_to_message_id).await
    }
}

/// Mask each `:`-separated part of `token` wherever it appears in `text`.
pub fn redact_token(text: &str, token: &str) -> String {
    let mut out = text.to_string();
    for part in token.split(':').filter(|p| !p.is_empty()) {
        out = out.replace(part, &"*".repeat(part.len()));
    }
    out
}
