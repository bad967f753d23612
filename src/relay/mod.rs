//! AI chat relays: a command forwards the conversation to a model backend
//! and replies with its answer.

pub mod anthropic;
pub mod gemini;
pub mod markdown;
pub mod openai;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use teloxide::types::{FileId, Message};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use self::markdown::to_telegram_html;
use crate::config::ConfigError;
use crate::memory::{ConversationMemory, thread_id};
use crate::plugin::{BotContext, Command, Plugin};
use crate::telegram::Messenger;
use crate::typing::with_ticker;
use crate::whitelist::WhitelistCache;

/// Telegram's limit is 4096; leave room for entities.
pub const MAX_REPLY_CHARS: usize = 4000;
const TYPING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Empty response: {0}")]
    Empty(String),
    #[error("{0}")]
    Telegram(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// An image attached to a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Image {
    pub fn base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64())
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub images: Vec<Image>,
    /// Sender id for user turns, where the backend accepts it.
    pub name: Option<String>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into(), images: Vec::new(), name: None }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, text: text.into(), images: Vec::new(), name: None }
    }
}

/// What a backend answered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// Generated image bytes, sent back as a photo.
    pub image: Option<Vec<u8>>,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Short name for logs.
    fn kind(&self) -> &'static str;

    async fn complete(&self, transcript: &[Turn]) -> Result<Reply, RelayError>;
}

/// Generation requests can run for minutes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

pub(crate) fn http_client() -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ConfigError::Validation(format!("failed to build HTTP client: {e}")))
}

/// Read a response body, turning non-2xx statuses into `RelayError::Api`.
pub(crate) async fn response_body(response: reqwest::Response) -> Result<String, RelayError> {
    let status = response.status();
    let body = response.text().await?;
    debug!("response status: {status}");
    if !status.is_success() {
        return Err(RelayError::Api { status: status.as_u16(), body });
    }
    Ok(body)
}

fn default_memory_size() -> usize {
    10
}

fn default_max_attachment_size() -> u64 {
    10 * 1024 * 1024
}

/// Options every relay shares.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayOptions {
    pub command: Option<String>,
    #[serde(default = "default_memory_size")]
    pub memory_size: usize,
    #[serde(default)]
    pub whitelist_chat: Vec<i64>,
    /// Bytes, or a string such as `"10MiB"`.
    #[serde(default = "default_max_attachment_size", deserialize_with = "deserialize_size")]
    pub max_attachment_size: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeSpec {
    Bytes(u64),
    Text(String),
}

fn deserialize_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match SizeSpec::deserialize(deserializer)? {
        SizeSpec::Bytes(n) => Ok(n),
        SizeSpec::Text(s) => {
            parse_size(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid size '{s}'")))
        }
    }
}

/// Parse sizes like `512`, `64KB` or `10MiB`.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "kib" => 1 << 10,
        "m" | "mb" => 1_000_000,
        "mib" => 1 << 20,
        "g" | "gb" => 1_000_000_000,
        "gib" => 1 << 30,
        _ => return None,
    };
    Some((number * multiplier as f64) as u64)
}

/// Split `text` into chunks of at most `limit` characters, preferring to
/// break after a newline.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > limit {
        let cut = rest.char_indices().nth(limit).map(|(i, _)| i).unwrap_or(rest.len());
        let split = rest[..cut].rfind('\n').filter(|&i| i > 0).map(|i| i + 1).unwrap_or(cut);
        chunks.push(rest[..split].to_string());
        rest = &rest[split..];
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Guess an image mime type from a file name.
fn image_mime_from_name(file_name: &str) -> Option<&'static str> {
    let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

/// A downloadable image found on a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_id: FileId,
    pub size: u64,
    pub mime_type: String,
}

/// The largest photo, or an image document.
///
/// `Err(())` means the message carries a non-image document.
#[allow(clippy::result_unit_err)]
pub fn find_image(msg: &Message) -> Result<Option<Attachment>, ()> {
    if let Some(photos) = msg.photo() {
        return Ok(photos.iter().max_by_key(|p| p.width).map(|p| Attachment {
            file_id: p.file.id.clone(),
            size: p.file.size as u64,
            mime_type: "image/jpeg".to_string(),
        }));
    }

    if let Some(doc) = msg.document() {
        let mime = doc
            .mime_type
            .as_ref()
            .map(|m| m.to_string())
            .filter(|m| m.starts_with("image/"))
            .or_else(|| {
                doc.file_name
                    .as_deref()
                    .and_then(image_mime_from_name)
                    .map(str::to_string)
            });
        return match mime {
            Some(mime_type) => Ok(Some(Attachment {
                file_id: doc.file.id.clone(),
                size: doc.file.size as u64,
                mime_type,
            })),
            None => Err(()),
        };
    }

    Ok(None)
}

/// A command that relays conversations to one backend.
pub struct RelayPlugin {
    name: &'static str,
    command: String,
    backend: Box<dyn ChatBackend>,
    memory: Mutex<ConversationMemory<Vec<Turn>>>,
    whitelist: WhitelistCache,
    max_attachment_size: u64,
    /// Attach the sender id to user turns.
    name_user_turns: bool,
}

impl RelayPlugin {
    pub fn new(
        name: &'static str,
        options: RelayOptions,
        backend: Box<dyn ChatBackend>,
    ) -> Self {
        let command = options.command.unwrap_or_else(|| name.to_string());
        info!(
            "{} relay on /{} (memory {}, whitelist {:?})",
            backend.kind(),
            command,
            options.memory_size,
            options.whitelist_chat
        );
        Self {
            name,
            command,
            backend,
            memory: Mutex::new(ConversationMemory::new(options.memory_size)),
            whitelist: WhitelistCache::new(options.whitelist_chat),
            max_attachment_size: options.max_attachment_size,
            name_user_turns: false,
        }
    }

    pub fn with_named_turns(mut self) -> Self {
        self.name_user_turns = true;
        self
    }

    fn recall(&self, thread: &str) -> Option<Vec<Turn>> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner()).recall(thread)
    }

    fn remember(&self, thread: &str, transcript: Vec<Turn>) {
        self.memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remember(thread, transcript);
    }

    async fn reply(&self, chat: &dyn Messenger, target: &Message, text: &str) {
        let _ = chat.send_text(target.chat.id.0, text, Some(target.id.0 as i64)).await;
    }

    /// Build the user turn, replying with the reason when there is none.
    async fn user_turn(
        &self,
        chat: &dyn Messenger,
        bot_username: &str,
        msg: &Message,
        target: &Message,
        prompt: &str,
    ) -> Option<Turn> {
        if prompt.is_empty() {
            let hint = format!("Usage: /{}@{} hello", self.command, bot_username);
            self.reply(chat, target, &hint).await;
            return None;
        }

        let mut turn = Turn::user(prompt);
        if self.name_user_turns {
            turn.name = msg.from.as_ref().map(|u| u.id.0.to_string());
        }

        if msg.caption().is_none() {
            return Some(turn);
        }

        let attachment = match find_image(msg) {
            Ok(Some(attachment)) => attachment,
            Ok(None) | Err(()) => {
                self.reply(chat, target, "Only images are supported as attachments.").await;
                return None;
            }
        };

        if attachment.size > self.max_attachment_size {
            let notice = format!(
                "Attachment is too large ({} bytes, limit {}).",
                attachment.size, self.max_attachment_size
            );
            self.reply(chat, target, &notice).await;
            return None;
        }

        match chat.download(&attachment.file_id).await {
            Ok(data) => {
                turn.images.push(Image { mime_type: attachment.mime_type, data });
                Some(turn)
            }
            Err(e) => {
                self.reply(chat, target, &e).await;
                None
            }
        }
    }

    /// Send the reply text in chunks and any image. Returns the id of the
    /// last text message sent, or of the image when there was no text.
    async fn deliver(&self, chat: &dyn Messenger, target: &Message, reply: Reply) -> Option<i64> {
        let chat_id = target.chat.id.0;
        let reply_to = Some(target.id.0 as i64);
        let mut last = None;

        for chunk in split_message(&reply.text, MAX_REPLY_CHARS) {
            let sent = match chat.send_html(chat_id, &to_telegram_html(&chunk), reply_to).await {
                Ok(id) => Ok(id),
                Err(e) => {
                    debug!("HTML reply rejected, resending as plain text: {e}");
                    chat.send_text(chat_id, &chunk, reply_to).await
                }
            };
            match sent {
                Ok(id) => last = Some(id),
                Err(_) => return last,
            }
        }

        if let Some(image) = reply.image {
            if let Ok(id) = chat.send_image(chat_id, image, reply_to).await {
                last = last.or(Some(id));
            }
        }

        last
    }

    /// One relay command from `msg`, with `prompt` as the command arguments.
    async fn handle(&self, chat: &dyn Messenger, bot_username: &str, msg: &Message, prompt: &str) {
        let Some(sender) = msg.from.as_ref() else {
            return;
        };
        if !self.whitelist.is_allowed(sender.id.0, chat).await {
            debug!("/{} denied for user {}", self.command, sender.id);
            return;
        }

        let (target, mut transcript) = match msg.reply_to_message() {
            Some(target) => {
                if !target.from.as_ref().is_some_and(|u| u.is_bot) {
                    self.reply(chat, target, "This doesn't look like a bot conversation.").await;
                    return;
                }
                let thread = thread_id(target.chat.id.0, target.id.0 as i64);
                (target, self.recall(&thread).unwrap_or_default())
            }
            None => (msg, Vec::new()),
        };

        let Some(turn) = self.user_turn(chat, bot_username, msg, target, prompt).await else {
            return;
        };
        transcript.push(turn);

        let chat_id = target.chat.id.0;
        info!(
            "💬 /{} from {} in chat {} ({} turns)",
            self.command,
            sender.id,
            chat_id,
            transcript.len()
        );

        if let Err(e) = chat.send_typing(chat_id).await {
            warn!("{}", e);
        }

        let result = with_ticker(
            self.backend.complete(&transcript),
            move || async move { chat.send_typing(chat_id).await.map_err(RelayError::Telegram) },
            TYPING_INTERVAL,
        )
        .await
        .and_then(|reply| {
            if reply.text.trim().is_empty() && reply.image.is_none() {
                return Err(RelayError::Empty(format!("{} returned nothing", self.backend.kind())));
            }
            Ok(reply)
        });

        match result {
            Ok(reply) => {
                transcript.push(Turn::assistant(reply.text.clone()));
                if let Some(last_id) = self.deliver(chat, target, reply).await {
                    self.remember(&thread_id(chat_id, last_id), transcript);
                }
            }
            Err(e) => {
                let text = chat.redact(&e.to_string());
                error!("{} relay failed: {}", self.backend.kind(), text);
                self.reply(chat, target, &text).await;
            }
        }
    }
}

#[async_trait]
impl Plugin for RelayPlugin {
    fn name(&self) -> &str {
        self.name
    }

    fn commands(&self) -> Vec<String> {
        vec![self.command.clone()]
    }

    async fn on_command(&self, ctx: &BotContext, msg: &Message, command: &Command<'_>) {
        self.handle(&ctx.telegram, &ctx.bot_username, msg, command.args).await;
    }
}
