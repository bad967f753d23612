//! Tracing layer that mirrors log lines into a Telegram chat.

use std::time::Duration;

use teloxide::prelude::*;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::telegram::redact_token;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BUFFERED: usize = 50;
const MAX_MESSAGE_CHARS: usize = 4000;

enum LogLine {
    /// WARN/ERROR, sent right away.
    Urgent(String),
    /// INFO, batched.
    Info(String),
}

pub struct TelegramLogLayer {
    tx: mpsc::UnboundedSender<LogLine>,
}

impl TelegramLogLayer {
    /// Must be called inside a tokio runtime.
    pub fn new(bot: Bot, chat_id: i64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(bot, ChatId(chat_id), rx));
        Self { tx }
    }
}

async fn forward(bot: Bot, chat_id: ChatId, mut rx: mpsc::UnboundedReceiver<LogLine>) {
    let mut buffer: Vec<String> = Vec::new();
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(LogLine::Urgent(text)) => send_log(&bot, chat_id, &text).await,
                Some(LogLine::Info(text)) => {
                    buffer.push(text);
                    if buffer.len() >= MAX_BUFFERED {
                        flush(&bot, chat_id, &mut buffer).await;
                    }
                }
                None => {
                    flush(&bot, chat_id, &mut buffer).await;
                    break;
                }
            },
            _ = interval.tick() => flush(&bot, chat_id, &mut buffer).await,
        }
    }
}

async fn flush(bot: &Bot, chat_id: ChatId, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let combined = buffer.join("\n");
    buffer.clear();
    send_log(bot, chat_id, &combined).await;
}

/// Redact the token and clip to one Telegram message.
pub fn prepare(text: &str, token: &str) -> String {
    let text = redact_token(text, token);
    if text.chars().count() > MAX_MESSAGE_CHARS {
        let clipped: String = text.chars().take(MAX_MESSAGE_CHARS).collect();
        format!("{clipped}...")
    } else {
        text
    }
}

async fn send_log(bot: &Bot, chat_id: ChatId, text: &str) {
    let text = prepare(text, bot.token());
    // Not a tracing call: it would loop back into this layer.
    if let Err(e) = bot.send_message(chat_id, text).await {
        eprintln!("{}", redact_token(&format!("Failed to send log to Telegram: {e}"), bot.token()));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}{}", value, self.message);
        } else {
            self.message.push_str(&format!(", {} = {:?}", field.name(), value));
        }
    }
}

impl<S: Subscriber> Layer<S> for TelegramLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::INFO {
            return;
        }
        // HTTP internals would echo our own sends.
        let target = event.metadata().target();
        if target.starts_with("hyper") || target.starts_with("reqwest") || target.starts_with("teloxide") {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let line = match level {
            Level::ERROR => LogLine::Urgent(format!("❌ {}", visitor.message)),
            Level::WARN => LogLine::Urgent(format!("⚠️ {}", visitor.message)),
            _ => LogLine::Info(visitor.message),
        };
        let _ = self.tx.send(line);
    }
}
