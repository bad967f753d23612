//! Update routing and the dispatcher runner.

use std::net::SocketAddr;
use std::sync::Arc;

use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::{InlineQuery, Message};
use teloxide::update_listeners::webhooks;
use teloxide::RequestError;
use tracing::{debug, info};

use crate::plugin::{BotContext, Command, Plugins, message_text, parse_command};

pub const GREETING: &str = "`Hello World!`";

/// Shared state handed to every update handler.
pub struct App {
    pub ctx: BotContext,
    pub plugins: Plugins,
}

/// Where updates come from.
pub enum Transport {
    Polling,
    Webhook {
        listen: SocketAddr,
        url: reqwest::Url,
        secret: Option<String>,
    },
}

pub fn schema() -> UpdateHandler<RequestError> {
    dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_edited_message().endpoint(handle_edited_message))
        .branch(Update::filter_inline_query().endpoint(handle_inline_query))
}

/// Built-in commands answered before any plugin.
async fn builtin_command(app: &App, msg: &Message, command: &Command<'_>) {
    let ctx = &app.ctx;
    match command.name {
        "start" => {
            let _ = ctx.telegram.send_markdown(msg.chat.id.0, GREETING, Some(msg.id.0 as i64)).await;
        }
        "locate" => {
            if let Some(history) = &ctx.history {
                history.locate(&ctx.telegram, msg, command.args).await;
            }
        }
        _ => {}
    }
}

async fn handle_message(msg: Message, app: Arc<App>) -> ResponseResult<()> {
    if let Some(history) = &app.ctx.history {
        history.record(&msg).await;
    }

    if let Some(command) = message_text(&msg).and_then(parse_command)
        && command.is_for(&app.ctx.bot_username)
    {
        builtin_command(&app, &msg, &command).await;
    }

    app.plugins.dispatch(&app.ctx, &msg).await;
    Ok(())
}

async fn handle_edited_message(msg: Message, app: Arc<App>) -> ResponseResult<()> {
    if let Some(history) = &app.ctx.history {
        debug!("edit of message {} in chat {}", msg.id, msg.chat.id);
        history.record(&msg).await;
    }
    Ok(())
}

async fn handle_inline_query(query: InlineQuery, app: Arc<App>) -> ResponseResult<()> {
    if let Some(history) = &app.ctx.history {
        history.answer_inline(&app.ctx.telegram, &query).await;
    }
    Ok(())
}

/// Run the dispatcher until ctrl-c.
pub async fn run(bot: Bot, app: Arc<App>, transport: Transport) -> Result<(), RequestError> {
    let mut dispatcher = Dispatcher::builder(bot.clone(), schema())
        .dependencies(dptree::deps![app])
        .enable_ctrlc_handler()
        .build();

    match transport {
        Transport::Polling => {
            info!("📡 Long polling");
            dispatcher.dispatch().await;
        }
        Transport::Webhook { listen, url, secret } => {
            info!("📡 Listening on {} for {}", listen, url.path());
            let mut options = webhooks::Options::new(listen, url);
            if let Some(secret) = secret {
                options = options.secret_token(secret);
            }
            let listener = webhooks::axum(bot, options).await?;
            dispatcher
                .dispatch_with_listener(listener, LoggingErrorHandler::with_custom_text("update listener error"))
                .await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_builds() {
        let _ = schema();
    }
}
