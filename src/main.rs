use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use teloxide::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use relaybot::bot::{self, App, Transport};
use relaybot::config::Config;
use relaybot::history::History;
use relaybot::jobs::{self, JobRegistry};
use relaybot::plugin::{BotContext, PluginRegistry};
use relaybot::telegram::TelegramClient;
use relaybot::telegram_log::TelegramLogLayer;
use relaybot::tokenize::Tokenizer;

#[derive(Parser)]
#[command(about = "Telegram group bot with history search and AI relays")]
struct Args {
    /// Configuration JSON file.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper=warn,reqwest=warn")))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.token);

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Failed to create log directory {}: {e}", log_dir.display());
        std::process::exit(1);
    }
    let (file_writer, _guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, "bot.log"));

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(env_filter(&config.log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(env_filter(&config.log_level)),
        );
    match config.log_chat_id {
        Some(chat_id) => registry.with(TelegramLogLayer::new(bot.clone(), chat_id)).init(),
        None => registry.init(),
    }

    info!("🚀 Starting relaybot");
    info!("Loaded config from {}", args.config.display());

    if let Err(e) = run(config, bot).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: Config, bot: Bot) -> Result<(), Box<dyn std::error::Error>> {
    let telegram = TelegramClient::new(bot.clone());

    let history = match &config.database {
        Some(database) => {
            let tokenizer = Arc::new(Tokenizer::new());
            let history = History::open(database, tokenizer)?;
            info!(
                "📚 History at {} ({:?}, {} messages), supervising chat {}",
                database.path.display(),
                history.store().mode(),
                history.store().count()?,
                database.supervising_chat_id
            );
            Some(Arc::new(history))
        }
        None => {
            info!("History disabled (no database section)");
            None
        }
    };

    let plugins = PluginRegistry::with_builtins().build_all(&config.plugins)?;
    info!("🔌 {} plugin(s) loaded", plugins.len());

    for job in JobRegistry::with_builtins().build_all(&config.jobs)? {
        jobs::spawn(job, telegram.clone());
    }

    let me = bot.get_me().await.map_err(|e| telegram.redact(&format!("getMe failed: {e}")))?;
    let bot_username = me.username().to_string();
    info!("Bot user ID: {}, username: @{}", me.id, bot_username);

    let app = Arc::new(App {
        ctx: BotContext { telegram, bot_username, history },
        plugins,
    });

    let transport = match config.webhook {
        Some(url) => Transport::Webhook { listen: config.listen, url, secret: config.secret },
        None => {
            warn!("No webhook configured, falling back to long polling");
            Transport::Polling
        }
    };

    bot::run(bot, app, transport)
        .await
        .map_err(|e| format!("dispatcher failed: {e}"))?;
    Ok(())
}
