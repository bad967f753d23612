//! Import a Telegram Desktop export into the history store.
//!
//! Usage: import_history <config.json> <result.json> [--drop]
//!
//! Export from Telegram Desktop: Settings → Advanced → Export Telegram Data,
//! JSON format, only the supervised group selected.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use teloxide::types::Message;
use tracing::{info, warn};

use relaybot::config::Config;
use relaybot::history::record;
use relaybot::history::{HistoryStore, IndexMode};
use relaybot::tokenize::Tokenizer;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(about = "Import a Telegram Desktop export into the history store")]
struct Args {
    /// Bot configuration (uses its `database` section).
    config: PathBuf,
    /// Telegram Desktop `result.json`.
    export: PathBuf,
    /// Delete all recorded history before importing.
    #[arg(long)]
    drop: bool,
}

#[derive(Deserialize)]
struct Export {
    #[serde(default)]
    name: String,
    /// `private_supergroup`, `public_supergroup`, `private_group`, ...
    #[serde(rename = "type", default)]
    kind: String,
    id: i64,
    messages: Vec<ExportMessage>,
}

#[derive(Deserialize)]
struct ExportMessage {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    date_unixtime: Option<String>,
    from: Option<String>,
    from_id: Option<String>,
    forwarded_from: Option<String>,
    #[serde(default)]
    text: Text,
}

/// Plain string, or a list of strings and formatted entities.
#[derive(Deserialize, Default)]
#[serde(untagged)]
enum Text {
    #[default]
    Empty,
    Plain(String),
    Parts(Vec<TextPart>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextPart {
    Plain(String),
    Entity { text: String },
}

impl Text {
    fn flatten(&self) -> String {
        match self {
            Text::Empty => String::new(),
            Text::Plain(s) => s.clone(),
            Text::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    TextPart::Plain(s) => s.as_str(),
                    TextPart::Entity { text } => text.as_str(),
                })
                .collect(),
        }
    }
}

/// Export ids are positive. Supergroups and channels take the -100 prefix in
/// the Bot API, basic groups are negated.
fn bot_api_chat_id(chat_type: &str, export_id: i64) -> i64 {
    if export_id <= 0 {
        return export_id;
    }
    if chat_type.ends_with("supergroup") || chat_type.ends_with("channel") {
        -1_000_000_000_000 - export_id
    } else {
        -export_id
    }
}

/// Rebuild a Bot API message for one export entry. Forwarded posts, service
/// entries and messages not sent by a user are skipped.
fn synthesize(entry: &ExportMessage, chat_id: i64, chat_title: &str) -> Option<Message> {
    if entry.kind != "message" || entry.forwarded_from.is_some() {
        return None;
    }
    let user_id: u64 = entry.from_id.as_deref()?.strip_prefix("user")?.parse().ok()?;
    let date: i64 = entry.date_unixtime.as_deref()?.parse().ok()?;
    let text = entry.text.flatten();
    if text.is_empty() {
        return None;
    }

    let value = json!({
        "message_id": entry.id,
        "date": date,
        "chat": {"id": chat_id, "type": "supergroup", "title": chat_title},
        "from": {"id": user_id, "is_bot": false, "first_name": entry.from.clone().unwrap_or_default()},
        "text": text,
    });
    serde_json::from_value(value).ok()
}

fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    if let Err(e) = run(&args, &config) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let database = config.database.as_ref().ok_or("config has no database section")?;
    let mode = if database.use_text_search { IndexMode::FullText } else { IndexMode::Tokens };
    let store = HistoryStore::open(&database.path, mode)?;

    if args.drop {
        warn!("Dropping all recorded history");
        store.clear()?;
    }

    info!("Reading {}", args.export.display());
    let content = std::fs::read_to_string(&args.export)?;
    let export: Export = serde_json::from_str(&content)?;
    let chat_id = bot_api_chat_id(&export.kind, export.id);
    info!("Chat: {} ({}, {}), {} entries", export.name, export.kind, chat_id, export.messages.len());

    let tokenizer = Tokenizer::new();
    let mut imported = 0usize;
    let mut skipped = 0usize;
    let mut last_report = Instant::now();

    for (parsed, entry) in export.messages.iter().enumerate() {
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            info!("parsed {:8} records...", parsed);
            last_report = Instant::now();
        }

        let Some(msg) = synthesize(entry, chat_id, &export.name) else {
            skipped += 1;
            continue;
        };
        let Some(observed) = record::observe(&msg) else {
            skipped += 1;
            continue;
        };
        let tokens = observed.tokens(&tokenizer);
        let doc = record::document(&msg, &observed, tokens)?;
        store.record(&doc)?;
        imported += 1;
    }

    info!("Imported {} messages ({} skipped), {} in store", imported, skipped, store.count()?);
    Ok(())
}
