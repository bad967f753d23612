//! Plugin trait, handler context and the name → factory registry.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use teloxide::types::Message;
use tracing::{debug, info};

use crate::config::{ConfigError, Entry};
use crate::history::History;
use crate::telegram::TelegramClient;

/// Everything a handler may touch, passed explicitly to each call.
#[derive(Clone)]
pub struct BotContext {
    pub telegram: TelegramClient,
    /// Username without the leading `@`.
    pub bot_username: String,
    pub history: Option<Arc<History>>,
}

/// A parsed slash command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command<'a> {
    pub name: &'a str,
    /// The `@botname` suffix, if present.
    pub mention: Option<&'a str>,
    /// Everything after the first word, trimmed.
    pub args: &'a str,
}

impl Command<'_> {
    /// Whether the command is addressed to us (no mention, or our username).
    pub fn is_for(&self, bot_username: &str) -> bool {
        self.mention.is_none_or(|m| m.eq_ignore_ascii_case(bot_username))
    }
}

/// Parse the first word of `text` as a `/command[@bot]`.
pub fn parse_command(text: &str) -> Option<Command<'_>> {
    let rest = text.strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    let (name, mention) = match head.split_once('@') {
        Some((name, mention)) => (name, Some(mention)),
        None => (head, None),
    };
    if name.is_empty() {
        return None;
    }
    Some(Command { name, mention, args })
}

/// Text or caption of a message.
pub fn message_text(msg: &Message) -> Option<&str> {
    msg.text().or_else(|| msg.caption())
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Command names this plugin answers.
    fn commands(&self) -> Vec<String> {
        Vec::new()
    }

    async fn on_command(&self, _ctx: &BotContext, _msg: &Message, _command: &Command<'_>) {}

    /// Passive listener, called for every new message.
    async fn on_message(&self, _ctx: &BotContext, _msg: &Message) {}
}

pub type PluginFactory = fn(&Entry) -> Result<Arc<dyn Plugin>, ConfigError>;

pub struct PluginRegistry {
    factories: BTreeMap<&'static str, PluginFactory>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self { factories: BTreeMap::new() }
    }

    /// Registry with every built-in plugin.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("openai", crate::relay::openai::build);
        registry.register("openai_compatible", crate::relay::openai::build_compatible);
        registry.register("anthropic", crate::relay::anthropic::build);
        registry.register("gemini", crate::relay::gemini::build);
        registry.register("saucenao", crate::saucenao::build);
        registry.register("megaphone", crate::megaphone::build);
        registry.register("chatterbox", crate::chatterbox::build);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: PluginFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    pub fn build(&self, entry: &Entry) -> Result<Arc<dyn Plugin>, ConfigError> {
        let factory = self.factories.get(entry.name.as_str()).ok_or_else(|| ConfigError::Unknown {
            kind: "plugin",
            name: entry.name.clone(),
        })?;
        factory(entry)
    }

    /// Build every configured plugin. Two plugins claiming the same command
    /// is a config error.
    pub fn build_all(&self, entries: &[Entry]) -> Result<Plugins, ConfigError> {
        let mut plugins = Vec::with_capacity(entries.len());
        let mut claimed = HashSet::new();

        for entry in entries {
            let plugin = self.build(entry)?;
            for command in plugin.commands() {
                if !claimed.insert(command.clone()) {
                    return Err(ConfigError::Validation(format!(
                        "command /{command} is claimed by more than one plugin"
                    )));
                }
            }
            info!("🔌 Loaded plugin {} (commands: {:?})", plugin.name(), plugin.commands());
            plugins.push(plugin);
        }

        Ok(Plugins { plugins })
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// The loaded plugins, in config order.
#[derive(Clone, Default)]
pub struct Plugins {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Plugins {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Route a new message: command owners first, then every passive listener.
    pub async fn dispatch(&self, ctx: &BotContext, msg: &Message) {
        if let Some(command) = message_text(msg).and_then(parse_command) {
            if command.is_for(&ctx.bot_username) {
                for plugin in &self.plugins {
                    if plugin.commands().iter().any(|c| c == command.name) {
                        debug!("/{} → {}", command.name, plugin.name());
                        plugin.on_command(ctx, msg, &command).await;
                    }
                }
            }
        }

        for plugin in &self.plugins {
            plugin.on_message(ctx, msg).await;
        }
    }
}
