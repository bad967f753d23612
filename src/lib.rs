pub mod bot;
pub mod chatterbox;
pub mod config;
pub mod history;
pub mod jobs;
pub mod megaphone;
pub mod memory;
pub mod plugin;
pub mod relay;
pub mod saucenao;
pub mod telegram;
pub mod telegram_log;
pub mod tokenize;
pub mod typing;
pub mod whitelist;
