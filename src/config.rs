use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file '{}': {source}", path.display())]
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    #[error("failed to parse config file '{}': {source}", path.display())]
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// A plugin or job entry has options its factory cannot accept.
    #[error("invalid options for '{name}': {source}")]
    Options { name: String, source: serde_json::Error },
    /// No plugin or job registered under this name.
    #[error("unknown {kind} '{name}'")]
    Unknown { kind: &'static str, name: String },
    /// Validation error.
    #[error("config validation error: {0}")]
    Validation(String),
}

#[derive(Deserialize)]
struct ConfigFile {
    token: String,
    #[serde(default = "default_listen")]
    listen: String,
    /// Public webhook URL. Long polling is used when absent.
    webhook: Option<String>,
    secret: Option<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
    /// Directory for state files (logs, history). Defaults to current directory.
    data_dir: Option<String>,
    log_chat_id: Option<i64>,
    database: Option<DatabaseFile>,
    #[serde(default)]
    plugins: Vec<Entry>,
    #[serde(default)]
    jobs: Vec<Entry>,
}

#[derive(Deserialize)]
struct DatabaseFile {
    path: Option<String>,
    #[serde(alias = "IWAKU_GROUP_ID")]
    supervising_chat_id: i64,
    #[serde(default)]
    use_text_search: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A named plugin or job entry. Options stay untyped until the registry
/// hands them to the matching factory.
#[derive(Debug, Clone, Deserialize)]
pub struct Entry {
    pub name: String,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl Entry {
    /// Deserialize this entry's options into a typed config struct.
    pub fn options<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(serde_json::Value::Object(self.options.clone())).map_err(|source| {
            ConfigError::Options { name: self.name.clone(), source }
        })
    }
}

/// History store settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// Chat whose history is searched and whose admins may search it.
    pub supervising_chat_id: i64,
    /// Use the FTS5 text index instead of the exact token table.
    pub use_text_search: bool,
}

#[derive(Debug)]
pub struct Config {
    pub token: String,
    pub listen: SocketAddr,
    pub webhook: Option<reqwest::Url>,
    pub secret: Option<String>,
    pub log_level: String,
    pub data_dir: PathBuf,
    pub log_chat_id: Option<i64>,
    pub database: Option<DatabaseConfig>,
    pub plugins: Vec<Entry>,
    pub jobs: Vec<Entry>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.token.is_empty() {
            return Err(ConfigError::Validation("token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "token appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }

        let listen: SocketAddr = file
            .listen
            .parse()
            .map_err(|e| ConfigError::Validation(format!("listen '{}' is not host:port: {e}", file.listen)))?;

        let webhook = file
            .webhook
            .map(|url| {
                reqwest::Url::parse(&url)
                    .map_err(|e| ConfigError::Validation(format!("webhook '{url}' is not a URL: {e}")))
            })
            .transpose()?;

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let database = file.database.map(|db| DatabaseConfig {
            path: db
                .path
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("history.db")),
            supervising_chat_id: db.supervising_chat_id,
            use_text_search: db.use_text_search,
        });

        for entry in file.plugins.iter().chain(file.jobs.iter()) {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::Validation("plugin and job entries need a name".into()));
            }
        }

        Ok(Self {
            token: file.token,
            listen,
            webhook,
            secret: file.secret,
            log_level: file.log_level.to_lowercase(),
            data_dir,
            log_chat_id: file.log_chat_id,
            database,
            plugins: file.plugins,
            jobs: file.jobs,
        })
    }
}
