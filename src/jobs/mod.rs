//! Scheduled jobs, each polled on its own interval.

pub mod bilibili;
pub mod pizza;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConfigError, Entry};
use crate::telegram::TelegramClient;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum JobError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("failed to notify: {0}")]
    Notify(String),
}

#[async_trait]
pub trait Job: Send {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    async fn tick(&mut self, telegram: &TelegramClient) -> Result<(), JobError>;
}

/// A chat id or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChatIds {
    One(i64),
    Many(Vec<i64>),
}

impl ChatIds {
    pub fn to_vec(&self) -> Vec<i64> {
        match self {
            ChatIds::One(id) => vec![*id],
            ChatIds::Many(ids) => ids.clone(),
        }
    }
}

impl Default for ChatIds {
    fn default() -> Self {
        ChatIds::Many(Vec::new())
    }
}

/// Client for polling public web APIs with browser-like headers.
pub(crate) fn http_client(extra: &[(&'static str, &'static str)]) -> Result<reqwest::Client, ConfigError> {
    let mut headers = HeaderMap::new();
    headers.insert("accept", HeaderValue::from_static("application/json, text/plain, */*"));
    headers.insert("cache-control", HeaderValue::from_static("no-cache"));
    headers.insert("pragma", HeaderValue::from_static("no-cache"));
    for (name, value) in extra {
        headers.insert(*name, HeaderValue::from_static(*value));
    }

    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| ConfigError::Validation(format!("failed to build HTTP client: {e}")))
}

/// Send `text` to every chat. Every chat is attempted; the first failure is
/// returned.
pub(crate) async fn notify_all(
    telegram: &TelegramClient,
    chat_ids: &[i64],
    text: &str,
    html: bool,
) -> Result<(), JobError> {
    let mut first_error = None;
    for &chat_id in chat_ids {
        let sent = if html {
            telegram.send_html(chat_id, text, None).await
        } else {
            telegram.send_text(chat_id, text, None).await
        };
        if let Err(e) = sent {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(JobError::Notify(e)),
        None => Ok(()),
    }
}

pub type JobFactory = fn(&Entry) -> Result<Box<dyn Job>, ConfigError>;

pub struct JobRegistry {
    factories: BTreeMap<&'static str, JobFactory>,
}

impl JobRegistry {
    pub fn with_builtins() -> Self {
        let mut factories: BTreeMap<&'static str, JobFactory> = BTreeMap::new();
        factories.insert("bilibili_live", bilibili::build);
        factories.insert("pizza_index", pizza::build);
        Self { factories }
    }

    pub fn build(&self, entry: &Entry) -> Result<Box<dyn Job>, ConfigError> {
        let factory = self.factories.get(entry.name.as_str()).ok_or_else(|| ConfigError::Unknown {
            kind: "job",
            name: entry.name.clone(),
        })?;
        factory(entry)
    }

    pub fn build_all(&self, entries: &[Entry]) -> Result<Vec<Box<dyn Job>>, ConfigError> {
        entries.iter().map(|entry| self.build(entry)).collect()
    }
}

/// Run `job` forever on its interval. Failures are logged and the loop continues.
pub fn spawn(mut job: Box<dyn Job>, telegram: TelegramClient) -> JoinHandle<()> {
    info!("⏰ Scheduling job {} every {:?}", job.name(), job.interval());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(job.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = job.tick(&telegram).await {
                warn!("Job {} failed: {}", job.name(), telegram.redact(&e.to_string()));
            }
        }
    })
}
