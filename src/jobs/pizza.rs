//! Pentagon pizza index (DEFCON) watcher.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Asia::Shanghai;
use serde::Deserialize;
use tracing::{info, warn};

use super::{ChatIds, Job, JobError, http_client, notify_all};
use crate::config::{ConfigError, Entry};
use crate::telegram::TelegramClient;

const DASHBOARD_URL: &str = "https://www.pizzint.watch/api/dashboard-data";

fn default_interval() -> u64 {
    300
}

#[derive(Deserialize)]
struct PizzaOptions {
    #[serde(default)]
    chat_id: ChatIds,
    #[serde(default = "default_interval")]
    interval_secs: u64,
}

pub fn build(entry: &Entry) -> Result<Box<dyn Job>, ConfigError> {
    let options: PizzaOptions = entry.options()?;
    Ok(Box::new(PizzaIndex {
        http: http_client(&[])?,
        chat_ids: options.chat_id.to_vec(),
        interval: Duration::from_secs(options.interval_secs.max(1)),
        level: None,
    }))
}

/// One dashboard reading.
#[derive(Deserialize, Debug, Clone)]
pub struct Reading {
    #[serde(default)]
    pub success: bool,
    #[serde(default = "unknown_level")]
    pub defcon_level: i64,
    #[serde(default)]
    pub defcon_details: Option<DefconDetails>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DefconDetails {
    pub at_time: Option<String>,
}

fn unknown_level() -> i64 {
    -1
}

impl Reading {
    pub fn is_valid(&self) -> bool {
        self.success && self.defcon_level != -1
    }

    /// Time of the reading, falling back to `now`.
    fn at_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.defcon_details
            .as_ref()
            .and_then(|d| d.at_time.as_deref())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(now)
    }
}

pub struct PizzaIndex {
    http: reqwest::Client,
    chat_ids: Vec<i64>,
    interval: Duration,
    /// Last announced level.
    level: Option<i64>,
}

/// HTML notice for a level change, or `None` when nothing changed. A lower
/// level means higher risk.
pub fn announcement(previous: Option<i64>, reading: &Reading, now: DateTime<Utc>) -> Option<String> {
    let current = reading.defcon_level;
    let text = match previous {
        Some(previous) if previous == current => return None,
        Some(previous) => {
            let trend = if current < previous { "raised" } else { "lowered" };
            format!("Pizza index risk {trend} from <b>DEFCON {previous}</b> to <b>DEFCON {current}</b>")
        }
        None => {
            let at = reading.at_time(now).with_timezone(&Shanghai);
            format!(
                "Current pizza index: <b>DEFCON {current}</b>\n<i>Updated {} (Asia/Shanghai)</i>",
                at.format("%Y-%m-%d %H:%M:%S")
            )
        }
    };
    Some(format!("{text}\n<i>lower index means higher risk</i>"))
}

impl PizzaIndex {
    async fn fetch(&self) -> Result<Reading, JobError> {
        let body = self.http.get(DASHBOARD_URL).send().await?.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl Job for PizzaIndex {
    fn name(&self) -> &str {
        "pizza_index"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&mut self, telegram: &TelegramClient) -> Result<(), JobError> {
        let reading = self.fetch().await?;
        if !reading.is_valid() {
            warn!("failed to get pizza index: {:?}", reading);
            return Ok(());
        }

        let Some(text) = announcement(self.level, &reading, Utc::now()) else {
            return Ok(());
        };
        info!("🍕 DEFCON {:?} → {}", self.level, reading.defcon_level);
        // Recorded before sending; failed sends are not retried.
        self.level = Some(reading.defcon_level);
        notify_all(telegram, &self.chat_ids, &text, true).await
    }
}
