//! Bilibili live-room watcher: announces when a room goes live.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{ChatIds, Job, JobError, http_client, notify_all};
use crate::config::{ConfigError, Entry};
use crate::telegram::TelegramClient;

const PLAY_INFO_URL: &str = "https://api.live.bilibili.com/xlive/web-room/v2/index/getRoomPlayInfo";
const LIVE: i64 = 1;

fn default_interval() -> u64 {
    60
}

#[derive(Deserialize)]
struct BilibiliOptions {
    rooms: Vec<u64>,
    #[serde(default)]
    chat_id: ChatIds,
    #[serde(default = "default_interval")]
    interval_secs: u64,
}

pub fn build(entry: &Entry) -> Result<Box<dyn Job>, ConfigError> {
    let options: BilibiliOptions = entry.options()?;
    let http = http_client(&[("origin", "https://live.bilibili.com")])?;
    Ok(Box::new(BilibiliLive::new(
        http,
        options.rooms,
        options.chat_id.to_vec(),
        Duration::from_secs(options.interval_secs.max(1)),
    )))
}

#[derive(Deserialize, Debug)]
struct PlayInfoResponse {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<PlayInfo>,
}

#[derive(Deserialize, Debug)]
struct PlayInfo {
    live_status: Option<i64>,
}

pub struct BilibiliLive {
    http: reqwest::Client,
    /// Last known live status per room; unknown rooms start at 0.
    status: HashMap<u64, i64>,
    rooms: Vec<u64>,
    chat_ids: Vec<i64>,
    interval: Duration,
}

impl BilibiliLive {
    pub fn new(http: reqwest::Client, rooms: Vec<u64>, chat_ids: Vec<i64>, interval: Duration) -> Self {
        let status = rooms.iter().map(|&room| (room, 0)).collect();
        Self { http, status, rooms, chat_ids, interval }
    }

    /// Record a status reading. True only on a transition into live.
    pub fn observe(&mut self, room: u64, live_status: i64) -> bool {
        let previous = self.status.insert(room, live_status).unwrap_or(0);
        previous != LIVE && live_status == LIVE
    }

    async fn live_status(&self, room: u64) -> Result<i64, JobError> {
        let room_id = room.to_string();
        let response = self
            .http
            .get(PLAY_INFO_URL)
            .query(&[
                ("room_id", room_id.as_str()),
                ("protocol", "0,1"),
                ("format", "0,1,2"),
                ("codec", "0,1,2"),
                ("qn", "0"),
                ("platform", "web"),
                ("ptype", "8"),
            ])
            .send()
            .await?;
        let body = response.text().await?;
        let parsed: PlayInfoResponse = serde_json::from_str(&body)?;
        debug!("room {} play info: {:?}", room, parsed);

        match parsed.data.and_then(|d| d.live_status) {
            Some(status) if parsed.code == 0 => Ok(status),
            _ => Err(JobError::Api(format!("room {room}: {}", parsed.message))),
        }
    }
}

pub fn announcement(room: u64) -> String {
    format!("Live now! https://live.bilibili.com/{room}")
}

#[async_trait]
impl Job for BilibiliLive {
    fn name(&self) -> &str {
        "bilibili_live"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&mut self, telegram: &TelegramClient) -> Result<(), JobError> {
        for room in self.rooms.clone() {
            let status = match self.live_status(room).await {
                Ok(status) => status,
                Err(e) => {
                    warn!("failed to get live info for {}: {}", room, e);
                    continue;
                }
            };

            if self.observe(room, status) {
                info!("📺 Room {} went live", room);
                if let Err(e) = notify_all(telegram, &self.chat_ids, &announcement(room), false).await {
                    warn!("{}", e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watcher() -> BilibiliLive {
        BilibiliLive::new(reqwest::Client::new(), vec![100, 200], vec![-1], Duration::from_secs(60))
    }

    #[test]
    fn test_notifies_only_on_transition() {
        let mut watcher = watcher();
        assert!(!watcher.observe(100, 0));
        assert!(watcher.observe(100, 1));
        assert!(!watcher.observe(100, 1));
        assert!(!watcher.observe(100, 2));
        assert!(watcher.observe(100, 1));
    }

    #[test]
    fn test_live_at_startup_notifies_once() {
        let mut watcher = watcher();
        assert!(watcher.observe(200, 1));
        assert!(!watcher.observe(200, 1));
    }

    #[test]
    fn test_rooms_are_independent() {
        let mut watcher = watcher();
        assert!(watcher.observe(100, 1));
        assert!(watcher.observe(200, 1));
    }

    #[test]
    fn test_announcement() {
        assert_eq!(announcement(42), "Live now! https://live.bilibili.com/42");
    }

    #[test]
    fn test_error_response_shape() {
        let parsed: PlayInfoResponse =
            serde_json::from_str(r#"{"code": 19002000, "message": "room not found", "data": null}"#).unwrap();
        assert_eq!(parsed.code, 19002000);
        assert!(parsed.data.is_none());
    }
}
