//! SauceNAO reverse image search client.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

const SEARCH_URL: &str = "https://saucenao.com/search.php";
const TIMEOUT: Duration = Duration::from_secs(5);
/// Search every index.
const DB_ALL: u32 = 999;
const OUTPUT_JSON: u32 = 2;

#[derive(Debug, Error)]
pub enum SauceError {
    #[error("invalid API key")]
    BadKey,
    #[error("file is too large")]
    FileTooLarge,
    #[error("30 seconds limit reached")]
    ShortLimit,
    #[error("24 hours limit reached")]
    LongLimit,
    #[error("unknown client error: {0}")]
    Client(String),
    #[error("unknown server error: {0}")]
    Server(String),
    #[error("server returned status code {0}")]
    Status(u16),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Sauce {
    pub similarity: f64,
    pub index_id: i64,
    pub index_name: String,
    pub title: Option<String>,
    pub urls: Vec<String>,
    pub author: Option<String>,
}

pub struct SauceClient {
    http: reqwest::Client,
    api_key: Option<String>,
    numres: u32,
}

impl SauceClient {
    pub fn new(api_key: Option<String>, numres: u32) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(TIMEOUT).build()?;
        Ok(Self { http, api_key, numres })
    }

    /// Upload an image and return hits, most similar first.
    pub async fn search(&self, image: Vec<u8>, file_name: &str) -> Result<Vec<Sauce>, SauceError> {
        let mut query = vec![
            ("db", DB_ALL.to_string()),
            ("numres", self.numres.to_string()),
            ("output_type", OUTPUT_JSON.to_string()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("api_key", key.clone()));
        }

        let form = Form::new().part("file", Part::bytes(image).file_name(file_name.to_string()));
        let response = self.http.post(SEARCH_URL).query(&query).multipart(form).send().await?;

        let status = response.status();
        let body = response.text().await?;
        debug!("SauceNAO status: {status}");

        check_status(status, &body)?;
        parse_response(&body, self.api_key.is_some())
    }
}

/// Map non-200 statuses to errors.
fn check_status(status: StatusCode, body: &str) -> Result<(), SauceError> {
    match status.as_u16() {
        200 => Ok(()),
        403 => Err(SauceError::BadKey),
        413 => Err(SauceError::FileTooLarge),
        429 => {
            let daily = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v["header"]["message"].as_str().map(|m| m.contains("Daily")))
                .unwrap_or(false);
            Err(if daily { SauceError::LongLimit } else { SauceError::ShortLimit })
        }
        other => Err(SauceError::Status(other)),
    }
}

/// Integer that may arrive as a JSON number or a numeric string.
fn int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Display text of a field; lists yield their first element.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items.first().and_then(text),
        _ => None,
    }
}

/// First present field in priority order.
fn first_of(data: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| data.get(*k)).and_then(text)
}

fn sauce(raw: &Value) -> Option<Sauce> {
    let header = raw.get("header")?;
    let data = raw.get("data").unwrap_or(&Value::Null);

    let urls = match data.get("ext_urls").and_then(Value::as_array) {
        Some(urls) => urls.iter().filter_map(text).collect(),
        None => match data.get("getchu_id").and_then(text) {
            Some(id) => vec![format!("http://www.getchu.com/soft.phtml?id={id}")],
            None => Vec::new(),
        },
    };

    Some(Sauce {
        similarity: float(&header["similarity"]).unwrap_or(0.0),
        index_id: int(&header["index_id"]).unwrap_or(-1),
        index_name: header["index_name"].as_str().unwrap_or_default().to_string(),
        title: first_of(data, &["title", "eng_name", "material", "source", "created_at"]),
        urls,
        author: first_of(
            data,
            &[
                "author",
                "author_name",
                "member_name",
                "pawoo_user_username",
                "twitter_user_handle",
                "company",
                "creator",
            ],
        ),
    })
}

/// Validate the response header and return hits sorted by similarity.
pub fn parse_response(body: &str, with_key: bool) -> Result<Vec<Sauce>, SauceError> {
    let parsed: Value = serde_json::from_str(body)?;
    let header = &parsed["header"];

    let status = int(&header["status"]).unwrap_or(0);
    let user_id = int(&header["user_id"]).unwrap_or(0);

    if status < 0 {
        return Err(SauceError::Client(format!("status {status}")));
    }
    if status > 0 {
        return Err(SauceError::Server(format!("status {status}")));
    }
    if user_id < 0 {
        return Err(SauceError::Server(format!("user_id {user_id}")));
    }
    // The key was ignored
    if user_id == 0 && with_key {
        return Err(SauceError::BadKey);
    }
    if int(&header["short_remaining"]).is_some_and(|n| n < 0) {
        return Err(SauceError::ShortLimit);
    }
    if int(&header["long_remaining"]).is_some_and(|n| n < 0) {
        return Err(SauceError::LongLimit);
    }

    let mut results: Vec<Sauce> = parsed["results"]
        .as_array()
        .map(|items| items.iter().filter_map(sauce).collect())
        .unwrap_or_default();
    results.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn header(extra: Value) -> Value {
        let mut header = json!({
            "user_id": "1234",
            "status": 0,
            "short_remaining": 3,
            "long_remaining": 99,
            "results_returned": 2
        });
        if let (Some(h), Some(e)) = (header.as_object_mut(), extra.as_object()) {
            for (k, v) in e {
                h.insert(k.clone(), v.clone());
            }
        }
        header
    }

    #[test]
    fn test_results_sorted_and_fields_resolved() {
        let body = json!({
            "header": header(json!({})),
            "results": [
                {
                    "header": {"similarity": "55.10", "index_id": 9, "index_name": "Index #9: Danbooru"},
                    "data": {"ext_urls": ["https://danbooru.donmai.us/post/show/1"], "creator": ["artist_a", "artist_b"], "material": "original"}
                },
                {
                    "header": {"similarity": "92.40", "index_id": 5, "index_name": "Index #5: Pixiv Images"},
                    "data": {"ext_urls": ["https://www.pixiv.net/artworks/2"], "title": "Whale", "member_name": "painter"}
                }
            ]
        })
        .to_string();

        let results = parse_response(&body, true).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].index_id, 5);
        assert_eq!(results[0].title.as_deref(), Some("Whale"));
        assert_eq!(results[0].author.as_deref(), Some("painter"));
        assert_eq!(results[1].author.as_deref(), Some("artist_a"));
        assert_eq!(results[1].title.as_deref(), Some("original"));
    }

    #[test]
    fn test_author_priority() {
        let raw = json!({
            "header": {"similarity": "80", "index_id": 41, "index_name": "Twitter"},
            "data": {"twitter_user_handle": "whale", "company": "Corp", "author_name": "Named"}
        });
        assert_eq!(sauce(&raw).unwrap().author.as_deref(), Some("Named"));
    }

    #[test]
    fn test_getchu_url_fallback() {
        let raw = json!({
            "header": {"similarity": "70", "index_id": 2, "index_name": "H-Game CG"},
            "data": {"getchu_id": "12345", "company": "Studio"}
        });
        let sauce = sauce(&raw).unwrap();
        assert_eq!(sauce.urls, vec!["http://www.getchu.com/soft.phtml?id=12345"]);
        assert_eq!(sauce.author.as_deref(), Some("Studio"));
    }

    #[test]
    fn test_null_results() {
        let body = json!({"header": header(json!({})), "results": null}).to_string();
        assert!(parse_response(&body, false).unwrap().is_empty());
    }

    #[test]
    fn test_header_errors() {
        let cases = [
            (json!({"status": -2}), "client"),
            (json!({"status": 1}), "server"),
            (json!({"user_id": -1}), "server"),
            (json!({"user_id": 0}), "bad key"),
            (json!({"short_remaining": -1}), "short"),
            (json!({"long_remaining": -1}), "long"),
        ];
        for (extra, expected) in cases {
            let body = json!({"header": header(extra), "results": []}).to_string();
            let err = parse_response(&body, true).unwrap_err();
            let matched = match expected {
                "client" => matches!(err, SauceError::Client(_)),
                "server" => matches!(err, SauceError::Server(_)),
                "bad key" => matches!(err, SauceError::BadKey),
                "short" => matches!(err, SauceError::ShortLimit),
                _ => matches!(err, SauceError::LongLimit),
            };
            assert!(matched, "expected {expected}, got {err:?}");
        }
    }

    #[test]
    fn test_anonymous_user_zero_is_fine() {
        let body = json!({"header": header(json!({"user_id": 0})), "results": []}).to_string();
        assert!(parse_response(&body, false).is_ok());
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status(StatusCode::OK, "").is_ok());
        assert!(matches!(check_status(StatusCode::FORBIDDEN, ""), Err(SauceError::BadKey)));
        assert!(matches!(check_status(StatusCode::PAYLOAD_TOO_LARGE, ""), Err(SauceError::FileTooLarge)));
        let daily = json!({"header": {"message": "Daily Search Limit Exceeded."}}).to_string();
        assert!(matches!(check_status(StatusCode::TOO_MANY_REQUESTS, &daily), Err(SauceError::LongLimit)));
        assert!(matches!(check_status(StatusCode::TOO_MANY_REQUESTS, "{}"), Err(SauceError::ShortLimit)));
        assert!(matches!(check_status(StatusCode::BAD_GATEWAY, ""), Err(SauceError::Status(502))));
    }
}
