use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ChatBackend, RelayError, RelayOptions, RelayPlugin, Reply, Role, Turn, http_client, response_body};
use crate::config::{ConfigError, Entry};
use crate::plugin::Plugin;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

fn default_max_tokens() -> u32 {
    2048
}

#[derive(Deserialize)]
struct AnthropicOptions {
    api_key: String,
    model: String,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    #[serde(flatten)]
    relay: RelayOptions,
}

/// Factory for `anthropic`.
pub fn build(entry: &Entry) -> Result<Arc<dyn Plugin>, ConfigError> {
    let options: AnthropicOptions = entry.options()?;
    let backend = AnthropicBackend {
        http: http_client()?,
        api_key: options.api_key,
        model: options.model,
        max_tokens: options.max_tokens,
    };
    Ok(Arc::new(RelayPlugin::new("anthropic", options.relay, Box::new(backend))))
}

pub struct AnthropicBackend {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock<'a> {
    Image { source: ImageSource<'a> },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct ImageSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'a str,
    data: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

fn api_message(turn: &Turn) -> ApiMessage<'_> {
    let role = match turn.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    let mut content: Vec<ContentBlock> = turn
        .images
        .iter()
        .map(|image| ContentBlock::Image {
            source: ImageSource { kind: "base64", media_type: &image.mime_type, data: image.base64() },
        })
        .collect();
    content.push(ContentBlock::Text { text: &turn.text });
    ApiMessage { role, content }
}

#[async_trait]
impl ChatBackend for AnthropicBackend {
    fn kind(&self) -> &'static str {
        "anthropic"
    }

    async fn complete(&self, transcript: &[Turn]) -> Result<Reply, RelayError> {
        let request = ApiRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: transcript.iter().map(api_message).collect(),
        };

        let response = self
            .http
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;
        let body = response_body(response).await?;
        let parsed: ApiResponse = serde_json::from_str(&body)?;

        let text: String = parsed
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.as_deref())
            .collect();
        if text.is_empty() {
            return Err(RelayError::Empty(format!("{} returned no text", self.model)));
        }

        info!("🤖 {} replied with {} chars", self.model, text.chars().count());
        Ok(Reply { text, image: None })
    }
}
