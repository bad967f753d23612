//! OpenAI Chat Completions and Responses backends, plus any endpoint that
//! speaks the Chat Completions dialect.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::{ChatBackend, RelayError, RelayOptions, RelayPlugin, Reply, Role, Turn, http_client, response_body};
use crate::config::{ConfigError, Entry};
use crate::plugin::Plugin;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const COMPATIBLE_ATTEMPTS: usize = 3;
const EMPTY_REPLY_NOTICE: &str = "The API returned no error, but the reply was empty.";

#[derive(Deserialize)]
struct OpenAiOptions {
    api_key: String,
    model: String,
    /// Extra Responses API parameters, e.g. `{"reasoning": {"effort": "low"}}`.
    #[serde(default)]
    create_params: Map<String, Value>,
    #[serde(flatten)]
    relay: RelayOptions,
}

#[derive(Deserialize)]
struct CompatibleOptions {
    api_key: String,
    model: String,
    endpoint: String,
    #[serde(flatten)]
    relay: RelayOptions,
}

/// Factory for `openai`.
pub fn build(entry: &Entry) -> Result<Arc<dyn Plugin>, ConfigError> {
    let options: OpenAiOptions = entry.options()?;
    let backend = if options.model.to_lowercase().starts_with("gpt-5") {
        OpenAiBackend::responses(options.api_key, options.model, options.create_params)?
    } else {
        OpenAiBackend::chat(OPENAI_BASE_URL, options.api_key, options.model)?
    };
    Ok(Arc::new(RelayPlugin::new("openai", options.relay, Box::new(backend))))
}

/// Factory for `openai_compatible`.
pub fn build_compatible(entry: &Entry) -> Result<Arc<dyn Plugin>, ConfigError> {
    let options: CompatibleOptions = entry.options()?;
    let backend = OpenAiBackend::compatible(&options.endpoint, options.api_key, options.model)?;
    let plugin = RelayPlugin::new("openai_compatible", options.relay, Box::new(backend)).with_named_turns();
    Ok(Arc::new(plugin))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Api {
    ChatCompletions,
    Responses,
}

pub struct OpenAiBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    api: Api,
    create_params: Map<String, Value>,
    /// Third-party endpoint: drop `<think>` blocks and retry empty answers.
    compatible: bool,
}

impl OpenAiBackend {
    pub fn chat(base_url: &str, api_key: String, model: String) -> Result<Self, ConfigError> {
        Ok(Self {
            http: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            api: Api::ChatCompletions,
            create_params: Map::new(),
            compatible: false,
        })
    }

    pub fn responses(api_key: String, model: String, create_params: Map<String, Value>) -> Result<Self, ConfigError> {
        let mut backend = Self::chat(OPENAI_BASE_URL, api_key, model)?;
        backend.api = Api::Responses;
        backend.create_params = create_params;
        Ok(backend)
    }

    pub fn compatible(endpoint: &str, api_key: String, model: String) -> Result<Self, ConfigError> {
        let mut backend = Self::chat(endpoint, api_key, model)?;
        backend.compatible = true;
        Ok(backend)
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> Result<String, RelayError> {
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        response_body(response).await
    }

    async fn chat_completion(&self, transcript: &[Turn]) -> Result<String, RelayError> {
        let request = ChatRequest {
            model: &self.model,
            messages: transcript.iter().map(ChatMessage::from_turn).collect(),
        };
        let body = self.post("chat/completions", &request).await?;
        chat_text(&body)
    }

    async fn response(&self, transcript: &[Turn]) -> Result<String, RelayError> {
        let request = responses_request(&self.model, transcript, &self.create_params);
        let body = self.post("responses", &request).await?;
        let parsed: ResponsesResponse = serde_json::from_str(&body)?;

        if let Some(error) = parsed.error {
            return Err(RelayError::Api { status: 200, body: error.message });
        }
        Ok(parsed.output_text())
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn kind(&self) -> &'static str {
        match (self.api, self.compatible) {
            (_, true) => "openai_compatible",
            (Api::Responses, _) => "openai responses",
            (Api::ChatCompletions, _) => "openai",
        }
    }

    async fn complete(&self, transcript: &[Turn]) -> Result<Reply, RelayError> {
        debug!("{} request with {} turns", self.kind(), transcript.len());

        let text = match self.api {
            Api::Responses => require_text(&self.model, self.response(transcript).await?)?,
            Api::ChatCompletions if !self.compatible => {
                require_text(&self.model, self.chat_completion(transcript).await?)?
            }
            Api::ChatCompletions => {
                let mut answer = String::new();
                for attempt in 1..=COMPATIBLE_ATTEMPTS {
                    let raw = self.chat_completion(transcript).await?;
                    answer = strip_think(&raw).to_string();
                    if !answer.is_empty() {
                        break;
                    }
                    warn!("{} returned an empty answer (attempt {attempt})", self.model);
                }
                if answer.is_empty() {
                    answer = EMPTY_REPLY_NOTICE.to_string();
                }
                answer
            }
        };

        info!("🤖 {} replied with {} chars", self.model, text.chars().count());
        Ok(Reply { text, image: None })
    }
}

/// Text of the first choice; a missing or null content reads as empty.
fn chat_text(body: &str) -> Result<String, RelayError> {
    let parsed: ChatResponse = serde_json::from_str(body)?;
    if let Some(error) = parsed.error {
        return Err(RelayError::Api { status: 200, body: error.message });
    }
    Ok(parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default())
}

fn require_text(model: &str, text: String) -> Result<String, RelayError> {
    if text.trim().is_empty() {
        return Err(RelayError::Empty(format!("{model} returned no text")));
    }
    Ok(text)
}

/// Drop a leading `<think>...</think>` block. An unterminated block drops everything.
pub fn strip_think(text: &str) -> &str {
    let Some(rest) = text.trim_start().strip_prefix("<think>") else {
        return text.trim();
    };
    match rest.find("</think>") {
        Some(end) => rest[end + "</think>".len()..].trim(),
        None => "",
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: ChatContent<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ChatContent<'a> {
    Text(&'a str),
    Parts(Vec<ChatPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatPart {
    ImageUrl { image_url: ImageUrl },
    Text { text: String },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

impl<'a> ChatMessage<'a> {
    fn from_turn(turn: &'a Turn) -> Self {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let content = if turn.images.is_empty() {
            ChatContent::Text(&turn.text)
        } else {
            let mut parts: Vec<ChatPart> = turn
                .images
                .iter()
                .map(|image| ChatPart::ImageUrl { image_url: ImageUrl { url: image.data_url() } })
                .collect();
            parts.push(ChatPart::Text { text: turn.text.clone() });
            ChatContent::Parts(parts)
        };
        Self { role, content, name: turn.name.as_deref() }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

fn responses_request(model: &str, transcript: &[Turn], create_params: &Map<String, Value>) -> Value {
    let input: Vec<Value> = transcript
        .iter()
        .map(|turn| match turn.role {
            Role::Assistant => json!({"role": "assistant", "content": turn.text}),
            Role::User => {
                let mut content: Vec<Value> = turn
                    .images
                    .iter()
                    .map(|image| json!({"type": "input_image", "image_url": image.data_url()}))
                    .collect();
                content.push(json!({"type": "input_text", "text": turn.text}));
                json!({"role": "user", "content": content})
            }
        })
        .collect();

    let mut body = create_params.clone();
    body.insert("model".to_string(), Value::String(model.to_string()));
    body.insert("input".to_string(), Value::Array(input));
    Value::Object(body)
}

#[derive(Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    output: Vec<OutputItem>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Deserialize)]
struct OutputContent {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

impl ResponsesResponse {
    /// Concatenated `output_text` parts of every message item.
    fn output_text(&self) -> String {
        self.output
            .iter()
            .filter(|item| item.kind == "message")
            .flat_map(|item| &item.content)
            .filter(|c| c.kind == "output_text")
            .filter_map(|c| c.text.as_deref())
            .collect()
    }
}
