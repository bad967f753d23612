//! Gemini `generateContent` backend with optional built-in tools.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use super::{ChatBackend, RelayError, RelayOptions, RelayPlugin, Reply, Role, Turn, http_client, response_body};
use crate::config::{ConfigError, Entry};
use crate::plugin::Plugin;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const ATTEMPTS: u32 = 3;
const KNOWN_TOOLS: &[&str] = &["google_search", "code_execution", "url_context", "google_search_retrieval"];

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

#[derive(Deserialize)]
struct GeminiOptions {
    api_key: String,
    #[serde(default = "default_model")]
    model: String,
    /// Built-in tool names, e.g. `["google_search", "code_execution"]`.
    #[serde(default)]
    tools: Vec<String>,
    #[serde(flatten)]
    relay: RelayOptions,
}

/// Factory for `gemini`.
pub fn build(entry: &Entry) -> Result<Arc<dyn Plugin>, ConfigError> {
    let options: GeminiOptions = entry.options()?;
    let tools = tool_specs(&options.tools);
    info!("Gemini tools: {:?}", tools.iter().flat_map(|t| t.keys()).collect::<Vec<_>>());

    let backend = GeminiBackend {
        http: http_client()?,
        api_key: options.api_key,
        model: options.model,
        tools,
        retry_delay: Duration::from_secs(1),
    };
    Ok(Arc::new(RelayPlugin::new("gemini", options.relay, Box::new(backend))))
}

/// `{"<tool>": {}}` objects for the configured tool names. Names are
/// normalized and may carry a `tool_` prefix; unknown names are skipped.
fn tool_specs(names: &[String]) -> Vec<Map<String, Value>> {
    let mut tools = Vec::new();
    for name in names {
        let normalized = name.trim().to_lowercase();
        let normalized = normalized.strip_prefix("tool_").unwrap_or(&normalized);
        if !KNOWN_TOOLS.contains(&normalized) {
            error!("Unknown Gemini tool '{}', skipping", name);
            continue;
        }
        let mut tool = Map::new();
        tool.insert(normalized.to_string(), Value::Object(Map::new()));
        tools.push(tool);
    }
    tools
}

pub struct GeminiBackend {
    http: reqwest::Client,
    api_key: String,
    model: String,
    tools: Vec<Map<String, Value>>,
    /// Linear back-off unit between attempts.
    retry_delay: Duration,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [Map<String, Value>],
}

fn no_tools(tools: &&[Map<String, Value>]) -> bool {
    tools.is_empty()
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum Part {
    Text(String),
    InlineData(Blob),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

fn content(turn: &Turn) -> Content {
    let role = match turn.role {
        Role::User => "user",
        Role::Assistant => "model",
    };
    let mut parts: Vec<Part> = turn
        .images
        .iter()
        .map(|image| Part::InlineData(Blob { mime_type: image.mime_type.clone(), data: image.base64() }))
        .collect();
    parts.push(Part::Text(turn.text.clone()));
    Content { role, parts }
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    executable_code: Option<ExecutableCode>,
    code_execution_result: Option<CodeExecutionResult>,
    inline_data: Option<InlineData>,
}

#[derive(Deserialize, Debug)]
struct ExecutableCode {
    #[serde(default)]
    language: String,
    code: String,
}

#[derive(Deserialize, Debug)]
struct CodeExecutionResult {
    #[serde(default)]
    output: String,
}

#[derive(Deserialize, Debug)]
struct InlineData {
    data: String,
}

/// Text, code and code output joined by newlines, plus the last inline image.
fn collect_reply(response: GenerateResponse) -> Result<Reply, RelayError> {
    let candidate = response
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| RelayError::Empty("no candidates in response".to_string()))?;
    let parts = candidate.content.map(|c| c.parts).unwrap_or_default();

    let mut reply = Reply::default();
    for part in parts {
        if let Some(inline) = part.inline_data {
            match base64::engine::general_purpose::STANDARD.decode(&inline.data) {
                Ok(bytes) => reply.image = Some(bytes),
                Err(e) => warn!("Failed to decode inline image: {e}"),
            }
        }
        if let Some(text) = part.text {
            reply.text.push_str(&text);
            reply.text.push('\n');
        }
        if let Some(code) = part.executable_code {
            reply.text.push_str(&format!("```{}\n{}\n```\n", code.language.to_lowercase(), code.code));
        }
        if let Some(result) = part.code_execution_result {
            reply.text.push_str(&result.output);
            reply.text.push('\n');
        }
    }

    if reply.text.trim().is_empty() && reply.image.is_none() {
        return Err(RelayError::Empty("candidate has no content".to_string()));
    }
    Ok(reply)
}

impl GeminiBackend {
    async fn generate(&self, request: &GenerateRequest<'_>) -> Result<Reply, RelayError> {
        let response = self
            .http
            .post(format!("{}/{}:generateContent", API_BASE, self.model))
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await?;
        let body = response_body(response).await?;
        collect_reply(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl ChatBackend for GeminiBackend {
    fn kind(&self) -> &'static str {
        "gemini"
    }

    async fn complete(&self, transcript: &[Turn]) -> Result<Reply, RelayError> {
        let request = GenerateRequest {
            contents: transcript.iter().map(content).collect(),
            tools: &self.tools,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.generate(&request).await {
                Ok(reply) => {
                    info!("🤖 {} replied with {} chars", self.model, reply.text.chars().count());
                    return Ok(reply);
                }
                Err(e) if attempt < ATTEMPTS => {
                    error!("Error generating content (attempt {attempt}): {e}");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
