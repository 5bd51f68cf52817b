use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{ChunkFn, GenerationError, GenerationGateway, GenerationRequest};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_TEMPERATURE: f32 = 0.8;

/// Client for OpenAI-compatible `/chat/completions` endpoints.
#[derive(Clone)]
pub struct OpenAiCompatible {
    client: reqwest::Client,
}

impl OpenAiCompatible {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn endpoint(base_url: &str) -> Result<String, GenerationError> {
        let base = match base_url.trim() {
            "" => DEFAULT_API_BASE,
            b => b,
        };
        url::Url::parse(base).map_err(|e| GenerationError::Misconfigured(format!("invalid base url {base}: {e}")))?;
        Ok(format!("{}/chat/completions", base.trim_end_matches('/')))
    }

    async fn post(&self, req: &GenerationRequest<'_>, stream: bool) -> Result<reqwest::Response, GenerationError> {
        let model = req.model;
        if model.model_name.trim().is_empty() {
            return Err(GenerationError::Misconfigured(format!("model {} missing model_name", model.id)));
        }
        let url = Self::endpoint(&model.base_url)?;
        let messages = req
            .turns()
            .into_iter()
            .map(|t| OaiMessage { role: t.role.as_str().to_string(), content: Some(t.content) })
            .collect();
        let body = OaiChatRequest {
            model: model.model_name.trim(),
            messages,
            temperature: req.temperature.or(model.temperature).unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: req.max_tokens.or(model.max_tokens),
            stream,
        };
        let mut rb = self.client.post(url).json(&body);
        if let Some(key) = model.api_key() {
            rb = rb.bearer_auth(key);
        }
        let resp = rb.send().await.map_err(|e| GenerationError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(model = %model.id, status = status.as_u16(), "provider returned error status");
            return Err(GenerationError::Status { status: status.as_u16(), body: body.trim().to_string() });
        }
        Ok(resp)
    }
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    model: &'a str,
    messages: Vec<OaiMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    #[serde(default)]
    choices: Vec<OaiChoice>,
    error: Option<OaiError>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiMessage,
}

#[derive(Debug, Serialize, Deserialize)]
struct OaiMessage {
    #[serde(default)]
    role: String,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiError {
    message: String,
}

#[derive(Debug, PartialEq)]
pub(crate) enum SseLine {
    Skip,
    Done,
    Delta { content: String, reasoning: String },
}

/// Parses one line of an OpenAI-compatible event stream.
pub(crate) fn parse_sse_line(line: &str) -> Result<SseLine, GenerationError> {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else { return Ok(SseLine::Skip) };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(SseLine::Skip);
    }
    if payload == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let v: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "skipping undecodable stream line");
            return Ok(SseLine::Skip);
        }
    };
    if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
        let msg = err.get("message").and_then(Value::as_str).unwrap_or("unknown provider error");
        return Err(GenerationError::Provider(msg.to_string()));
    }
    let delta = &v["choices"][0]["delta"];
    let content = delta_text(&delta["content"]);
    let reasoning = delta_text(&delta["reasoning_content"]);
    if content.is_empty() && reasoning.is_empty() {
        return Ok(SseLine::Skip);
    }
    Ok(SseLine::Delta { content, reasoning })
}

/// Deltas are usually strings; some gateways send lists of string fragments.
fn delta_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts.iter().filter_map(Value::as_str).collect(),
        _ => String::new(),
    }
}

#[async_trait]
impl GenerationGateway for OpenAiCompatible {
    async fn generate(&self, req: GenerationRequest<'_>) -> Result<String, GenerationError> {
        let resp = self.post(&req, false).await?;
        let bytes = resp.bytes().await.map_err(|e| GenerationError::Network(e.to_string()))?;
        let parsed: OaiChatResponse =
            serde_json::from_slice(&bytes).map_err(|e| GenerationError::Decode(e.to_string()))?;
        if let Some(err) = parsed.error {
            return Err(GenerationError::Provider(err.message));
        }
        let choice = parsed.choices.into_iter().next().ok_or(GenerationError::EmptyChoices)?;
        let content = choice.message.content.unwrap_or_default().trim().to_string();
        if content.is_empty() {
            warn!(model = %req.model.id, "provider returned empty content");
        }
        Ok(content)
    }

    async fn stream_generate(
        &self,
        req: GenerationRequest<'_>,
        on_chunk: &mut ChunkFn<'_>,
    ) -> Result<(), GenerationError> {
        let resp = self.post(&req, true).await?;
        let mut stream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| GenerationError::Network(e.to_string()))?;
            buf.extend_from_slice(&bytes);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                match parse_sse_line(&String::from_utf8_lossy(&line))? {
                    SseLine::Done => return Ok(()),
                    SseLine::Delta { content, reasoning } => on_chunk(&content, &reasoning),
                    SseLine::Skip => {}
                }
            }
        }
        if let SseLine::Delta { content, reasoning } = parse_sse_line(&String::from_utf8_lossy(&buf))? {
            on_chunk(&content, &reasoning);
        }
        Ok(())
    }
}
