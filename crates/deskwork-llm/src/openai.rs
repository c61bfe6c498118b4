use crate::{ChatRequest, LlmClient, ModelError, ModelReply, StreamCallback, StreamChunk};
use anyhow::{Result, anyhow};
use deskwork_core::{ChatMessage, ContentPart, MessageContent, ToolCall};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::io::BufRead;
use std::time::Duration;

pub const OPENAI_CHAT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: OPENAI_CHAT_ENDPOINT.to_string(),
            api_key: api_key.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

/// Chat-completions client with function calling. Failures come back as
/// [`ModelError`] so a [`RetryingClient`](crate::RetryingClient) can decide
/// what to retry.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    cfg: OpenAiConfig,
    client: Client,
}

impl OpenAiClient {
    pub fn new(cfg: OpenAiConfig) -> Result<Self> {
        if cfg.api_key.trim().is_empty() {
            return Err(ModelError::Rejected("no API key configured".to_string()).into());
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn post(&self, payload: &Value) -> Result<reqwest::blocking::Response> {
        let resp = self
            .client
            .post(&self.cfg.endpoint)
            .bearer_auth(self.cfg.api_key.trim())
            .json(payload)
            .send()
            .map_err(|e| transport_error(&e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        Err(api_error(status, &body).into())
    }
}

impl LlmClient for OpenAiClient {
    fn send(&self, req: &ChatRequest) -> Result<ModelReply> {
        let resp = self.post(&build_chat_payload(req))?;
        let body = resp.text().map_err(|e| transport_error(&e))?;
        parse_chat_payload(&body)
    }

    fn send_streaming(&self, req: &ChatRequest, cb: StreamCallback) -> Result<ModelReply> {
        let mut payload = build_chat_payload(req);
        payload["stream"] = json!(true);
        let resp = self.post(&payload)?;

        let mut text = String::new();
        let mut parts: BTreeMap<u64, StreamToolCall> = BTreeMap::new();
        let reader = std::io::BufReader::new(resp);
        for line in reader.lines() {
            let line =
                line.map_err(|e| ModelError::Unavailable(format!("stream read error: {e}")))?;
            let trimmed = line.trim();
            if !trimmed.starts_with("data:") {
                continue;
            }
            let chunk = trimmed.trim_start_matches("data:").trim();
            if chunk == "[DONE]" {
                break;
            }
            let Ok(value) = serde_json::from_str::<Value>(chunk) else {
                continue;
            };
            let Some(delta) = value
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|arr| arr.first())
                .and_then(|choice| choice.get("delta"))
            else {
                continue;
            };
            if let Some(content) = delta.get("content").and_then(Value::as_str)
                && !content.is_empty()
            {
                text.push_str(content);
                cb(StreamChunk::Token(content.to_string()));
            }
            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                merge_stream_tool_calls(calls, &mut parts);
            }
        }
        cb(StreamChunk::Done);

        let tool_calls = parts
            .into_iter()
            .filter(|(_, part)| !part.name.trim().is_empty())
            .map(|(index, part)| ToolCall {
                id: part.id.unwrap_or_else(|| format!("call_{}", index + 1)),
                name: part.name,
                arguments: parse_arguments(&part.arguments),
            })
            .collect();
        Ok(ModelReply {
            text: (!text.is_empty()).then_some(text),
            tool_calls,
        })
    }
}

fn build_chat_payload(req: &ChatRequest) -> Value {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);
    if let Some(system) = req.system.as_deref().filter(|s| !s.is_empty()) {
        messages.push(json!({"role": "system", "content": system}));
    }
    // Tool messages only carry text. Images they return follow the batch's
    // tool messages as a user message.
    let mut deferred = Vec::new();
    for message in &req.messages {
        match message {
            ChatMessage::Tool {
                tool_call_id,
                content,
                ..
            } => {
                messages.push(message_to_wire(message));
                deferred.extend(tool_images_to_wire(tool_call_id, content));
            }
            _ => {
                messages.append(&mut deferred);
                messages.push(message_to_wire(message));
            }
        }
    }
    messages.append(&mut deferred);

    let mut payload = json!({
        "model": req.model,
        "messages": messages,
    });
    if !req.tools.is_empty() {
        payload["tools"] = json!(req.tools);
        payload["tool_choice"] = json!("auto");
    }
    payload
}

fn message_to_wire(message: &ChatMessage) -> Value {
    match message {
        ChatMessage::User { content } => json!({
            "role": "user",
            "content": content_to_wire(content),
        }),
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut out = json!({
                "role": "assistant",
                "content": content.as_ref().map(MessageContent::as_text),
            });
            if !tool_calls.is_empty() {
                // The wire format carries arguments as a JSON string.
                out["tool_calls"] = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
            }
            out
        }
        ChatMessage::Tool {
            tool_call_id,
            content,
            ..
        } => json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "content": content.as_text(),
        }),
    }
}

fn tool_images_to_wire(tool_call_id: &str, content: &MessageContent) -> Option<Value> {
    let MessageContent::Parts(parts) = content else {
        return None;
    };
    let images: Vec<Value> = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Image { image_url } => {
                Some(json!({"type": "image_url", "image_url": {"url": image_url}}))
            }
            ContentPart::Text { .. } => None,
        })
        .collect();
    if images.is_empty() {
        return None;
    }
    let mut wire = vec![json!({
        "type": "text",
        "text": format!("Image returned by tool call {tool_call_id}."),
    })];
    wire.extend(images);
    Some(json!({"role": "user", "content": wire}))
}

fn content_to_wire(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                ContentPart::Image { image_url } => {
                    json!({"type": "image_url", "image_url": {"url": image_url}})
                }
            })
            .collect(),
    }
}

fn parse_chat_payload(body: &str) -> Result<ModelReply> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| anyhow!("invalid chat completion payload: {e}"))?;
    let message = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| anyhow!("chat completion payload has no choices"))?;
    let text = message
        .get("content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let tool_calls = message
        .get("tool_calls")
        .map(parse_tool_calls_array)
        .unwrap_or_default();
    Ok(ModelReply { text, tool_calls })
}

fn parse_tool_calls_array(value: &Value) -> Vec<ToolCall> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let function = item.get("function")?;
            let name = function.get("name").and_then(Value::as_str)?.trim();
            if name.is_empty() {
                return None;
            }
            let id = item
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", idx + 1));
            let arguments = match function.get("arguments") {
                Some(Value::String(raw)) => parse_arguments(raw),
                Some(other) => other.clone(),
                None => json!({}),
            };
            Some(ToolCall {
                id,
                name: name.to_string(),
                arguments,
            })
        })
        .collect()
}

/// Unparsable argument strings become an empty object; validation reports
/// the missing fields back to the model.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| json!({}))
}

#[derive(Default)]
struct StreamToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

fn merge_stream_tool_calls(chunks: &[Value], out: &mut BTreeMap<u64, StreamToolCall>) {
    for (idx, item) in chunks.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or(idx as u64);
        let entry = out.entry(index).or_default();
        if let Some(id) = item.get("id").and_then(Value::as_str)
            && !id.trim().is_empty()
        {
            entry.id = Some(id.to_string());
        }
        if let Some(function) = item.get("function") {
            if let Some(name) = function.get("name").and_then(Value::as_str)
                && !name.trim().is_empty()
            {
                entry.name = name.to_string();
            }
            if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                entry.arguments.push_str(arguments);
            }
        }
    }
}

fn api_error(status: StatusCode, body: &str) -> ModelError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::UNAUTHORIZED => ModelError::Rejected(
            "invalid or missing API key (HTTP 401); update the key in settings".to_string(),
        ),
        StatusCode::TOO_MANY_REQUESTS => {
            ModelError::Unavailable(format!("rate limited (HTTP 429): {detail}"))
        }
        s if s.is_server_error() => {
            ModelError::Unavailable(format!("server error (HTTP {}): {detail}", s.as_u16()))
        }
        s => ModelError::Rejected(format!("HTTP {}: {detail}", s.as_u16())),
    }
}

fn transport_error(err: &reqwest::Error) -> ModelError {
    let inner = err.source().map(|e| e.to_string()).unwrap_or_default();
    if err.is_timeout() {
        ModelError::Unavailable("request timed out".to_string())
    } else if err.is_connect() {
        ModelError::Unavailable(format!("connection failed: {inner}"))
    } else if err.is_request() || err.is_body() {
        ModelError::Unavailable(format!("network error: {err}"))
    } else {
        ModelError::Rejected(format!("request failed: {err}"))
    }
}
