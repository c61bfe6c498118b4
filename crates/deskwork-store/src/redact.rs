//! Rewrites applied to every message before it crosses the persistence
//! boundary, plus the extra scrubbing used by export.
//!
//! All rewrites are idempotent: a message that was already redacted comes
//! back unchanged.

use deskwork_core::{ChatMessage, ContentPart, MessageContent, ToolCall};
use deskwork_policy::PolicyEngine;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const TOOL_OUTPUT_PREFIX: &str = "[tool output redacted:";
const IMAGE_PREFIX: &str = "[image redacted:";

pub fn tool_output_placeholder(bytes: usize) -> String {
    format!("{TOOL_OUTPUT_PREFIX} {bytes} bytes]")
}

/// True only for the exact text [`tool_output_placeholder`] or an image
/// placeholder produces; anything appended to one is still raw output.
pub fn is_placeholder(text: &str) -> bool {
    placeholder_regex().is_match(text)
}

fn placeholder_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^\[(?:tool output redacted: \d+ bytes|image redacted: [^,\]]+, \d+ bytes)\]$")
            .expect("valid regex")
    })
}

/// Replaces tool output and image payloads with size/type placeholders and
/// masks credentials in everything else.
pub fn redact_for_storage(policy: &PolicyEngine, message: &ChatMessage) -> ChatMessage {
    match message {
        ChatMessage::User { content } => ChatMessage::User {
            content: redact_content(policy, content),
        },
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => ChatMessage::Assistant {
            content: content.as_ref().map(|c| redact_content(policy, c)),
            tool_calls: tool_calls
                .iter()
                .map(|call| map_call_strings(call, &|s| policy.redact(s)))
                .collect(),
        },
        ChatMessage::Tool {
            tool_call_id,
            content,
            status,
        } => {
            // Denial records are written by the engine, not by a tool.
            let content = if status.is_denial() {
                redact_content(policy, content)
            } else {
                match content {
                    MessageContent::Text(text) if is_placeholder(text) => content.clone(),
                    other => MessageContent::Text(tool_output_placeholder(payload_bytes(other))),
                }
            };
            ChatMessage::Tool {
                tool_call_id: tool_call_id.clone(),
                content,
                status: *status,
            }
        }
    }
}

/// Storage redaction plus path stripping, for documents leaving the machine.
pub fn scrub_for_export(policy: &PolicyEngine, message: &ChatMessage) -> ChatMessage {
    let scrub = |text: &str| {
        if is_placeholder(text) {
            text.to_string()
        } else {
            policy.scrub_for_export(text)
        }
    };
    match redact_for_storage(policy, message) {
        ChatMessage::User { content } => ChatMessage::User {
            content: map_text(&content, &scrub),
        },
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => ChatMessage::Assistant {
            content: content.as_ref().map(|c| map_text(c, &scrub)),
            tool_calls: tool_calls
                .iter()
                .map(|call| map_call_strings(call, &scrub))
                .collect(),
        },
        ChatMessage::Tool {
            tool_call_id,
            content,
            status,
        } => ChatMessage::Tool {
            tool_call_id,
            content: map_text(&content, &scrub),
            status,
        },
    }
}

fn redact_content(policy: &PolicyEngine, content: &MessageContent) -> MessageContent {
    let content = match content {
        MessageContent::Parts(parts) => MessageContent::Parts(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Image { image_url } => ContentPart::Text {
                        text: image_placeholder(image_url),
                    },
                    text => text.clone(),
                })
                .collect(),
        ),
        text => text.clone(),
    };
    map_text(&content, &|s| {
        if is_placeholder(s) {
            s.to_string()
        } else {
            policy.redact(s)
        }
    })
}

fn map_text(content: &MessageContent, f: &dyn Fn(&str) -> String) -> MessageContent {
    match content {
        MessageContent::Text(text) => MessageContent::Text(f(text)),
        MessageContent::Parts(parts) => MessageContent::Parts(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => ContentPart::Text { text: f(text) },
                    image => image.clone(),
                })
                .collect(),
        ),
    }
}

fn map_call_strings(call: &ToolCall, f: &dyn Fn(&str) -> String) -> ToolCall {
    ToolCall {
        id: call.id.clone(),
        name: call.name.clone(),
        arguments: map_json_strings(&call.arguments, f),
    }
}

fn map_json_strings(value: &Value, f: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| map_json_strings(v, f)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), map_json_strings(v, f)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn payload_bytes(content: &MessageContent) -> usize {
    match content {
        MessageContent::Text(text) => text.len(),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => text.len(),
                ContentPart::Image { image_url } => image_size(image_url).1,
            })
            .sum(),
    }
}

fn image_placeholder(image_url: &str) -> String {
    let (mime, bytes) = image_size(image_url);
    format!("{IMAGE_PREFIX} {mime}, {bytes} bytes]")
}

/// Mime type and decoded size of an inline `data:` URL; remote references
/// report their URL length.
fn image_size(image_url: &str) -> (String, usize) {
    let Some(rest) = image_url.strip_prefix("data:") else {
        return ("remote".to_string(), image_url.len());
    };
    let (header, payload) = rest.split_once(',').unwrap_or((rest, ""));
    let mime = header.split(';').next().filter(|m| !m.is_empty()).unwrap_or("image");
    let bytes = if header.ends_with(";base64") {
        let padding = payload.bytes().rev().take_while(|b| *b == b'=').count();
        (payload.len() / 4 * 3).saturating_sub(padding)
    } else {
        payload.len()
    };
    (mime.to_string(), bytes)
}
