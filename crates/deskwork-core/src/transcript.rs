use crate::ChatMessage;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptError {
    #[error("message {index}: tool result '{call_id}' has no matching call in the preceding assistant message")]
    OrphanToolResult { index: usize, call_id: String },
    #[error("message {index}: duplicate result for tool call '{call_id}'")]
    DuplicateToolResult { index: usize, call_id: String },
    #[error("message {index}: tool call id '{call_id}' is repeated")]
    DuplicateCallId { index: usize, call_id: String },
    #[error("message {index}: tool call has an empty id or name")]
    EmptyToolCall { index: usize },
    #[error("message {index}: tool call '{call_id}' was never answered")]
    UnansweredCall { index: usize, call_id: String },
}

/// Checks the linkage rules between assistant tool calls and tool results.
///
/// Every tool message must answer a call issued by the nearest preceding
/// assistant message, each call may be answered at most once, and every call
/// must be answered before the next user or assistant message and before the
/// transcript ends.
pub fn validate_transcript(messages: &[ChatMessage]) -> Result<(), TranscriptError> {
    let mut calls: Vec<&str> = Vec::new();
    let mut answered: HashSet<&str> = HashSet::new();

    for (index, message) in messages.iter().enumerate() {
        match message {
            ChatMessage::Assistant { tool_calls, .. } => {
                ensure_answered(&calls, &answered, index)?;
                calls.clear();
                answered.clear();
                for call in tool_calls {
                    if call.id.trim().is_empty() || call.name.trim().is_empty() {
                        return Err(TranscriptError::EmptyToolCall { index });
                    }
                    if calls.contains(&call.id.as_str()) {
                        return Err(TranscriptError::DuplicateCallId {
                            index,
                            call_id: call.id.clone(),
                        });
                    }
                    calls.push(call.id.as_str());
                }
            }
            ChatMessage::Tool { tool_call_id, .. } => {
                if !calls.contains(&tool_call_id.as_str()) {
                    return Err(TranscriptError::OrphanToolResult {
                        index,
                        call_id: tool_call_id.clone(),
                    });
                }
                if !answered.insert(tool_call_id.as_str()) {
                    return Err(TranscriptError::DuplicateToolResult {
                        index,
                        call_id: tool_call_id.clone(),
                    });
                }
            }
            ChatMessage::User { .. } => {
                ensure_answered(&calls, &answered, index)?;
                calls.clear();
                answered.clear();
            }
        }
    }
    ensure_answered(&calls, &answered, messages.len())
}

fn ensure_answered(
    calls: &[&str],
    answered: &HashSet<&str>,
    index: usize,
) -> Result<(), TranscriptError> {
    match calls.iter().find(|id| !answered.contains(**id)) {
        Some(id) => Err(TranscriptError::UnansweredCall {
            index,
            call_id: (*id).to_string(),
        }),
        None => Ok(()),
    }
}
