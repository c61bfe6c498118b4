/// Why a turn ended without a final answer.
///
/// Denied, expired and failing tool calls are not errors: they come back to
/// the model as tool results and the conversation goes on.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("no working directory selected")]
    MissingWorkingDirectory,
    #[error("a turn is already running for this session")]
    Busy,
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("model call failed: {0}")]
    Model(String),
    #[error("model returned a malformed reply: {0}")]
    MalformedReply(String),
    /// The turn finished but its messages could not be written. They stay in
    /// memory and are written by the next successful flush.
    #[error("failed to save the conversation: {message}")]
    Persistence { reply: String, message: String },
    #[error("session was closed while the turn was running")]
    Cancelled,
}

impl TurnError {
    /// True for faults that leave the conversation usable as-is.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::SessionNotFound(_))
    }
}
