//! Orchestration and approval engine.
//!
//! An [`AgentSession`] drives one conversation: it sends the transcript and
//! tool schema to the model, routes every requested tool call through the
//! [`ApprovalGate`], runs approved calls on a bounded worker pool, appends
//! the results in call order and repeats until the model answers with text.

pub mod commands;
mod dispatch;
pub mod error;
pub mod gate;
pub mod plan;
pub mod runtime;
pub mod session;
pub mod stream;
mod turn;

pub use commands::{ControlCommand, parse_control_command};
pub use dispatch::{DENIED_RESULT, DISCARDED_RESULT, EXPIRED_RESULT, ToolCallRecord};
pub use error::TurnError;
pub use gate::{ApprovalGate, ApprovalState, Clock, GateRequest, Interception, ManualClock, SystemClock};
pub use plan::{COMPLETE_STEP_TOOL, PlanTracker, SET_PLAN_TOOL};
pub use runtime::{AgentRuntime, Services, model_client};
pub use session::{AgentSession, ControlOutcome, SubmitOutcome};
pub use stream::{StreamAssembler, StreamView};
pub use turn::{FinishReason, SYSTEM_PROMPT, TurnOutcome};
