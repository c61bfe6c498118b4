//! Runs one batch of model-issued tool calls.
//!
//! Each call is classified up front: plan tools, unknown tools and disabled
//! tools get an immediate result; the rest pass through the approval gate.
//! Auto-approved calls go straight to a bounded worker pool. Pending calls
//! get a waiter thread that parks on the gate and either forwards the job
//! to the pool or writes the refusal. The batch closes once every slot has a
//! result; results are returned in the model's call order.

use crate::gate::{ApprovalGate, ApprovalState, GateRequest, Interception};
use crate::plan::{PlanTracker, is_plan_tool, plan_summary};
use crate::runtime::Services;
use crate::session::LoopStateCell;
use deskwork_core::{
    ActivityEvent, ActivityStatus, AppSettings, ChatMessage, LoopState, Notification,
    TelemetryEvent, ToolCall, ToolKind, ToolResultStatus, new_id,
};
use deskwork_observe::{AuditRecord, LogLevel};
use deskwork_policy::CallContext;
use deskwork_tools::{Capability, SkillSet, ToolError};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

pub const DENIED_RESULT: &str = "Tool call denied by user. The action was not performed.";
pub const EXPIRED_RESULT: &str =
    "Approval request expired before the user responded. The action was not performed.";
pub const DISCARDED_RESULT: &str = "Session closed before approval. The action was not performed.";

/// What happened to one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub tool_call_id: String,
    pub status: ToolResultStatus,
    pub duration_ms: u64,
    /// Set when the call had to wait for the user.
    pub approval_id: Option<String>,
}

pub(crate) struct BatchResult {
    pub messages: Vec<ChatMessage>,
    pub records: Vec<ToolCallRecord>,
}

struct Job {
    index: usize,
    call: ToolCall,
    capability: Arc<dyn Capability>,
    activity_id: String,
    action: String,
    approval_id: Option<String>,
}

struct Done {
    index: usize,
    message: ChatMessage,
    record: ToolCallRecord,
}

enum Slot {
    Ready(Done),
    Run(Job),
    Wait(Job),
}

pub(crate) struct Batch<'a> {
    pub services: &'a Services,
    pub session_id: &'a str,
    pub working_dir: &'a Path,
    pub settings: &'a AppSettings,
    pub skills: &'a SkillSet,
    pub gate: &'a ApprovalGate,
    pub plan: &'a PlanTracker,
    pub state: &'a LoopStateCell,
}

impl Batch<'_> {
    pub fn run(&self, calls: &[ToolCall]) -> BatchResult {
        let mut slots: Vec<Option<Done>> = calls.iter().map(|_| None).collect();
        let mut ready = Vec::new();
        let mut waiting = Vec::new();
        for (index, call) in calls.iter().enumerate() {
            match self.classify(index, call) {
                Slot::Ready(done) => slots[index] = Some(done),
                Slot::Run(job) => ready.push(job),
                Slot::Wait(job) => waiting.push(job),
            }
        }

        self.services.observer.verbose_log(&format!(
            "batch: {} call(s), {} ready, {} awaiting approval",
            calls.len(),
            ready.len(),
            waiting.len()
        ));
        if !waiting.is_empty() {
            self.state.set(LoopState::AwaitingApproval);
        }
        let jobs = ready.len() + waiting.len();
        if jobs > 0 {
            let workers = self.settings.tool_workers.clamp(1, jobs);
            for done in self.execute_all(ready, waiting, workers) {
                let index = done.index;
                slots[index] = Some(done);
            }
        }

        let mut messages = Vec::with_capacity(calls.len());
        let mut records = Vec::with_capacity(calls.len());
        for (index, slot) in slots.into_iter().enumerate() {
            // Every slot is filled unless a worker panicked.
            let done = slot.unwrap_or_else(|| {
                let call = &calls[index];
                self.failure(index, call, "Tool execution did not complete.")
            });
            messages.push(done.message);
            records.push(done.record);
        }
        BatchResult { messages, records }
    }

    fn execute_all(&self, ready: Vec<Job>, waiting: Vec<Job>, workers: usize) -> Vec<Done> {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Mutex::new(job_rx);
        let (done_tx, done_rx) = mpsc::channel::<Done>();
        let outstanding = AtomicUsize::new(waiting.len());
        let mut finished = Vec::new();

        thread::scope(|s| {
            for _ in 0..workers {
                let job_rx = &job_rx;
                let done_tx = done_tx.clone();
                s.spawn(move || {
                    loop {
                        let next = job_rx.lock().unwrap_or_else(|e| e.into_inner()).recv();
                        let Ok(job) = next else {
                            break;
                        };
                        if done_tx.send(self.execute(job)).is_err() {
                            break;
                        }
                    }
                });
            }

            for job in waiting {
                let job_tx = job_tx.clone();
                let done_tx = done_tx.clone();
                let outstanding = &outstanding;
                s.spawn(move || {
                    let approval_id = job.approval_id.clone().unwrap_or_default();
                    let verdict = self.gate.wait(&approval_id);
                    if outstanding.fetch_sub(1, Ordering::SeqCst) == 1 && !self.gate.is_closed() {
                        self.state.set(LoopState::ExecutingTools);
                    }
                    if verdict == ApprovalState::Approved {
                        let _ = job_tx.send(job);
                    } else {
                        let _ = done_tx.send(self.refuse(job, verdict));
                    }
                });
            }

            for job in ready {
                let _ = job_tx.send(job);
            }
            drop(job_tx);
            drop(done_tx);

            for done in done_rx {
                finished.push(done);
            }
        });
        finished
    }

    fn classify(&self, index: usize, call: &ToolCall) -> Slot {
        if is_plan_tool(&call.name) {
            return Slot::Ready(self.apply_plan(index, call));
        }
        let Some(capability) = self.services.registry.resolve(&call.name) else {
            return Slot::Ready(self.failure(index, call, &format!("Tool not found: {}", call.name)));
        };
        if !self.skills.is_tool_enabled(&call.name) {
            let err = ToolError::Disabled(call.name.clone());
            return Slot::Ready(self.failure(index, call, &err.to_string()));
        }

        let policy = &self.services.policy;
        let context = CallContext {
            tool: &call.name,
            arguments: &call.arguments,
            sensitivity: capability.sensitivity(),
            kind: capability.kind(),
            mutating: capability.mutating(),
        };
        let reason = policy.approval_reason(&context, self.working_dir, self.settings);
        let action = policy.action_summary(&call.name, &call.arguments, capability.kind());
        let interception = self.gate.intercept(&GateRequest {
            tool: &call.name,
            action: &action,
            reason,
            standing_allowed: !self.settings.read_only,
            expires_at: self
                .settings
                .approval_expiry_from(self.services.clock.now_ms()),
        });

        let mut job = Job {
            index,
            call: call.clone(),
            capability,
            activity_id: new_id(),
            action,
            approval_id: None,
        };
        match interception {
            Interception::AutoApproved => Slot::Run(job),
            Interception::Pending(approval) => {
                self.activity(
                    &job.activity_id,
                    ActivityStatus::Pending,
                    format!("Awaiting approval: {}", job.action),
                );
                self.log(
                    LogLevel::Info,
                    &format!(
                        "approval {} requested for {} ({})",
                        approval.id, call.name, approval.reason
                    ),
                );
                job.approval_id = Some(approval.id);
                Slot::Wait(job)
            }
        }
    }

    fn execute(&self, job: Job) -> Done {
        let Job {
            index,
            call,
            capability,
            activity_id,
            action,
            approval_id,
        } = job;
        self.activity(&activity_id, ActivityStatus::Running, format!("Running {}", call.name));

        let started = Instant::now();
        let outcome =
            self.services
                .registry
                .execute(capability.as_ref(), &call.arguments, self.working_dir);
        let duration_ms = millis(started.elapsed());

        let (message, status, activity_status) = match outcome {
            Ok(content) => {
                self.activity(&activity_id, ActivityStatus::Success, format!("{} finished", call.name));
                (
                    ChatMessage::tool_result(&call.id, content, ToolResultStatus::Success),
                    ToolResultStatus::Success,
                    ActivityStatus::Success,
                )
            }
            Err(err) => {
                let text = self.services.policy.redact(&err.to_string());
                self.activity(
                    &activity_id,
                    ActivityStatus::Error,
                    format!("{} failed: {text}", call.name),
                );
                self.log(LogLevel::Error, &format!("{} failed: {text}", call.name));
                (
                    ChatMessage::tool_result(&call.id, format!("Error: {err}"), ToolResultStatus::Error),
                    ToolResultStatus::Error,
                    ActivityStatus::Error,
                )
            }
        };

        self.telemetry(TelemetryEvent {
            tool: call.name.clone(),
            status: activity_status,
            duration_ms,
            kind: capability.kind(),
        });
        self.audit(&call.name, status_label(status), &action, duration_ms);

        Done {
            index,
            message,
            record: ToolCallRecord {
                tool_name: call.name,
                tool_call_id: call.id,
                status,
                duration_ms,
                approval_id,
            },
        }
    }

    fn refuse(&self, job: Job, verdict: ApprovalState) -> Done {
        let (text, status) = match verdict {
            ApprovalState::Expired => (EXPIRED_RESULT, ToolResultStatus::Expired),
            ApprovalState::Discarded => (DISCARDED_RESULT, ToolResultStatus::Denied),
            _ => (DENIED_RESULT, ToolResultStatus::Denied),
        };
        if verdict != ApprovalState::Discarded {
            let label = if status == ToolResultStatus::Expired {
                "Approval expired"
            } else {
                "Denied"
            };
            self.activity(
                &job.activity_id,
                ActivityStatus::Error,
                format!("{label}: {}", job.action),
            );
            self.audit(&job.call.name, status_label(status), &job.action, 0);
        }
        Done {
            index: job.index,
            message: ChatMessage::tool_result(&job.call.id, text, status),
            record: ToolCallRecord {
                tool_name: job.call.name,
                tool_call_id: job.call.id,
                status,
                duration_ms: 0,
                approval_id: job.approval_id,
            },
        }
    }

    fn apply_plan(&self, index: usize, call: &ToolCall) -> Done {
        let (text, status) = match self.plan.apply(call) {
            Ok(plan) => {
                let summary = plan_summary(&plan);
                self.services
                    .publisher
                    .publish(self.session_id, Notification::PlanUpdate(plan));
                (summary, ToolResultStatus::Success)
            }
            Err(err) => (err, ToolResultStatus::Error),
        };
        Done {
            index,
            message: ChatMessage::tool_result(&call.id, text, status),
            record: ToolCallRecord {
                tool_name: call.name.clone(),
                tool_call_id: call.id.clone(),
                status,
                duration_ms: 0,
                approval_id: None,
            },
        }
    }

    /// Error result for a call that never reached a tool.
    fn failure(&self, index: usize, call: &ToolCall, text: &str) -> Done {
        self.activity(&new_id(), ActivityStatus::Error, text.to_string());
        self.log(LogLevel::Warn, text);
        self.audit(&call.name, "error", text, 0);
        Done {
            index,
            message: ChatMessage::tool_result(&call.id, text, ToolResultStatus::Error),
            record: ToolCallRecord {
                tool_name: call.name.clone(),
                tool_call_id: call.id.clone(),
                status: ToolResultStatus::Error,
                duration_ms: 0,
                approval_id: None,
            },
        }
    }

    fn activity(&self, id: &str, status: ActivityStatus, message: String) {
        self.services.publisher.activity(
            self.session_id,
            ActivityEvent {
                id: id.to_string(),
                status,
                message,
            },
        );
    }

    fn telemetry(&self, event: TelemetryEvent) {
        if let Err(err) = self.services.observer.emit_telemetry(self.session_id, &event) {
            self.services
                .observer
                .warn_log(self.session_id, &format!("telemetry failed: {err}"));
        }
        self.services.publisher.telemetry(self.session_id, event);
    }

    fn audit(&self, tool: &str, status: &str, action: &str, duration_ms: u64) {
        let record = AuditRecord {
            session_id: self.session_id,
            tool,
            status,
            action,
            duration_ms,
            working_dir: Some(self.working_dir),
        };
        if let Err(err) = self.services.observer.audit().append(&record) {
            self.services
                .observer
                .warn_log(self.session_id, &format!("audit append failed: {err}"));
        }
    }

    fn log(&self, level: LogLevel, message: &str) {
        let _ = self.services.observer.log(self.session_id, level, message);
    }
}

fn status_label(status: ToolResultStatus) -> &'static str {
    match status {
        ToolResultStatus::Success => "success",
        ToolResultStatus::Error => "error",
        ToolResultStatus::Denied => "denied",
        ToolResultStatus::Expired => "expired",
    }
}

/// Telemetry for one model round.
pub(crate) fn model_telemetry(status: ActivityStatus, duration_ms: u64) -> TelemetryEvent {
    TelemetryEvent {
        tool: "model".to_string(),
        status,
        duration_ms,
        kind: ToolKind::Model,
    }
}

/// Whole milliseconds in `elapsed`, saturating at `u64::MAX`.
pub(crate) fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_saturates_instead_of_wrapping() {
        assert_eq!(millis(Duration::from_micros(2_500)), 2);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
