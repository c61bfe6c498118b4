use crate::commands::{ControlCommand, parse_control_command};
use crate::error::TurnError;
use crate::gate::ApprovalGate;
use crate::plan::PlanTracker;
use crate::runtime::Services;
use crate::turn::{Turn, TurnOutcome};
use deskwork_core::{
    ApprovalResolution, ChatMessage, LoopState, Notification, PendingApproval, PlanEvent,
    is_valid_loop_transition,
};
use deskwork_observe::LogLevel;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) struct LoopStateCell(Mutex<LoopState>);

impl LoopStateCell {
    fn new() -> Self {
        Self(Mutex::new(LoopState::Idle))
    }

    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> LoopState {
        *self.lock()
    }

    /// Moves to `to` if the transition is legal; illegal moves are ignored.
    pub fn set(&self, to: LoopState) {
        let mut state = self.lock();
        if is_valid_loop_transition(*state, to) {
            *state = to;
        }
    }

    /// `Idle -> AwaitingModel`, or `false` when a turn is already running.
    fn try_begin(&self) -> bool {
        let mut state = self.lock();
        if *state != LoopState::Idle {
            return false;
        }
        *state = LoopState::AwaitingModel;
        true
    }
}

/// Puts the session back to `Idle` however the turn ends.
struct IdleGuard<'a> {
    state: &'a LoopStateCell,
    gate: &'a ApprovalGate,
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.gate.end_turn();
        *self.state.lock() = LoopState::Idle;
    }
}

/// Live transcript. `history` keeps full tool output for the running
/// conversation; `unpersisted` is the tail the store has not accepted yet.
#[derive(Default)]
pub(crate) struct Transcript {
    pub history: Vec<ChatMessage>,
    pub unpersisted: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
pub struct ControlOutcome {
    pub command: ControlCommand,
    pub resolved: Vec<ApprovalResolution>,
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Turn(TurnOutcome),
    Control(ControlOutcome),
}

/// One conversation. Turns on a session never overlap; control commands are
/// accepted at any time, including while a turn waits for approval.
pub struct AgentSession {
    pub(crate) id: String,
    pub(crate) services: Services,
    pub(crate) gate: ApprovalGate,
    pub(crate) plan: PlanTracker,
    pub(crate) state: LoopStateCell,
    pub(crate) stream_seq: Arc<AtomicU64>,
    transcript: Mutex<Transcript>,
}

impl AgentSession {
    pub(crate) fn open(id: &str, services: Services) -> Result<Self, TurnError> {
        let session = services
            .store
            .get_session(id)
            .map_err(|e| TurnError::Persistence {
                reply: String::new(),
                message: e.to_string(),
            })?
            .ok_or_else(|| TurnError::SessionNotFound(id.to_string()))?;
        services.publisher.open(id);
        let gate = ApprovalGate::new(id, services.clock.clone(), services.publisher.clone());
        Ok(Self {
            id: id.to_string(),
            gate,
            plan: PlanTracker::new(),
            state: LoopStateCell::new(),
            stream_seq: Arc::new(AtomicU64::new(0)),
            transcript: Mutex::new(Transcript {
                history: session.messages,
                unpersisted: Vec::new(),
            }),
            services,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    pub fn subscribe(&self) -> Receiver<Notification> {
        self.services.publisher.subscribe(&self.id)
    }

    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.gate.pending()
    }

    pub fn plan(&self) -> PlanEvent {
        self.plan.current()
    }

    /// Live transcript, including anything not yet persisted.
    ///
    /// Blocks while a turn is running.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.lock_transcript().history.clone()
    }

    pub fn unpersisted_count(&self) -> usize {
        self.lock_transcript().unpersisted.len()
    }

    /// Runs a turn for `prompt`, or applies it as a control command.
    pub fn submit(
        &self,
        prompt: &str,
        working_dir: Option<&Path>,
    ) -> Result<SubmitOutcome, TurnError> {
        if let Some(command) = parse_control_command(prompt) {
            return Ok(SubmitOutcome::Control(self.control(command)));
        }
        let working_dir = working_dir
            .filter(|dir| !dir.as_os_str().is_empty())
            .ok_or(TurnError::MissingWorkingDirectory)?;
        if self.gate.is_closed() {
            return Err(TurnError::Cancelled);
        }
        if !self.state.try_begin() {
            return Err(TurnError::Busy);
        }
        let _idle = IdleGuard {
            state: &self.state,
            gate: &self.gate,
        };
        let mut transcript = self.lock_transcript();
        Turn::new(self, &mut transcript, working_dir)
            .run(prompt)
            .map(SubmitOutcome::Turn)
    }

    pub fn control(&self, command: ControlCommand) -> ControlOutcome {
        let resolved = match &command {
            ControlCommand::Approve(id) => self.resolve_one(id, true),
            ControlCommand::Deny(id) => self.resolve_one(id, false),
            ControlCommand::ApproveAll => self.gate.approve_all(),
        };
        let _ = self.services.observer.log(
            &self.id,
            LogLevel::Info,
            &format!("control {command:?} resolved {} approval(s)", resolved.len()),
        );
        ControlOutcome { command, resolved }
    }

    fn resolve_one(&self, id: &str, approve: bool) -> Vec<ApprovalResolution> {
        match self.gate.resolve(id, approve) {
            Some(status) => vec![ApprovalResolution {
                id: id.to_string(),
                status,
            }],
            None => Vec::new(),
        }
    }

    /// Writes messages a failed flush left in memory. Returns how many were
    /// written.
    pub fn retry_persist(&self) -> Result<usize, TurnError> {
        if self.state.get() != LoopState::Idle {
            return Err(TurnError::Busy);
        }
        let mut transcript = self.lock_transcript();
        if transcript.unpersisted.is_empty() {
            return Ok(0);
        }
        let count = transcript.unpersisted.len();
        self.services
            .store
            .append_messages(&self.id, &transcript.unpersisted)
            .map_err(|e| TurnError::Persistence {
                reply: String::new(),
                message: e.to_string(),
            })?;
        transcript.unpersisted.clear();
        Ok(count)
    }

    /// Discards outstanding approvals. Any running turn ends with
    /// [`TurnError::Cancelled`] once its batch closes.
    pub fn teardown(&self) {
        self.gate.close();
        let _ = self
            .services
            .observer
            .log(&self.id, LogLevel::Info, "session torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.gate.is_closed()
    }

    fn lock_transcript(&self) -> MutexGuard<'_, Transcript> {
        self.transcript.lock().unwrap_or_else(|e| e.into_inner())
    }
}
