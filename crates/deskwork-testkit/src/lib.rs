//! Fakes shared by the integration tests: a scripted model, closure tools,
//! an in-memory transcript store and a notification collector.

use anyhow::{Result, anyhow};
use chrono::Utc;
use deskwork_core::{
    ChatMessage, MessageContent, Notification, Sensitivity, Session, Skill, ToolCall, ToolKind,
};
use deskwork_llm::{ChatRequest, LlmClient, ModelError, ModelReply, StreamCallback, StreamChunk};
use deskwork_policy::PolicyEngine;
use deskwork_store::{StoreError, TranscriptStore, redact_for_storage};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub use deskwork_tools::FnTool;

pub fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

// ── Model ──────────────────────────────────────────────────────────────

enum Step {
    Reply(ModelReply),
    Fail(ModelError),
}

/// Model client that replays a fixed script and records every request.
#[derive(Default)]
pub struct ScriptedLlm {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        let llm = Self::default();
        for reply in replies {
            llm.push(reply);
        }
        llm
    }

    pub fn push(&self, reply: ModelReply) {
        self.lock_steps().push_back(Step::Reply(reply));
    }

    pub fn push_failure(&self, error: ModelError) {
        self.lock_steps().push_back(Step::Fail(error));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.lock_steps().len()
    }

    fn lock_steps(&self) -> std::sync::MutexGuard<'_, VecDeque<Step>> {
        self.steps.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LlmClient for ScriptedLlm {
    fn send(&self, req: &ChatRequest) -> Result<ModelReply> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(req.clone());
        match self.lock_steps().pop_front() {
            Some(Step::Reply(reply)) => Ok(reply),
            Some(Step::Fail(error)) => Err(error.into()),
            None => Err(ModelError::Unavailable("script exhausted".to_string()).into()),
        }
    }

    /// Emits the reply text word by word, keeping the separating spaces.
    fn send_streaming(&self, req: &ChatRequest, cb: StreamCallback) -> Result<ModelReply> {
        let reply = self.send(req)?;
        if let Some(text) = reply.text.as_deref() {
            for token in text.split_inclusive(' ') {
                cb(StreamChunk::Token(token.to_string()));
            }
        }
        cb(StreamChunk::Done);
        Ok(reply)
    }
}

// ── Tools ──────────────────────────────────────────────────────────────

/// Tool that answers with a fixed string and counts its executions.
pub fn counting_tool(
    name: &str,
    sensitivity: Sensitivity,
    kind: ToolKind,
    output: &str,
) -> (FnTool, Arc<AtomicUsize>) {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let output = output.to_string();
    let tool = FnTool::new(name, sensitivity, kind, move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(MessageContent::Text(output.clone()))
    });
    (tool, runs)
}

/// Tool that sleeps before answering, to shuffle completion order.
pub fn delayed_tool(name: &str, sensitivity: Sensitivity, delay: Duration) -> FnTool {
    let label = name.to_string();
    FnTool::new(name, sensitivity, ToolKind::System, move |_, _| {
        std::thread::sleep(delay);
        Ok(MessageContent::Text(format!("{label} done")))
    })
}

// ── Storage ────────────────────────────────────────────────────────────

/// Transcript store kept in memory, with a switch that makes appends fail.
pub struct MemoryTranscriptStore {
    sessions: Mutex<HashMap<String, Session>>,
    skills: Mutex<Vec<Skill>>,
    failing: AtomicBool,
    policy: PolicyEngine,
}

impl Default for MemoryTranscriptStore {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            skills: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            policy: PolicyEngine::default(),
        }
    }
}

impl MemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_session(&self, id: &str) -> Session {
        let now = Utc::now();
        let session = Session {
            id: id.to_string(),
            title: "New Chat".to_string(),
            created_at: now,
            updated_at: now,
            pinned: false,
            messages: Vec::new(),
        };
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), session.clone());
        session
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_skills(&self, skills: Vec<Skill>) {
        *self.skills.lock().unwrap_or_else(|e| e.into_inner()) = skills;
    }

    pub fn messages(&self, id: &str) -> Vec<ChatMessage> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }
}

impl TranscriptStore for MemoryTranscriptStore {
    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    fn append_messages(&self, id: &str, messages: &[ChatMessage]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        session
            .messages
            .extend(messages.iter().map(|m| redact_for_storage(&self.policy, m)));
        session.updated_at = Utc::now().max(session.updated_at);
        Ok(())
    }

    fn skills(&self) -> Result<Vec<Skill>> {
        Ok(self.skills.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

// ── Notifications ──────────────────────────────────────────────────────

/// Collects notifications from a session subscription.
pub struct NotificationLog {
    rx: Receiver<Notification>,
    seen: Vec<Notification>,
}

impl NotificationLog {
    pub fn new(rx: Receiver<Notification>) -> Self {
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    /// Everything received so far, including events still queued.
    pub fn drain(&mut self) -> &[Notification] {
        self.seen.extend(self.rx.try_iter());
        &self.seen
    }

    /// Blocks until an event matching `pred` arrives or `timeout` passes.
    pub fn wait_for<F>(&mut self, timeout: Duration, pred: F) -> Option<Notification>
    where
        F: Fn(&Notification) -> bool,
    {
        if let Some(found) = self.drain().iter().find(|n| pred(n)) {
            return Some(found.clone());
        }
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(event) => {
                    let hit = pred(&event);
                    self.seen.push(event.clone());
                    if hit {
                        return Some(event);
                    }
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Waits for `count` approval requests and returns them in arrival order.
    pub fn wait_for_approvals(
        &mut self,
        count: usize,
        timeout: Duration,
    ) -> Vec<deskwork_core::PendingApproval> {
        let deadline = Instant::now() + timeout;
        loop {
            let found: Vec<_> = self
                .drain()
                .iter()
                .filter_map(|n| match n {
                    Notification::ApprovalRequest(p) => Some(p.clone()),
                    _ => None,
                })
                .collect();
            if found.len() >= count || Instant::now() >= deadline {
                return found;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn named(&mut self, name: &str) -> Vec<Notification> {
        self.drain()
            .iter()
            .filter(|n| n.name() == name)
            .cloned()
            .collect()
    }
}
