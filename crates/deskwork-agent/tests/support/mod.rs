#![allow(dead_code)]

use deskwork_agent::{
    AgentRuntime, AgentSession, Clock, Services, SubmitOutcome, SystemClock, TurnError, TurnOutcome,
};
use deskwork_core::{AppSettings, LoopState, TelemetryConfig};
use deskwork_llm::ModelReply;
use deskwork_observe::{Observer, Publisher};
use deskwork_policy::PolicyEngine;
use deskwork_settings::{MemorySecretBackend, SettingsStore};
use deskwork_store::{Store, TranscriptStore};
use deskwork_testkit::{FnTool, ScriptedLlm};
use deskwork_tools::ToolRegistry;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub runtime: Arc<AgentRuntime>,
    pub llm: Arc<ScriptedLlm>,
    pub session_id: String,
}

pub struct HarnessBuilder {
    replies: Vec<ModelReply>,
    tools: Vec<FnTool>,
    settings: AppSettings,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn TranscriptStore>>,
    session_id: Option<String>,
}

pub fn harness() -> HarnessBuilder {
    HarnessBuilder {
        replies: Vec::new(),
        tools: Vec::new(),
        settings: AppSettings::default(),
        clock: Arc::new(SystemClock),
        store: None,
        session_id: None,
    }
}

impl HarnessBuilder {
    pub fn replies(mut self, replies: Vec<ModelReply>) -> Self {
        self.replies = replies;
        self
    }

    pub fn tool(mut self, tool: FnTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn settings(mut self, apply: impl FnOnce(&mut AppSettings)) -> Self {
        apply(&mut self.settings);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Uses `store` and an existing session instead of a fresh SQLite store.
    pub fn store(mut self, store: Arc<dyn TranscriptStore>, session_id: &str) -> Self {
        self.store = Some(store);
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn build(self) -> Harness {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::new(self.replies));
        let mut registry = ToolRegistry::new();
        for tool in self.tools {
            registry.register(tool);
        }

        let (store, session_id): (Arc<dyn TranscriptStore>, String) = match self.store {
            Some(store) => (store, self.session_id.expect("session id")),
            None => {
                let store = Store::new(tmp.path()).expect("store");
                let session = store.create_session("test").expect("session");
                (Arc::new(store), session.id)
            }
        };

        let services = Services {
            llm: llm.clone(),
            registry: Arc::new(registry),
            settings: Arc::new(SettingsStore::in_memory(
                self.settings,
                Arc::new(MemorySecretBackend::new()),
            )),
            store,
            observer: Arc::new(
                Observer::new(tmp.path(), &TelemetryConfig::default()).expect("observer"),
            ),
            publisher: Arc::new(Publisher::new()),
            policy: Arc::new(PolicyEngine::new()),
            clock: self.clock,
        };
        Harness {
            tmp,
            runtime: Arc::new(AgentRuntime::new(services)),
            llm,
            session_id,
        }
    }
}

impl Harness {
    pub fn workdir(&self) -> &Path {
        self.tmp.path()
    }

    pub fn submit(&self, prompt: &str) -> Result<SubmitOutcome, TurnError> {
        self.runtime
            .submit(&self.session_id, prompt, Some(self.tmp.path()))
    }

    pub fn turn(&self, prompt: &str) -> Result<TurnOutcome, TurnError> {
        match self.submit(prompt)? {
            SubmitOutcome::Turn(outcome) => Ok(outcome),
            SubmitOutcome::Control(control) => panic!("unexpected control outcome: {control:?}"),
        }
    }

    /// Runs a turn on a background thread so the test can answer approvals.
    pub fn spawn_turn(
        &self,
        prompt: &str,
    ) -> std::thread::JoinHandle<Result<TurnOutcome, TurnError>> {
        let runtime = self.runtime.clone();
        let session_id = self.session_id.clone();
        let workdir = self.tmp.path().to_path_buf();
        let prompt = prompt.to_string();
        std::thread::spawn(move || {
            match runtime.submit(&session_id, &prompt, Some(&workdir))? {
                SubmitOutcome::Turn(outcome) => Ok(outcome),
                SubmitOutcome::Control(control) => panic!("unexpected control outcome: {control:?}"),
            }
        })
    }

    pub fn stored_messages(&self) -> Vec<deskwork_core::ChatMessage> {
        self.runtime
            .services()
            .store
            .get_session(&self.session_id)
            .expect("get")
            .expect("session")
            .messages
    }
}

/// Polls until the session reaches `state`, for checks that race the turn thread.
pub fn wait_for_state(session: &AgentSession, state: LoopState) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if session.state() == state {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
