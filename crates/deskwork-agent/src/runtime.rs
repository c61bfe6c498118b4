use crate::error::TurnError;
use crate::gate::{Clock, SystemClock};
use crate::session::{AgentSession, SubmitOutcome};
use anyhow::{Result, anyhow, bail};
use deskwork_core::Notification;
use deskwork_llm::{LlmClient, OpenAiClient, OpenAiConfig, RetryingClient};
use deskwork_observe::{AuditEntry, Observer, Publisher};
use deskwork_policy::PolicyEngine;
use deskwork_settings::{SecretBackend, SettingsStore};
use deskwork_store::{Store, TranscriptStore};
use deskwork_tools::{ToolRegistry, default_skills};
use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

/// Process-wide collaborators shared by every session.
#[derive(Clone)]
pub struct Services {
    pub llm: Arc<dyn LlmClient>,
    pub registry: Arc<ToolRegistry>,
    pub settings: Arc<SettingsStore>,
    pub store: Arc<dyn TranscriptStore>,
    pub observer: Arc<Observer>,
    pub publisher: Arc<Publisher>,
    pub policy: Arc<PolicyEngine>,
    pub clock: Arc<dyn Clock>,
}

/// Owns the live sessions. Turns on different sessions run fully in
/// parallel; each session serializes its own turns.
pub struct AgentRuntime {
    services: Services,
    store: Option<Arc<Store>>,
    sessions: Mutex<HashMap<String, Arc<AgentSession>>>,
}

impl AgentRuntime {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            store: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Wires the on-disk settings, session store, logs and audit chain under
    /// `data_dir` and seeds the default skills.
    pub fn open(
        data_dir: &Path,
        llm: Arc<dyn LlmClient>,
        registry: ToolRegistry,
        secrets: Arc<dyn SecretBackend>,
    ) -> Result<Self> {
        let settings = Arc::new(SettingsStore::open(data_dir, secrets)?);
        Self::assemble(data_dir, settings, llm, registry)
    }

    /// Like [`open`](Self::open), with the model client built from the
    /// selected provider and its stored credential.
    pub fn connect(
        data_dir: &Path,
        registry: ToolRegistry,
        secrets: Arc<dyn SecretBackend>,
    ) -> Result<Self> {
        let settings = Arc::new(SettingsStore::open(data_dir, secrets)?);
        let llm = model_client(&settings)?;
        Self::assemble(data_dir, settings, llm, registry)
    }

    fn assemble(
        data_dir: &Path,
        settings: Arc<SettingsStore>,
        llm: Arc<dyn LlmClient>,
        registry: ToolRegistry,
    ) -> Result<Self> {
        let snapshot = settings.snapshot();
        let store = Arc::new(Store::new(data_dir)?);
        store.ensure_skills(&default_skills())?;
        let observer = Observer::new(data_dir, &snapshot.telemetry)?;
        observer.set_structured(snapshot.structured_logs);

        let services = Services {
            llm,
            registry: Arc::new(registry),
            settings,
            store: store.clone(),
            observer: Arc::new(observer),
            publisher: Arc::new(Publisher::new()),
            policy: Arc::new(PolicyEngine::new()),
            clock: Arc::new(SystemClock),
        };
        Ok(Self {
            services,
            store: Some(store),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Echo loop progress to stderr.
    pub fn set_verbose(&self, verbose: bool) {
        self.services.observer.set_verbose(verbose);
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// The SQLite store behind [`open`](Self::open), for session management
    /// outside a turn (list, rename, pin, export, import, templates, skills).
    pub fn store(&self) -> Option<&Arc<Store>> {
        self.store.as_ref()
    }

    /// The live session for `id`, loading its transcript on first use.
    pub fn session(&self, id: &str) -> Result<Arc<AgentSession>, TurnError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.get(id) {
            return Ok(session.clone());
        }
        let session = Arc::new(AgentSession::open(id, self.services.clone())?);
        sessions.insert(id.to_string(), session.clone());
        Ok(session)
    }

    pub fn submit(
        &self,
        session_id: &str,
        prompt: &str,
        working_dir: Option<&Path>,
    ) -> Result<SubmitOutcome, TurnError> {
        self.session(session_id)?.submit(prompt, working_dir)
    }

    pub fn subscribe(&self, session_id: &str) -> Receiver<Notification> {
        self.services.publisher.subscribe(session_id)
    }

    /// Drops the session, discarding its pending approvals without running
    /// anything. Returns `false` when the session was not live.
    pub fn teardown(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        let Some(session) = removed else {
            return false;
        };
        session.teardown();
        self.services.publisher.close(session_id);
        true
    }

    pub fn shutdown(&self) {
        let sessions: Vec<Arc<AgentSession>> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            session.teardown();
            self.services.publisher.close(session.id());
        }
    }

    pub fn session_log(&self, session_id: &str) -> Result<String> {
        self.services.observer.session_log(session_id)
    }

    pub fn recent_audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.services.observer.audit().recent(limit)
    }

    pub fn verify_audit_chain(&self) -> Result<bool> {
        self.services.observer.audit().verify_chain()
    }
}

/// Retrying client for the selected provider. The provider is read once;
/// switching providers takes a new runtime.
pub fn model_client(settings: &SettingsStore) -> Result<Arc<dyn LlmClient>> {
    let snapshot = settings.snapshot();
    if snapshot.provider != "openai" {
        bail!("provider '{}' is not supported", snapshot.provider);
    }
    let key = settings
        .active_credential()?
        .ok_or_else(|| anyhow!("no API key stored for provider '{}'", snapshot.provider))?;
    let mut cfg = OpenAiConfig::new(key);
    if let Some(base) = snapshot.api_base.filter(|b| !b.trim().is_empty()) {
        cfg = cfg.with_endpoint(base);
    }
    Ok(Arc::new(RetryingClient::new(OpenAiClient::new(cfg)?)))
}
