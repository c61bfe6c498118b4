//! One user turn: model round, tool batch, repeat until the model answers
//! with text or the round cap is hit.
//!
//! Messages are committed to the live transcript and flushed to the store
//! at round boundaries, so the stored transcript never holds an assistant
//! tool-call message without its results. A failed flush keeps the turn
//! going; the turn then ends with [`TurnError::Persistence`] and the tail
//! waits in memory for the next flush.

use crate::dispatch::{Batch, ToolCallRecord, millis, model_telemetry};
use crate::error::TurnError;
use crate::plan::PlanTracker;
use crate::session::{AgentSession, Transcript};
use crate::stream::StreamAssembler;
use deskwork_core::{ActivityStatus, AppSettings, ChatMessage, LoopState};
use deskwork_llm::{ChatRequest, ModelReply};
use deskwork_observe::LogLevel;
use deskwork_tools::SkillSet;
use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

pub const SYSTEM_PROMPT: &str = "You are a desktop assistant working on the user's machine. \
Use the provided tools to inspect and change files, run commands and operate applications. \
Some tools need the user's approval; if a call is denied or expires, do not retry it, \
explain what you could not do instead. For multi-step work, keep the user informed with \
set_plan and complete_step.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model answered with text.
    Stop,
    /// The round cap was hit; an explanatory assistant message was appended.
    RoundCap,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub finish: FinishReason,
    /// Model calls made during the turn.
    pub rounds: usize,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Messages this turn added to the transcript, in order.
    pub messages: Vec<ChatMessage>,
}

pub(crate) struct Turn<'a> {
    session: &'a AgentSession,
    transcript: &'a mut Transcript,
    working_dir: &'a Path,
    added: Vec<ChatMessage>,
    persist_error: Option<String>,
}

impl<'a> Turn<'a> {
    pub fn new(
        session: &'a AgentSession,
        transcript: &'a mut Transcript,
        working_dir: &'a Path,
    ) -> Self {
        Self {
            session,
            transcript,
            working_dir,
            added: Vec::new(),
            persist_error: None,
        }
    }

    pub fn run(mut self, prompt: &str) -> Result<TurnOutcome, TurnError> {
        let session = self.session;
        self.log(LogLevel::Info, "turn started");
        self.commit(vec![ChatMessage::user(prompt)]);

        let mut records = Vec::new();
        let mut rounds = 0usize;
        loop {
            // Settings written mid-turn apply from the next round on.
            let settings = session.services.settings.snapshot();
            if rounds >= settings.max_rounds.max(1) as usize {
                return self.stop_at_cap(rounds, records);
            }
            rounds += 1;
            session.services.observer.set_structured(settings.structured_logs);
            session.state.set(LoopState::AwaitingModel);

            let skills = self.skills();
            let reply = self.call_model(&settings, &skills)?;
            validate_reply(&reply)?;

            if reply.is_final() {
                let text = reply.text.unwrap_or_default();
                self.commit(vec![ChatMessage::assistant_text(text.clone())]);
                self.log(LogLevel::Info, &format!("turn finished after {rounds} round(s)"));
                return self.finish(text, FinishReason::Stop, rounds, records);
            }

            session.state.set(LoopState::ExecutingTools);
            let batch = Batch {
                services: &session.services,
                session_id: &session.id,
                working_dir: self.working_dir,
                settings: &settings,
                skills: &skills,
                gate: &session.gate,
                plan: &session.plan,
                state: &session.state,
            }
            .run(&reply.tool_calls);
            if session.gate.is_closed() {
                self.log(LogLevel::Warn, "turn cancelled by teardown");
                return Err(TurnError::Cancelled);
            }

            let mut round = Vec::with_capacity(batch.messages.len() + 1);
            round.push(ChatMessage::assistant_calls(reply.text, reply.tool_calls));
            round.extend(batch.messages);
            self.commit(round);
            records.extend(batch.records);
        }
    }

    fn call_model(&self, settings: &AppSettings, skills: &SkillSet) -> Result<ModelReply, TurnError> {
        let session = self.session;
        let services = &session.services;
        let mut tools = services.registry.definitions(&skills.disabled_tools());
        tools.extend(PlanTracker::definitions());
        let request = ChatRequest {
            model: settings.model.clone(),
            system: Some(SYSTEM_PROMPT.to_string()),
            messages: self.transcript.history.clone(),
            tools,
        };

        let started = Instant::now();
        let result = if settings.streaming {
            let assembler = StreamAssembler::new(
                &session.id,
                services.publisher.clone(),
                session.stream_seq.clone(),
            );
            let result = services.llm.send_streaming(&request, assembler.callback());
            assembler.finish();
            result
        } else {
            services.llm.send(&request)
        };
        let duration_ms = millis(started.elapsed());

        let status = if result.is_ok() {
            ActivityStatus::Success
        } else {
            ActivityStatus::Error
        };
        let event = model_telemetry(status, duration_ms);
        if let Err(err) = services.observer.emit_telemetry(&session.id, &event) {
            services
                .observer
                .warn_log(&session.id, &format!("telemetry failed: {err}"));
        }
        services.publisher.telemetry(&session.id, event);

        result.map_err(|err| {
            let message = services.policy.redact(&format!("{err:#}"));
            self.log(LogLevel::Error, &format!("model call failed: {message}"));
            TurnError::Model(message)
        })
    }

    fn skills(&self) -> SkillSet {
        let services = &self.session.services;
        match services.store.skills() {
            Ok(skills) => SkillSet::new(skills),
            Err(err) => {
                services
                    .observer
                    .warn_log(&self.session.id, &format!("skill lookup failed: {err}"));
                SkillSet::new(Vec::new())
            }
        }
    }

    fn stop_at_cap(
        mut self,
        rounds: usize,
        records: Vec<ToolCallRecord>,
    ) -> Result<TurnOutcome, TurnError> {
        let text = format!(
            "Stopped after {rounds} tool rounds without a final answer. \
             Send another message to let me continue."
        );
        self.log(LogLevel::Warn, &format!("round cap of {rounds} reached"));
        self.commit(vec![ChatMessage::assistant_text(text.clone())]);
        self.finish(text, FinishReason::RoundCap, rounds, records)
    }

    fn finish(
        self,
        reply: String,
        finish: FinishReason,
        rounds: usize,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Result<TurnOutcome, TurnError> {
        if !self.transcript.unpersisted.is_empty() {
            return Err(TurnError::Persistence {
                reply,
                message: self
                    .persist_error
                    .unwrap_or_else(|| "messages were not saved".to_string()),
            });
        }
        Ok(TurnOutcome {
            reply,
            finish,
            rounds,
            tool_calls,
            messages: self.added,
        })
    }

    /// Adds messages to the live transcript and tries to flush the unsaved tail.
    fn commit(&mut self, messages: Vec<ChatMessage>) {
        self.transcript.history.extend(messages.iter().cloned());
        self.added.extend(messages.iter().cloned());
        self.transcript.unpersisted.extend(messages);

        let session = self.session;
        match session
            .services
            .store
            .append_messages(&session.id, &self.transcript.unpersisted)
        {
            Ok(()) => self.transcript.unpersisted.clear(),
            Err(err) => {
                let message = format!("{err:#}");
                session
                    .services
                    .observer
                    .warn_log(&session.id, &format!("persist failed: {message}"));
                self.persist_error = Some(message);
            }
        }
    }

    fn log(&self, level: LogLevel, message: &str) {
        let _ = self
            .session
            .services
            .observer
            .log(&self.session.id, level, message);
    }
}

/// Rejects replies the loop cannot act on.
pub(crate) fn validate_reply(reply: &ModelReply) -> Result<(), TurnError> {
    let has_text = reply.text.as_deref().is_some_and(|t| !t.trim().is_empty());
    if reply.tool_calls.is_empty() && !has_text {
        return Err(TurnError::MalformedReply(
            "reply has neither text nor tool calls".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for call in &reply.tool_calls {
        if call.id.trim().is_empty() || call.name.trim().is_empty() {
            return Err(TurnError::MalformedReply(
                "tool call without id or name".to_string(),
            ));
        }
        if !seen.insert(call.id.as_str()) {
            return Err(TurnError::MalformedReply(format!(
                "duplicate tool call id '{}'",
                call.id
            )));
        }
    }
    Ok(())
}
