//! Integration tests for transcript persistence: failed flushes keep the
//! conversation going and are retried, and sessions reload from disk.

mod support;

use deskwork_agent::{AgentRuntime, TurnError};
use deskwork_core::{ChatMessage, Sensitivity, ToolKind, validate_transcript};
use deskwork_llm::ModelReply;
use deskwork_settings::MemorySecretBackend;
use deskwork_testkit::{MemoryTranscriptStore, ScriptedLlm, call, counting_tool};
use deskwork_tools::ToolRegistry;
use serde_json::json;
use std::sync::Arc;
use support::harness;

#[test]
fn failed_flush_keeps_the_reply_and_retry_writes_the_tail() {
    let store = Arc::new(MemoryTranscriptStore::new());
    store.create_session("s1");
    store.set_failing(true);
    let (list_dir, _) = counting_tool("list_dir", Sensitivity::Safe, ToolKind::Filesystem, "a.txt");
    let h = harness()
        .store(store.clone(), "s1")
        .tool(list_dir)
        .replies(vec![
            ModelReply::calls(vec![call("c1", "list_dir", json!({}))]),
            ModelReply::text("One file."),
        ])
        .build();

    let err = h.turn("list files").expect_err("store is failing");
    let TurnError::Persistence { reply, message } = &err else {
        panic!("expected a persistence error, got {err:?}");
    };
    assert_eq!(reply, "One file.");
    assert!(message.contains("disk full"));
    assert!(err.is_recoverable());

    // The turn ran to the end despite the failing store.
    let session = h.runtime.session("s1").expect("session");
    assert_eq!(session.history().len(), 4);
    assert_eq!(session.unpersisted_count(), 4);
    assert!(store.messages("s1").is_empty());

    // Still failing: nothing is lost.
    assert!(matches!(
        session.retry_persist(),
        Err(TurnError::Persistence { .. })
    ));
    assert_eq!(session.unpersisted_count(), 4);

    store.set_failing(false);
    assert_eq!(session.retry_persist().expect("retry"), 4);
    assert_eq!(session.unpersisted_count(), 0);
    assert_eq!(session.retry_persist().expect("nothing left"), 0);

    let saved = store.messages("s1");
    assert_eq!(saved.len(), 4);
    assert!(validate_transcript(&saved).is_ok());
}

#[test]
fn next_turn_flushes_an_earlier_unsaved_tail() {
    let store = Arc::new(MemoryTranscriptStore::new());
    store.create_session("s1");
    let h = harness()
        .store(store.clone(), "s1")
        .replies(vec![ModelReply::text("first"), ModelReply::text("second")])
        .build();

    store.set_failing(true);
    assert!(matches!(h.turn("one"), Err(TurnError::Persistence { .. })));
    store.set_failing(false);
    let outcome = h.turn("two").expect("turn");

    assert_eq!(outcome.reply, "second");
    let texts: Vec<String> = store.messages("s1").iter().map(ChatMessage::text).collect();
    assert_eq!(texts, ["one", "first", "two", "second"]);
}

#[test]
fn sessions_reload_from_disk_with_redacted_tool_output() {
    let data = tempfile::tempdir().expect("tempdir");
    let workdir = tempfile::tempdir().expect("workdir");
    let (list_dir, _) =
        counting_tool("list_dir", Sensitivity::Safe, ToolKind::Filesystem, "secret.txt");

    let session_id = {
        let llm = Arc::new(ScriptedLlm::new(vec![
            ModelReply::calls(vec![call("c1", "list_dir", json!({}))]),
            ModelReply::text("Found it."),
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(list_dir);
        let runtime = AgentRuntime::open(
            data.path(),
            llm,
            registry,
            Arc::new(MemorySecretBackend::new()),
        )
        .expect("runtime");
        let store = runtime.store().expect("sqlite store").clone();
        let session = store.create_session("Find files").expect("session");
        runtime
            .submit(&session.id, "find it", Some(workdir.path()))
            .expect("turn");
        assert!(!store.list_skills().expect("skills").is_empty());
        runtime.shutdown();
        session.id
    };

    let llm = Arc::new(ScriptedLlm::new(vec![ModelReply::text("Still here.")]));
    let runtime = AgentRuntime::open(
        data.path(),
        llm.clone(),
        ToolRegistry::new(),
        Arc::new(MemorySecretBackend::new()),
    )
    .expect("reopen");
    runtime.set_verbose(true);
    runtime
        .submit(&session_id, "are you there?", Some(workdir.path()))
        .expect("turn");

    // The reloaded transcript carries the placeholder, never the output.
    let sent = &llm.requests()[0].messages;
    assert_eq!(sent.len(), 5);
    assert_eq!(sent[2].text(), "[tool output redacted: 10 bytes]");
    assert!(validate_transcript(sent).is_ok());

    let log = runtime.session_log(&session_id).expect("log");
    assert!(log.contains("turn started"));
}
