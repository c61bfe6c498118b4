//! Integration tests for the turn loop without user approvals: safe tools,
//! plan updates, unknown and disabled tools, the round cap, streaming and
//! model failures.

mod support;

use deskwork_agent::{FinishReason, StreamView, TurnError};
use deskwork_core::{
    ActivityStatus, ChatMessage, LoopState, Notification, Sensitivity, Skill, ToolKind,
    ToolResultStatus,
};
use deskwork_llm::{ModelError, ModelReply};
use deskwork_testkit::{FnTool, MemoryTranscriptStore, NotificationLog, call, counting_tool};
use deskwork_tools::ToolError;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use support::harness;

fn tool_results(messages: &[ChatMessage]) -> Vec<(String, ToolResultStatus)> {
    messages
        .iter()
        .filter_map(|m| match m {
            ChatMessage::Tool { content, status, .. } => Some((content.as_text(), *status)),
            _ => None,
        })
        .collect()
}

// ── Safe tools ──

#[test]
fn safe_tool_runs_without_approval_and_answers() {
    let (list_dir, runs) =
        counting_tool("list_dir", Sensitivity::Safe, ToolKind::Filesystem, "a.txt\nb.txt");
    let h = harness()
        .tool(list_dir)
        .replies(vec![
            ModelReply::calls(vec![call("c1", "list_dir", json!({"path": "."}))]),
            ModelReply::text("Two files: a.txt and b.txt."),
        ])
        .build();
    let mut events = NotificationLog::new(h.runtime.subscribe(&h.session_id));

    let outcome = h.turn("what is in this folder?").expect("turn");

    assert_eq!(outcome.reply, "Two files: a.txt and b.txt.");
    assert_eq!(outcome.finish, FinishReason::Stop);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.tool_calls.len(), 1);
    assert_eq!(outcome.tool_calls[0].status, ToolResultStatus::Success);
    assert_eq!(outcome.tool_calls[0].approval_id, None);
    assert!(events.named("approval_request").is_empty());

    let statuses: Vec<ActivityStatus> = events
        .named("activity")
        .into_iter()
        .filter_map(|n| match n {
            Notification::Activity(a) => Some(a.status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, [ActivityStatus::Running, ActivityStatus::Success]);
    assert!(
        events
            .named("telemetry")
            .iter()
            .any(|n| matches!(n, Notification::Telemetry(t) if t.tool == "list_dir"))
    );

    // The model saw the full output on the second request.
    let requests = h.llm.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        tool_results(&requests[1].messages),
        [("a.txt\nb.txt".to_string(), ToolResultStatus::Success)]
    );

    // Disk keeps a placeholder; the live transcript keeps the output.
    let stored = h.stored_messages();
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[2].text(), "[tool output redacted: 11 bytes]");
    let live = h.runtime.session(&h.session_id).expect("session").history();
    assert_eq!(live[2].text(), "a.txt\nb.txt");

    let audit = h.runtime.recent_audit_entries(10).expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].tool, "list_dir");
    assert_eq!(audit[0].status, "success");
    assert!(h.runtime.verify_audit_chain().expect("verify"));
}

#[test]
fn session_is_idle_after_a_turn() {
    let h = harness().replies(vec![ModelReply::text("hi")]).build();
    h.turn("hello").expect("turn");
    let session = h.runtime.session(&h.session_id).expect("session");
    assert_eq!(session.state(), LoopState::Idle);
    assert_eq!(session.unpersisted_count(), 0);
}

#[test]
fn missing_working_directory_is_rejected_before_the_model_is_called() {
    let h = harness().replies(vec![ModelReply::text("hi")]).build();
    let err = h
        .runtime
        .submit(&h.session_id, "hello", None)
        .expect_err("no working dir");
    assert!(matches!(err, TurnError::MissingWorkingDirectory));
    let err = h
        .runtime
        .submit(&h.session_id, "hello", Some(std::path::Path::new("")))
        .expect_err("empty working dir");
    assert!(matches!(err, TurnError::MissingWorkingDirectory));
    assert!(h.llm.requests().is_empty());
}

#[test]
fn unknown_session_is_reported() {
    let h = harness().build();
    let err = h
        .runtime
        .submit("no-such-session", "hello", Some(h.workdir()))
        .expect_err("unknown session");
    assert!(matches!(err, TurnError::SessionNotFound(ref id) if id == "no-such-session"));
}

// ── Error results ──

#[test]
fn unknown_tool_becomes_an_error_result() {
    let h = harness()
        .replies(vec![
            ModelReply::calls(vec![call("c1", "frobnicate", json!({}))]),
            ModelReply::text("That tool does not exist."),
        ])
        .build();

    let outcome = h.turn("frobnicate it").expect("turn");

    assert_eq!(outcome.tool_calls[0].status, ToolResultStatus::Error);
    assert_eq!(
        tool_results(&outcome.messages),
        [("Tool not found: frobnicate".to_string(), ToolResultStatus::Error)]
    );
    assert_eq!(outcome.reply, "That tool does not exist.");
}

#[test]
fn disabled_skill_hides_the_tool_and_refuses_calls() {
    let store = Arc::new(MemoryTranscriptStore::new());
    store.create_session("s1");
    store.set_skills(vec![Skill {
        id: "shell".to_string(),
        name: "Shell".to_string(),
        description: "Run commands".to_string(),
        enabled: false,
        tools: vec!["run_command".to_string()],
    }]);
    let (run_command, runs) =
        counting_tool("run_command", Sensitivity::Sensitive, ToolKind::Shell, "ran");
    let (list_dir, _) = counting_tool("list_dir", Sensitivity::Safe, ToolKind::Filesystem, "");
    let h = harness()
        .store(store, "s1")
        .tool(run_command)
        .tool(list_dir)
        .replies(vec![
            ModelReply::calls(vec![call("c1", "run_command", json!({"command": "ls"}))]),
            ModelReply::text("Shell is off."),
        ])
        .build();

    let outcome = h.turn("run ls").expect("turn");

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        tool_results(&outcome.messages),
        [("tool disabled: run_command".to_string(), ToolResultStatus::Error)]
    );
    let offered: Vec<String> = h.llm.requests()[0]
        .tools
        .iter()
        .map(|t| t.function.name.clone())
        .collect();
    assert!(offered.contains(&"list_dir".to_string()));
    assert!(offered.contains(&"set_plan".to_string()));
    assert!(!offered.contains(&"run_command".to_string()));
}

#[test]
fn failing_tool_reports_the_error_to_the_model() {
    let broken = FnTool::new(
        "read_file",
        Sensitivity::Safe,
        ToolKind::Filesystem,
        |_, _| Err(ToolError::Failed("no such file".to_string())),
    )
    .with_description("Read a text file in the workspace");
    let h = harness()
        .tool(broken)
        .replies(vec![
            ModelReply::calls(vec![call("c1", "read_file", json!({"path": "x"}))]),
            ModelReply::text("The file is missing."),
        ])
        .build();

    let outcome = h.turn("read x").expect("turn");

    let results = tool_results(&outcome.messages);
    assert_eq!(results[0].1, ToolResultStatus::Error);
    assert!(results[0].0.contains("no such file"));
    assert_eq!(outcome.reply, "The file is missing.");
}

// ── Plan ──

#[test]
fn set_plan_publishes_a_plan_update() {
    let h = harness()
        .replies(vec![
            ModelReply::calls(vec![call(
                "c1",
                "set_plan",
                json!({"steps": ["inspect", "edit", "verify"], "current_step": 0}),
            )]),
            ModelReply::calls(vec![call("c2", "complete_step", json!({"step_index": 0}))]),
            ModelReply::text("Working on it."),
        ])
        .build();
    let mut events = NotificationLog::new(h.runtime.subscribe(&h.session_id));

    let outcome = h.turn("fix the bug").expect("turn");

    let plans: Vec<_> = events
        .named("plan_update")
        .into_iter()
        .filter_map(|n| match n {
            Notification::PlanUpdate(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(plans.len(), 2);
    assert_eq!(plans[0].steps, ["inspect", "edit", "verify"]);
    assert_eq!(plans[0].current_step, 0);
    assert_eq!(plans[1].current_step, 1);
    assert_eq!(
        h.runtime.session(&h.session_id).expect("session").plan().current_step,
        1
    );
    assert_eq!(outcome.tool_calls[0].status, ToolResultStatus::Success);
}

// ── Round cap ──

#[test]
fn round_cap_stops_with_an_explanation() {
    let (list_dir, runs) = counting_tool("list_dir", Sensitivity::Safe, ToolKind::Filesystem, "x");
    let h = harness()
        .tool(list_dir)
        .settings(|s| s.max_rounds = 2)
        .replies(vec![
            ModelReply::calls(vec![call("c1", "list_dir", json!({}))]),
            ModelReply::calls(vec![call("c2", "list_dir", json!({}))]),
            ModelReply::text("never reached"),
        ])
        .build();

    let outcome = h.turn("loop forever").expect("turn");

    assert_eq!(outcome.finish, FinishReason::RoundCap);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(h.llm.remaining(), 1);
    assert!(outcome.reply.starts_with("Stopped after 2 tool rounds"));
    let last = h.stored_messages().pop().expect("message");
    assert_eq!(last.role(), "assistant");
    assert_eq!(last.text(), outcome.reply);
}

// ── Streaming ──

#[test]
fn streamed_tokens_fold_into_the_reply() {
    let h = harness()
        .settings(|s| s.streaming = true)
        .replies(vec![ModelReply::text("Hello there, friend.")])
        .build();
    let mut events = NotificationLog::new(h.runtime.subscribe(&h.session_id));

    let outcome = h.turn("hi").expect("turn");

    let mut view = StreamView::default();
    for event in events.named("chat_stream") {
        if let Notification::ChatStream(chunk) = event {
            view.apply(&chunk);
            // Redelivery is ignored.
            assert!(!view.apply(&chunk));
        }
    }
    assert!(view.is_done());
    assert_eq!(view.text(), outcome.reply);
}

// ── Model failures ──

#[test]
fn model_failure_ends_the_turn_and_the_session_recovers() {
    let h = harness().build();
    h.llm.push_failure(ModelError::Unavailable("connection refused".to_string()));
    h.llm.push(ModelReply::text("Back online."));

    let err = h.turn("hello").expect_err("model down");
    assert!(matches!(err, TurnError::Model(ref m) if m.contains("connection refused")));
    assert!(err.is_recoverable());
    assert_eq!(
        h.runtime.session(&h.session_id).expect("session").state(),
        LoopState::Idle
    );

    let outcome = h.turn("hello again").expect("turn");
    assert_eq!(outcome.reply, "Back online.");
}

#[test]
fn reply_without_text_or_calls_is_malformed() {
    let h = harness().replies(vec![ModelReply::default()]).build();
    let err = h.turn("hello").expect_err("malformed");
    assert!(matches!(err, TurnError::MalformedReply(_)));
}
