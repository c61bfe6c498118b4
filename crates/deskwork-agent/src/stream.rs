//! Incremental assistant text.
//!
//! [`StreamAssembler`] turns model tokens into numbered `chat_stream` events;
//! [`StreamView`] is the consumer side, folding events into the in-progress
//! assistant message and ignoring redeliveries.
//!
//! Sequence numbers come from a per-session counter, so they keep growing
//! across rounds and turns and a consumer can tell a redelivery from the
//! start of the next message.

use deskwork_core::{ChatStreamEvent, Notification};
use deskwork_llm::{StreamCallback, StreamChunk};
use deskwork_observe::Publisher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct AssemblerState {
    text: String,
    done: bool,
}

pub struct StreamAssembler {
    session_id: String,
    publisher: Arc<Publisher>,
    seq: Arc<AtomicU64>,
    state: Mutex<AssemblerState>,
}

impl StreamAssembler {
    pub fn new(session_id: &str, publisher: Arc<Publisher>, seq: Arc<AtomicU64>) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.to_string(),
            publisher,
            seq,
            state: Mutex::new(AssemblerState::default()),
        })
    }

    /// Callback handed to the model client.
    pub fn callback(self: &Arc<Self>) -> StreamCallback {
        let assembler = self.clone();
        Arc::new(move |chunk| match chunk {
            StreamChunk::Token(token) => assembler.push(&token),
            StreamChunk::Done => assembler.finish(),
        })
    }

    pub fn push(&self, token: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.done || token.is_empty() {
            return;
        }
        state.text.push_str(token);
        self.publisher.publish(
            &self.session_id,
            Notification::ChatStream(ChatStreamEvent {
                seq: self.next_seq(),
                token: token.to_string(),
                done: false,
            }),
        );
    }

    /// Sends the `done` marker once; later calls do nothing.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.done {
            return;
        }
        state.done = true;
        self.publisher.publish(
            &self.session_id,
            Notification::ChatStream(ChatStreamEvent {
                seq: self.next_seq(),
                token: String::new(),
                done: true,
            }),
        );
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn text(&self) -> String {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .text
            .clone()
    }
}

/// Consumer-side fold of `chat_stream` events for one session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamView {
    last_seq: u64,
    text: String,
    done: bool,
}

impl StreamView {
    /// Returns `false` for duplicates and stale events.
    pub fn apply(&mut self, event: &ChatStreamEvent) -> bool {
        if event.seq <= self.last_seq {
            return false;
        }
        if self.done {
            self.text.clear();
        }
        self.last_seq = event.seq;
        self.text.push_str(&event.token);
        self.done = event.done;
        true
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}
