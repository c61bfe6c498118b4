//! Per-session approval gate.
//!
//! Every tool call passes through [`ApprovalGate::intercept`]. Calls the
//! policy lets through are auto-approved; the rest become pending approvals
//! that a dispatch worker parks on with [`ApprovalGate::wait`] until the user
//! resolves them, they expire, or the session is torn down.
//!
//! Expiry is lazy: every inspection of the gate first moves stale pending
//! entries to `Expired`. Waiters re-inspect on a short poll so an expiry is
//! noticed even when nobody else touches the gate.

use deskwork_core::{ApprovalResolution, ApprovalStatus, Notification, PendingApproval, new_id};
use deskwork_observe::Publisher;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

const DEFAULT_POLL: Duration = Duration::from_millis(250);

pub trait Clock: Send + Sync {
    /// Unix epoch milliseconds.
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        deskwork_core::now_ms()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
    Expired,
    /// The session went away before a decision; nothing runs.
    Discarded,
}

impl ApprovalState {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }

    fn as_status(self) -> Option<ApprovalStatus> {
        match self {
            Self::Approved => Some(ApprovalStatus::Approved),
            Self::Denied => Some(ApprovalStatus::Denied),
            Self::Expired => Some(ApprovalStatus::Expired),
            Self::Pending | Self::Discarded => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception {
    AutoApproved,
    Pending(PendingApproval),
}

/// One tool call as seen by the gate.
#[derive(Debug, Clone)]
pub struct GateRequest<'a> {
    pub tool: &'a str,
    pub action: &'a str,
    /// Set by the policy when the call may not run unattended.
    pub reason: Option<String>,
    /// A standing "approve all" may only auto-approve when this is true.
    pub standing_allowed: bool,
    pub expires_at: u64,
}

struct Entry {
    approval: PendingApproval,
    state: ApprovalState,
}

#[derive(Default)]
struct GateInner {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
    approve_all: bool,
    closed: bool,
}

pub struct ApprovalGate {
    session_id: String,
    inner: Mutex<GateInner>,
    changed: Condvar,
    clock: Arc<dyn Clock>,
    publisher: Arc<Publisher>,
    poll: Duration,
}

impl ApprovalGate {
    pub fn new(session_id: &str, clock: Arc<dyn Clock>, publisher: Arc<Publisher>) -> Self {
        Self {
            session_id: session_id.to_string(),
            inner: Mutex::new(GateInner::default()),
            changed: Condvar::new(),
            clock,
            publisher,
            poll: DEFAULT_POLL,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decides whether a call runs now or waits for the user.
    ///
    /// A pending call emits `approval_request`; its id is fresh and unrelated
    /// to the model's tool-call id.
    pub fn intercept(&self, request: &GateRequest<'_>) -> Interception {
        let mut inner = self.lock();
        self.expire_locked(&mut inner);

        let Some(reason) = request.reason.clone() else {
            return Interception::AutoApproved;
        };
        if inner.approve_all && request.standing_allowed && !inner.closed {
            return Interception::AutoApproved;
        }

        let approval = PendingApproval {
            id: new_id(),
            tool: request.tool.to_string(),
            action: request.action.to_string(),
            reason,
            expires_at: request.expires_at,
        };
        // A closed gate still records the entry so the waiter sees Discarded.
        let state = if inner.closed {
            ApprovalState::Discarded
        } else {
            ApprovalState::Pending
        };
        inner.order.push(approval.id.clone());
        inner.entries.insert(
            approval.id.clone(),
            Entry {
                approval: approval.clone(),
                state,
            },
        );
        if state == ApprovalState::Pending {
            self.publisher
                .publish(&self.session_id, Notification::ApprovalRequest(approval.clone()));
        }
        Interception::Pending(approval)
    }

    /// Applies `approve <id>` or `deny <id>`.
    ///
    /// Returns the new status, or `None` when the id is unknown or already
    /// resolved. Re-resolving is a no-op.
    pub fn resolve(&self, id: &str, approve: bool) -> Option<ApprovalStatus> {
        let mut inner = self.lock();
        self.expire_locked(&mut inner);
        let next = if approve {
            ApprovalState::Approved
        } else {
            ApprovalState::Denied
        };
        let resolved = self.transition_locked(&mut inner, id, next);
        if resolved.is_some() {
            self.changed.notify_all();
        }
        resolved
    }

    /// Approves everything pending and auto-approves later calls until
    /// [`end_turn`](Self::end_turn).
    pub fn approve_all(&self) -> Vec<ApprovalResolution> {
        let mut inner = self.lock();
        self.expire_locked(&mut inner);
        inner.approve_all = true;
        let pending: Vec<String> = inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .entries
                    .get(*id)
                    .is_some_and(|e| e.state == ApprovalState::Pending)
            })
            .cloned()
            .collect();
        let mut resolved = Vec::new();
        for id in pending {
            if let Some(status) = self.transition_locked(&mut inner, &id, ApprovalState::Approved) {
                resolved.push(ApprovalResolution { id, status });
            }
        }
        self.changed.notify_all();
        resolved
    }

    /// Blocks until the approval reaches a terminal state.
    pub fn wait(&self, id: &str) -> ApprovalState {
        let mut inner = self.lock();
        loop {
            self.expire_locked(&mut inner);
            match inner.entries.get(id).map(|e| e.state) {
                None => return ApprovalState::Discarded,
                Some(ApprovalState::Pending) => {}
                Some(terminal) => return terminal,
            }
            let (guard, _) = self
                .changed
                .wait_timeout(inner, self.poll)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }
    }

    pub fn state(&self, id: &str) -> Option<ApprovalState> {
        let mut inner = self.lock();
        self.expire_locked(&mut inner);
        inner.entries.get(id).map(|e| e.state)
    }

    /// Pending approvals in request order.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut inner = self.lock();
        self.expire_locked(&mut inner);
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .filter(|e| e.state == ApprovalState::Pending)
            .map(|e| e.approval.clone())
            .collect()
    }

    /// Moves stale pending entries to `Expired`; returns how many moved.
    pub fn expire_stale(&self) -> usize {
        let mut inner = self.lock();
        let expired = self.expire_locked(&mut inner);
        if expired > 0 {
            self.changed.notify_all();
        }
        expired
    }

    /// Drops the standing directive and forgets resolved entries.
    pub fn end_turn(&self) {
        let mut inner = self.lock();
        inner.approve_all = false;
        let GateInner { order, entries, .. } = &mut *inner;
        entries.retain(|_, e| e.state == ApprovalState::Pending);
        order.retain(|id| entries.contains_key(id));
    }

    /// Discards every pending approval without notifying anyone and wakes
    /// the waiters. The gate stays closed.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.approve_all = false;
        for entry in inner.entries.values_mut() {
            if entry.state == ApprovalState::Pending {
                entry.state = ApprovalState::Discarded;
            }
        }
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn expire_locked(&self, inner: &mut GateInner) -> usize {
        let now = self.clock.now_ms();
        let stale: Vec<String> = inner
            .order
            .iter()
            .filter(|id| {
                inner.entries.get(*id).is_some_and(|e| {
                    e.state == ApprovalState::Pending && e.approval.is_expired_at(now)
                })
            })
            .cloned()
            .collect();
        for id in &stale {
            self.transition_locked(inner, id, ApprovalState::Expired);
        }
        stale.len()
    }

    fn transition_locked(
        &self,
        inner: &mut GateInner,
        id: &str,
        next: ApprovalState,
    ) -> Option<ApprovalStatus> {
        let entry = inner.entries.get_mut(id)?;
        if entry.state.is_terminal() {
            return None;
        }
        entry.state = next;
        let status = next.as_status()?;
        self.publisher.publish(
            &self.session_id,
            Notification::ApprovalResolved(ApprovalResolution {
                id: id.to_string(),
                status,
            }),
        );
        Some(status)
    }
}
