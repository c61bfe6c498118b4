//! Per-session notification fan-out.
//!
//! Every session owns a channel list that the presentation layer subscribes
//! to. Activity events coalesce by id so late subscribers can read the last
//! known status of each unit of work; telemetry is kept in a capped ring.
//!
//! A channel exists from `open` (or the first `subscribe`) until `close`.
//! Events for a session without a channel are dropped.

use deskwork_core::{ActivityEvent, Notification, TelemetryEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};

pub const TELEMETRY_CAPACITY: usize = 200;
/// Finished activity entries kept per session; running ones are never pruned.
pub const ACTIVITY_CAPACITY: usize = 500;

#[derive(Default)]
struct SessionChannel {
    subscribers: Vec<Sender<Notification>>,
    activity_order: Vec<String>,
    activity: HashMap<String, ActivityEvent>,
    telemetry: VecDeque<TelemetryEvent>,
}

impl SessionChannel {
    // Sent while the caller holds the lock, so events for one session
    // arrive in publish order.
    fn fan_out(&mut self, event: Notification) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Forgets the oldest finished entries once the map outgrows `capacity`.
    fn prune_activity(&mut self, capacity: usize) {
        let mut excess = self.activity_order.len().saturating_sub(capacity);
        if excess == 0 {
            return;
        }
        let activity = &mut self.activity;
        self.activity_order.retain(|id| {
            let finished = activity.get(id).is_some_and(|a| a.status.is_terminal());
            if excess > 0 && finished {
                activity.remove(id);
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

pub struct Publisher {
    sessions: Mutex<HashMap<String, SessionChannel>>,
    telemetry_capacity: usize,
    activity_capacity: usize,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher {
    pub fn new() -> Self {
        Self::with_capacity(TELEMETRY_CAPACITY)
    }

    pub fn with_capacity(telemetry_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            telemetry_capacity: telemetry_capacity.max(1),
            activity_capacity: ACTIVITY_CAPACITY,
        }
    }

    pub fn with_activity_capacity(mut self, capacity: usize) -> Self {
        self.activity_capacity = capacity.max(1);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionChannel>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` against an open channel; `None` when the session has none.
    fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionChannel) -> T,
    ) -> Option<T> {
        self.lock().get_mut(session_id).map(f)
    }

    /// Starts buffering events for a session. Idempotent.
    pub fn open(&self, session_id: &str) {
        self.lock().entry(session_id.to_string()).or_default();
    }

    pub fn subscribe(&self, session_id: &str) -> Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        self.lock()
            .entry(session_id.to_string())
            .or_default()
            .subscribers
            .push(tx);
        rx
    }

    /// Delivers an event to every live subscriber of the session.
    pub fn publish(&self, session_id: &str, event: Notification) {
        match event {
            Notification::Activity(activity) => {
                self.activity(session_id, activity);
            }
            Notification::Telemetry(telemetry) => self.telemetry(session_id, telemetry),
            other => {
                self.with_session(session_id, |channel| channel.fan_out(other));
            }
        }
    }

    /// Records and forwards an activity update.
    ///
    /// Returns `false` when the update was dropped, either because the
    /// session is closed or because the same id had already reached
    /// `success` or `error`.
    pub fn activity(&self, session_id: &str, event: ActivityEvent) -> bool {
        let capacity = self.activity_capacity;
        self.with_session(session_id, |channel| {
            match channel.activity.get(&event.id) {
                Some(previous) if previous.status.is_terminal() && !event.status.is_terminal() => {
                    return false;
                }
                Some(_) => {}
                None => channel.activity_order.push(event.id.clone()),
            }
            channel.activity.insert(event.id.clone(), event.clone());
            channel.prune_activity(capacity);
            channel.fan_out(Notification::Activity(event));
            true
        })
        .unwrap_or(false)
    }

    pub fn telemetry(&self, session_id: &str, event: TelemetryEvent) {
        let capacity = self.telemetry_capacity;
        self.with_session(session_id, |channel| {
            if channel.telemetry.len() == capacity {
                channel.telemetry.pop_front();
            }
            channel.telemetry.push_back(event.clone());
            channel.fan_out(Notification::Telemetry(event));
        });
    }

    /// Last known status per activity id, in first-seen order.
    pub fn activities(&self, session_id: &str) -> Vec<ActivityEvent> {
        self.with_session(session_id, |channel| {
            channel
                .activity_order
                .iter()
                .filter_map(|id| channel.activity.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn recent_telemetry(&self, session_id: &str) -> Vec<TelemetryEvent> {
        self.with_session(session_id, |channel| channel.telemetry.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops subscribers and buffered state for a torn-down session. Later
    /// events for it are discarded until it is opened again.
    pub fn close(&self, session_id: &str) {
        self.lock().remove(session_id);
    }
}
