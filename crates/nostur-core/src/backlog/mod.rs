//! In-flight request registry.
//!
//! Every outgoing REQ is registered here before it is sent, then matched to
//! relay responses by subscription id. A task moves
//! `Pending -> Sent -> (AltSent) -> resolved`, and resolves exactly once:
//! with the first matching EVENT or EOSE, or with a timeout.

pub mod task;
pub mod timer;

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::relay::{ClientMessage, ConnectionPool, RelayMessage};

pub use task::{
    RequestBuilder, ReqTask, ReqTaskBuilder, ResponsePayload, TaskHandle, TaskOutcome, TaskResponse,
};
pub use timer::{Debouncer, Periodic};

#[derive(Debug, thiserror::Error)]
pub enum BacklogError {
    #[error("Subscription id already in use: {0}")]
    DuplicateSubscription(String),
}

/// Where the backlog sends its frames
pub trait RequestSink {
    /// Send to every read relay, returning how many relays it reached
    fn send_req(&self, message: &ClientMessage) -> usize;
    /// Send to one relay, connecting to it if needed
    fn send_to_relay(&self, relay_url: &str, message: &ClientMessage) -> bool;
    /// CLOSE on one relay, or everywhere when `relay_url` is `None`
    fn close(&self, subscription_id: &str, relay_url: Option<&str>);
}

impl RequestSink for ConnectionPool {
    fn send_req(&self, message: &ClientMessage) -> usize {
        self.publish_req(message)
    }

    fn send_to_relay(&self, relay_url: &str, message: &ClientMessage) -> bool {
        match self.connection_by_url(relay_url) {
            Some(connection) if !connection.is_ephemeral() => {
                connection.send(message);
                connection.connect();
                true
            }
            _ => self.send_to_relay_hint(relay_url, message),
        }
    }

    fn close(&self, subscription_id: &str, relay_url: Option<&str>) {
        self.close_subscription(subscription_id, relay_url);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending { send_at: Instant },
    Sent { deadline: Instant },
    AltSent { deadline: Instant },
}

impl TaskState {
    fn deadline(&self) -> Instant {
        match *self {
            Self::Pending { send_at } => send_at,
            Self::Sent { deadline } | Self::AltSent { deadline } => deadline,
        }
    }
}

/// Running totals of how tasks ended
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BacklogStats {
    pub completed: u64,
    pub alt_retried: u64,
    pub timed_out: u64,
    /// Dropped through `remove` or `clear`
    pub cancelled: u64,
}

struct TaskEntry {
    task: ReqTask,
    state: TaskState,
    reply: oneshot::Sender<TaskOutcome>,
}

pub struct Backlog {
    tasks: HashMap<String, TaskEntry>,
    /// Resolved subscriptions still open on some relay, with their final CLOSE deadline
    draining: HashMap<String, Instant>,
    default_timeout: Duration,
    stats: BacklogStats,
}

impl Backlog {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tasks: HashMap::new(),
            draining: HashMap::new(),
            default_timeout,
            stats: BacklogStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, subscription_id: &str) -> bool {
        self.tasks.contains_key(subscription_id)
    }

    pub fn is_draining(&self, subscription_id: &str) -> bool {
        self.draining.contains_key(subscription_id)
    }

    pub fn stats(&self) -> BacklogStats {
        self.stats
    }

    /// Register a task. Nothing is sent until the task's debounce elapses
    /// and [`Backlog::poll_timers`] runs.
    pub fn add(&mut self, task: ReqTask, now: Instant) -> Result<TaskHandle, BacklogError> {
        let id = task.subscription_id().to_string();
        if self.tasks.contains_key(&id) || self.draining.contains_key(&id) {
            return Err(BacklogError::DuplicateSubscription(id));
        }
        let (handle, reply) = TaskHandle::new(id.clone());
        let state = TaskState::Pending {
            send_at: now + task.debounce(),
        };
        tracing::debug!("[BACKLOG] registered {} ({} in flight)", id, self.tasks.len() + 1);
        self.tasks.insert(id, TaskEntry { task, state, reply });
        Ok(handle)
    }

    /// Re-arm the debounce of a task that has not been sent yet
    pub fn trigger(&mut self, subscription_id: &str, now: Instant) -> bool {
        match self.tasks.get_mut(subscription_id) {
            Some(entry) => match entry.state {
                TaskState::Pending { .. } => {
                    entry.state = TaskState::Pending {
                        send_at: now + entry.task.debounce(),
                    };
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Match a relay frame against in-flight and draining subscriptions.
    /// Returns true when the frame belonged to the backlog.
    pub fn handle_message(
        &mut self,
        relay_url: &str,
        message: &RelayMessage,
        now: Instant,
        sink: &dyn RequestSink,
    ) -> bool {
        let (subscription_id, payload) = match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => (subscription_id, ResponsePayload::Event(event.clone())),
            RelayMessage::EndOfStoredEvents(subscription_id) => {
                (subscription_id, ResponsePayload::EndOfStoredEvents)
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                if self.tasks.contains_key(subscription_id) {
                    tracing::info!(
                        "[BACKLOG] {} closed by {}: {}",
                        subscription_id,
                        relay_url,
                        message
                    );
                    return true;
                }
                return self.draining.contains_key(subscription_id);
            }
            RelayMessage::Ok { .. } | RelayMessage::Notice(_) => return false,
        };
        let is_eose = matches!(payload, ResponsePayload::EndOfStoredEvents);

        let in_flight = self
            .tasks
            .get(subscription_id)
            .map(|entry| entry.state)
            .filter(|state| !matches!(state, TaskState::Pending { .. }));
        if let Some(state) = in_flight {
            let Some(entry) = self.tasks.remove(subscription_id) else {
                return false;
            };
            let response = TaskResponse {
                relay_url: relay_url.to_string(),
                payload,
            };
            let outcome = match state {
                TaskState::AltSent { .. } => {
                    self.stats.alt_retried += 1;
                    TaskOutcome::AltRetried(response)
                }
                _ => {
                    self.stats.completed += 1;
                    TaskOutcome::Completed(response)
                }
            };
            tracing::debug!("[BACKLOG] {} resolved by {}", subscription_id, relay_url);
            let _ = entry.reply.send(outcome);

            if is_eose {
                sink.close(subscription_id, Some(relay_url));
            }
            let drain_deadline = now + self.timeout_for(&entry.task);
            self.draining.insert(subscription_id.clone(), drain_deadline);
            return true;
        }

        if self.draining.contains_key(subscription_id) {
            if is_eose {
                sink.close(subscription_id, Some(relay_url));
            }
            return true;
        }
        false
    }

    /// Fire every due send, alt request, timeout and drain close
    pub fn poll_timers(&mut self, now: Instant, sink: &dyn RequestSink) {
        let due: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, entry)| entry.state.deadline() <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            let Some(mut entry) = self.tasks.remove(&id) else {
                continue;
            };
            let state = entry.state;
            match state {
                TaskState::Pending { .. } => {
                    let routed = sink.send_req(&entry.task.build_request());
                    tracing::debug!("[BACKLOG] sent {} to {} relays", id, routed);
                    if routed == 0 && entry.task.alt_relay().is_some() {
                        self.send_alt(&mut entry, now, sink);
                    } else {
                        entry.state = TaskState::Sent {
                            deadline: now + self.timeout_for(&entry.task),
                        };
                    }
                    self.tasks.insert(id, entry);
                }
                TaskState::Sent { .. } if entry.task.alt_relay().is_some() => {
                    self.send_alt(&mut entry, now, sink);
                    self.tasks.insert(id, entry);
                }
                TaskState::Sent { .. } | TaskState::AltSent { .. } => {
                    tracing::debug!("[BACKLOG] {} timed out", id);
                    self.stats.timed_out += 1;
                    sink.close(&id, None);
                    let _ = entry.reply.send(TaskOutcome::TimedOut);
                }
            }
        }

        let closing: Vec<String> = self
            .draining
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in closing {
            self.draining.remove(&id);
            sink.close(&id, None);
        }
    }

    fn send_alt(&self, entry: &mut TaskEntry, now: Instant, sink: &dyn RequestSink) {
        if let Some((relay_url, message)) = entry.task.build_alt() {
            tracing::debug!(
                "[BACKLOG] trying relay hint {} for {}",
                relay_url,
                entry.task.subscription_id()
            );
            if !sink.send_to_relay(relay_url, &message) {
                tracing::warn!("[BACKLOG] relay hint {} unusable", relay_url);
            }
        }
        entry.state = TaskState::AltSent {
            deadline: now + self.timeout_for(&entry.task),
        };
    }

    fn timeout_for(&self, task: &ReqTask) -> Duration {
        task.timeout().unwrap_or(self.default_timeout)
    }

    /// Earliest instant at which [`Backlog::poll_timers`] has work
    pub fn next_deadline(&self) -> Option<Instant> {
        let tasks = self.tasks.values().map(|entry| entry.state.deadline());
        let drains = self.draining.values().copied();
        tasks.chain(drains).min()
    }

    /// Drop one task; its handle resolves as timed out. Absent ids are a no-op.
    pub fn remove(&mut self, subscription_id: &str, sink: &dyn RequestSink) -> bool {
        match self.tasks.remove(subscription_id) {
            Some(entry) => {
                if !matches!(entry.state, TaskState::Pending { .. }) {
                    sink.close(subscription_id, None);
                }
                self.stats.cancelled += 1;
                let _ = entry.reply.send(TaskOutcome::TimedOut);
                true
            }
            None => false,
        }
    }

    /// Drop every task and close every subscription the backlog still knows
    pub fn clear(&mut self, sink: &dyn RequestSink) {
        for (id, entry) in self.tasks.drain() {
            if !matches!(entry.state, TaskState::Pending { .. }) {
                sink.close(&id, None);
            }
            self.stats.cancelled += 1;
            let _ = entry.reply.send(TaskOutcome::TimedOut);
        }
        for (id, _) in self.draining.drain() {
            sink.close(&id, None);
        }
    }
}
