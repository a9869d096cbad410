use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use nostr::Event;
use tokio::sync::oneshot;

use crate::constants::DEFAULT_TASK_PREFIX;
use crate::relay::ClientMessage;

/// Builds a request frame for a given subscription id
pub type RequestBuilder = Arc<dyn Fn(&str) -> ClientMessage + Send + Sync>;

/// One-shot fallback sent to a single relay
#[derive(Clone)]
pub struct AltRequest {
    pub relay_url: String,
    build: RequestBuilder,
}

/// A registered outgoing request.
///
/// The request is built from the subscription id at send time, so the frame
/// on the wire always carries the id the backlog matches responses against.
#[derive(Clone)]
pub struct ReqTask {
    subscription_id: String,
    debounce: Duration,
    timeout: Option<Duration>,
    request: RequestBuilder,
    alt: Option<AltRequest>,
}

impl ReqTask {
    pub fn builder<F>(request: F) -> ReqTaskBuilder
    where
        F: Fn(&str) -> ClientMessage + Send + Sync + 'static,
    {
        ReqTaskBuilder {
            prefix: DEFAULT_TASK_PREFIX.to_string(),
            subscription_id: None,
            debounce: Duration::ZERO,
            timeout: None,
            request: Arc::new(request),
            alt: None,
        }
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// `None` means the backlog's default timeout applies
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn alt_relay(&self) -> Option<&str> {
        self.alt.as_ref().map(|alt| alt.relay_url.as_str())
    }

    pub(crate) fn build_request(&self) -> ClientMessage {
        (self.request)(&self.subscription_id)
    }

    pub(crate) fn build_alt(&self) -> Option<(&str, ClientMessage)> {
        self.alt
            .as_ref()
            .map(|alt| (alt.relay_url.as_str(), (alt.build)(&self.subscription_id)))
    }
}

impl std::fmt::Debug for ReqTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqTask")
            .field("subscription_id", &self.subscription_id)
            .field("debounce", &self.debounce)
            .field("timeout", &self.timeout)
            .field("alt_relay", &self.alt_relay())
            .finish()
    }
}

pub struct ReqTaskBuilder {
    prefix: String,
    subscription_id: Option<String>,
    debounce: Duration,
    timeout: Option<Duration>,
    request: RequestBuilder,
    alt: Option<AltRequest>,
}

impl ReqTaskBuilder {
    /// Prefix for the generated id (`<prefix><uuid>`)
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Use an explicit id instead of a generated one
    pub fn subscription_id(mut self, id: impl Into<String>) -> Self {
        self.subscription_id = Some(id.into());
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn alt<F>(mut self, relay_url: impl Into<String>, request: F) -> Self
    where
        F: Fn(&str) -> ClientMessage + Send + Sync + 'static,
    {
        self.alt = Some(AltRequest {
            relay_url: relay_url.into(),
            build: Arc::new(request),
        });
        self
    }

    pub fn build(self) -> ReqTask {
        let subscription_id = self
            .subscription_id
            .unwrap_or_else(|| format!("{}{}", self.prefix, uuid::Uuid::new_v4()));
        ReqTask {
            subscription_id,
            debounce: self.debounce,
            timeout: self.timeout,
            request: self.request,
            alt: self.alt,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Event(Box<Event>),
    EndOfStoredEvents,
}

/// The relay frame that resolved a task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResponse {
    pub relay_url: String,
    pub payload: ResponsePayload,
}

impl TaskResponse {
    pub fn event(&self) -> Option<&Event> {
        match &self.payload {
            ResponsePayload::Event(event) => Some(event),
            ResponsePayload::EndOfStoredEvents => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The primary request got an answer
    Completed(TaskResponse),
    /// The answer came after the relay-hint request went out
    AltRetried(TaskResponse),
    TimedOut,
}

impl TaskOutcome {
    pub fn response(&self) -> Option<&TaskResponse> {
        match self {
            Self::Completed(response) | Self::AltRetried(response) => Some(response),
            Self::TimedOut => None,
        }
    }

    pub fn event(&self) -> Option<&Event> {
        self.response().and_then(TaskResponse::event)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Resolves exactly once with the task's outcome.
///
/// A handle whose task was dropped without an answer resolves as
/// [`TaskOutcome::TimedOut`].
#[derive(Debug)]
pub struct TaskHandle {
    subscription_id: String,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub(crate) fn new(subscription_id: String) -> (Self, oneshot::Sender<TaskOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { subscription_id, rx }, tx)
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Non-blocking check; `None` while the task is still in flight
    pub fn try_outcome(&mut self) -> Option<TaskOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(TaskOutcome::TimedOut),
        }
    }

    /// Block the calling thread until the task resolves. Must not be called
    /// from inside an async runtime.
    pub fn wait_blocking(self) -> TaskOutcome {
        self.rx.blocking_recv().unwrap_or(TaskOutcome::TimedOut)
    }
}

impl Future for TaskHandle {
    type Output = TaskOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(TaskOutcome::TimedOut))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{Filter, Kind};

    fn metadata_req(id: &str) -> ClientMessage {
        ClientMessage::req(id, vec![Filter::new().kind(Kind::Metadata)])
    }

    #[test]
    fn test_generated_ids_are_prefixed_and_unique() {
        let a = ReqTask::builder(metadata_req).prefix("META-").build();
        let b = ReqTask::builder(metadata_req).prefix("META-").build();
        assert!(a.subscription_id().starts_with("META-"));
        assert_ne!(a.subscription_id(), b.subscription_id());

        let default = ReqTask::builder(metadata_req).build();
        assert!(default.subscription_id().starts_with(DEFAULT_TASK_PREFIX));
    }

    #[test]
    fn test_request_is_built_with_task_id() {
        let task = ReqTask::builder(metadata_req)
            .subscription_id("fixed")
            .alt("wss://hint.relay", metadata_req)
            .build();
        assert_eq!(task.build_request().subscription_id(), Some("fixed"));
        let (relay, alt) = task.build_alt().unwrap();
        assert_eq!(relay, "wss://hint.relay");
        assert_eq!(alt.subscription_id(), Some("fixed"));
    }

    #[tokio::test]
    async fn test_dropped_sender_resolves_as_timed_out() {
        let (handle, tx) = TaskHandle::new("gone".to_string());
        drop(tx);
        assert_eq!(handle.await, TaskOutcome::TimedOut);
    }

    #[test]
    fn test_try_outcome() {
        let (mut handle, tx) = TaskHandle::new("x".to_string());
        assert!(handle.try_outcome().is_none());
        let response = TaskResponse {
            relay_url: "wss://a".to_string(),
            payload: ResponsePayload::EndOfStoredEvents,
        };
        tx.send(TaskOutcome::Completed(response.clone())).unwrap();
        let outcome = handle.try_outcome().unwrap();
        assert_eq!(outcome.response(), Some(&response));
        assert!(outcome.event().is_none());
    }
}
