use std::sync::Arc;

use nostr::{Event, EventId, Filter, Timestamp};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::backlog::timer::earliest;
use crate::backlog::{Backlog, BacklogError, ReqTask, TaskHandle, TaskOutcome};
use crate::config::CoreConfig;
use crate::constants::kinds;
use crate::events::{CoreEvent, NotificationBus};
use crate::notifier::{FollowerNotifier, NotifierAction, NotifierDeps};
use crate::relay::{
    ClientMessage, ConnectionPool, RelayDescriptor, RelayMessage, RelayNotification, RelayStatus,
    Transport,
};
use crate::stats::SharedRelayStats;
use crate::store::{
    BgContext, EventStore, NotificationStore, SaveOutcome, SettingsStore, TrustFilter,
};

/// Commands accepted by the worker
pub enum CoreCommand {
    AddRelay(RelayDescriptor),
    RemoveRelay(String),
    SetRelayRead {
        url: String,
        read: bool,
    },
    SetRelayWrite {
        url: String,
        write: bool,
    },
    ConnectAll,
    DisconnectAll,
    /// Register a task; the reply carries its handle
    Request {
        task: ReqTask,
        reply: oneshot::Sender<Result<TaskHandle, BacklogError>>,
    },
    /// Re-arm the debounce of a pending task
    TriggerTask(String),
    PublishEvent {
        event: Box<Event>,
        reply: Option<oneshot::Sender<usize>>,
    },
    /// Local store first, then relays (and the relay hint, if any)
    FetchEvent {
        id: String,
        relay_hint: Option<String>,
        reply: oneshot::Sender<Option<Event>>,
    },
    ActiveAccountChanged(Option<String>),
    CheckFollowers,
    RelayStatus {
        reply: oneshot::Sender<Vec<RelayStatus>>,
    },
    Shutdown,
}

impl std::fmt::Debug for CoreCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddRelay(descriptor) => write!(f, "AddRelay({})", descriptor.url),
            Self::RemoveRelay(url) => write!(f, "RemoveRelay({})", url),
            Self::SetRelayRead { url, read } => write!(f, "SetRelayRead({}, {})", url, read),
            Self::SetRelayWrite { url, write } => write!(f, "SetRelayWrite({}, {})", url, write),
            Self::ConnectAll => f.write_str("ConnectAll"),
            Self::DisconnectAll => f.write_str("DisconnectAll"),
            Self::Request { task, .. } => write!(f, "Request({})", task.subscription_id()),
            Self::TriggerTask(id) => write!(f, "TriggerTask({})", id),
            Self::PublishEvent { event, .. } => write!(f, "PublishEvent({})", event.id.to_hex()),
            Self::FetchEvent { id, .. } => write!(f, "FetchEvent({})", id),
            Self::ActiveAccountChanged(pubkey) => write!(f, "ActiveAccountChanged({:?})", pubkey),
            Self::CheckFollowers => f.write_str("CheckFollowers"),
            Self::RelayStatus { .. } => f.write_str("RelayStatus"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// External collaborators the worker reads from and writes to
#[derive(Clone)]
pub struct Collaborators {
    pub events: Arc<dyn EventStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub trust: Arc<dyn TrustFilter>,
}

enum Internal {
    FetchDone {
        /// Canonical hex id
        id: String,
        outcome: TaskOutcome,
        reply: oneshot::Sender<Option<Event>>,
    },
}

fn outcome_label(outcome: &SaveOutcome) -> &'static str {
    match outcome {
        SaveOutcome::Inserted(_) => "inserted",
        SaveOutcome::Duplicate(_) => "duplicate",
        SaveOutcome::Superseded(_) => "superseded",
    }
}

fn unix_now() -> u64 {
    Timestamp::now().as_u64()
}

fn notifier_deps<'a>(ctx: &'a BgContext, collaborators: &'a Collaborators) -> NotifierDeps<'a> {
    NotifierDeps {
        ctx,
        events: collaborators.events.as_ref(),
        notifications: collaborators.notifications.as_ref(),
        settings: collaborators.settings.as_ref(),
        trust: collaborators.trust.as_ref(),
        unix_now: unix_now(),
    }
}

/// Everything the worker thread needs to start
pub(crate) struct WorkerSetup {
    pub config: CoreConfig,
    pub collaborators: Collaborators,
    pub transport: Arc<dyn Transport>,
    pub commands: mpsc::UnboundedReceiver<CoreCommand>,
    pub bus: NotificationBus,
    pub stats: SharedRelayStats,
}

/// The background context.
///
/// Owns the pool, the backlog, the notifier and every store call. Relay
/// frames, commands and timers are all handled from one `select!` loop.
pub(crate) struct RelayWorker {
    ctx: BgContext,
    pool: ConnectionPool,
    backlog: Backlog,
    notifier: FollowerNotifier,
    collaborators: Collaborators,
    bus: NotificationBus,
    stats: SharedRelayStats,
    commands: mpsc::UnboundedReceiver<CoreCommand>,
    relay_rx: mpsc::UnboundedReceiver<RelayNotification>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl RelayWorker {
    /// Thread entry point: builds the runtime and runs until shutdown
    pub(crate) fn run_thread(setup: WorkerSetup) {
        let rt = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("nostur-relay")
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("[WORKER] failed to create runtime: {}", e);
                return;
            }
        };
        let worker = RelayWorker::new(setup, rt.handle().clone());
        rt.block_on(worker.run());
        tracing::info!("[WORKER] stopped");
    }

    fn new(setup: WorkerSetup, runtime: tokio::runtime::Handle) -> Self {
        let (pool, relay_rx) = ConnectionPool::new(setup.transport, runtime);
        for relay in &setup.config.relays {
            pool.add_connection(relay.clone());
        }
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            ctx: BgContext::new(),
            pool,
            backlog: Backlog::new(setup.config.task_timeout),
            notifier: FollowerNotifier::new(setup.config.notifier.clone(), Instant::now()),
            collaborators: setup.collaborators,
            bus: setup.bus,
            stats: setup.stats,
            commands: setup.commands,
            relay_rx,
            internal_tx,
            internal_rx,
        }
    }

    async fn run(mut self) {
        tracing::info!("[WORKER] started with {} relays", self.pool.len());
        loop {
            let deadline = self.next_deadline();
            let sleep_at = deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(CoreCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(notification) = self.relay_rx.recv() => self.handle_notification(notification),
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                _ = tokio::time::sleep_until(sleep_at), if deadline.is_some() => {}
            }

            self.poll_timers(Instant::now());
        }

        self.backlog.clear(&self.pool);
        self.stats.set_backlog(self.backlog.stats());
        self.pool.disconnect_all();
    }

    fn next_deadline(&self) -> Option<Instant> {
        earliest([self.backlog.next_deadline(), self.notifier.next_deadline()])
    }

    fn poll_timers(&mut self, now: Instant) {
        self.backlog.poll_timers(now, &self.pool);
        let deps = notifier_deps(&self.ctx, &self.collaborators);
        let actions = self.notifier.poll(&deps, now);
        self.apply(actions, now);
        self.stats.set_backlog(self.backlog.stats());
    }

    fn apply(&mut self, actions: Vec<NotifierAction>, now: Instant) {
        for action in actions {
            match action {
                NotifierAction::Request(task) => {
                    // Outcome is not awaited; the backlog closes the subscription either way
                    if let Err(e) = self.backlog.add(task, now) {
                        tracing::warn!("[WORKER] notifier request rejected: {}", e);
                    }
                }
                NotifierAction::Notify(notification) => {
                    self.bus.publish(CoreEvent::NotificationCreated(notification));
                }
            }
        }
        self.backlog.poll_timers(now, &self.pool);
    }

    fn handle_command(&mut self, command: CoreCommand) {
        tracing::debug!("[WORKER] command {:?}", command);
        let now = Instant::now();
        match command {
            CoreCommand::AddRelay(descriptor) => {
                let connection = self.pool.add_connection(descriptor);
                if connection.can_read() || connection.can_write() {
                    connection.connect();
                }
            }
            CoreCommand::RemoveRelay(url) => {
                self.pool.remove_connection(&url);
            }
            CoreCommand::SetRelayRead { url, read } => {
                if !self.pool.set_read(&url, read) {
                    tracing::warn!("[WORKER] unknown relay {}", url);
                }
            }
            CoreCommand::SetRelayWrite { url, write } => {
                if !self.pool.set_write(&url, write) {
                    tracing::warn!("[WORKER] unknown relay {}", url);
                }
            }
            CoreCommand::ConnectAll => self.pool.connect_all(),
            CoreCommand::DisconnectAll => self.pool.disconnect_all(),
            CoreCommand::Request { task, reply } => {
                let _ = reply.send(self.backlog.add(task, now));
            }
            CoreCommand::TriggerTask(id) => {
                self.backlog.trigger(&id, now);
            }
            CoreCommand::PublishEvent { event, reply } => {
                let routed = self.pool.publish_event(&event);
                tracing::info!("[WORKER] published {} to {} relays", event.id.to_hex(), routed);
                self.ingest(None, &event, now);
                if let Some(reply) = reply {
                    let _ = reply.send(routed);
                }
            }
            CoreCommand::FetchEvent {
                id,
                relay_hint,
                reply,
            } => self.fetch_event(id, relay_hint, reply, now),
            CoreCommand::ActiveAccountChanged(pubkey) => {
                let deps = notifier_deps(&self.ctx, &self.collaborators);
                self.notifier.set_active_account(&deps, pubkey, now);
            }
            CoreCommand::CheckFollowers => {
                let Some(account) = self.notifier.active_account().map(str::to_string) else {
                    tracing::debug!("[WORKER] no active account, skipping follower check");
                    return;
                };
                let deps = notifier_deps(&self.ctx, &self.collaborators);
                if let Some(task) = self.notifier.check_for_updated_contact_list(&deps, &account) {
                    self.apply(vec![NotifierAction::Request(task)], now);
                }
            }
            CoreCommand::RelayStatus { reply } => {
                let _ = reply.send(self.pool.status());
            }
            CoreCommand::Shutdown => {}
        }
    }

    fn handle_notification(&mut self, notification: RelayNotification) {
        let now = Instant::now();
        match notification {
            RelayNotification::Connected { relay_url } => {
                self.bus.publish(CoreEvent::RelayConnected { relay_url });
            }
            RelayNotification::Disconnected { relay_url } => {
                self.bus.publish(CoreEvent::RelayDisconnected { relay_url });
            }
            RelayNotification::Message { relay_url, message } => {
                match &message {
                    RelayMessage::Event { event, .. } => {
                        self.stats.record_event(&relay_url, event.kind.as_u16());
                        self.ingest(Some(&relay_url), event, now);
                    }
                    RelayMessage::Ok {
                        event_id,
                        accepted,
                        message,
                    } => {
                        tracing::debug!(
                            "[WORKER] OK {} from {}: accepted={} {}",
                            event_id,
                            relay_url,
                            accepted,
                            message
                        );
                    }
                    _ => {}
                }
                self.backlog.handle_message(&relay_url, &message, now, &self.pool);
            }
        }
    }

    /// Store an event and fan it out. Only newly stored events go further:
    /// duplicates and superseded replaceable versions stop here.
    fn ingest(&mut self, relay_url: Option<&str>, event: &Event, now: Instant) {
        let raw = match serde_json::to_string(event) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("[WORKER] failed to encode event: {}", e);
                return;
            }
        };
        let stored = match self.collaborators.events.save_event(&self.ctx, &raw) {
            Ok(SaveOutcome::Inserted(stored)) => stored,
            Ok(outcome) => {
                tracing::trace!(
                    "[WORKER] not ingesting {}: {}",
                    event.id.to_hex(),
                    outcome_label(&outcome)
                );
                return;
            }
            Err(e) => {
                tracing::warn!("[WORKER] failed to store event {}: {}", event.id.to_hex(), e);
                return;
            }
        };
        if stored.kind.as_u16() == kinds::CONTACT_LIST {
            self.notifier.on_contact_list(&stored, now);
        }
        if let Some(relay_url) = relay_url {
            self.bus.publish(CoreEvent::NewEvent {
                relay_url: relay_url.to_string(),
                event: Box::new(stored),
            });
        }
    }

    /// Accepts anything `EventId::parse` does (hex in any case, `note1...`,
    /// `nostr:` URIs). Lookups and matching use the canonical hex id.
    fn fetch_event(
        &mut self,
        id: String,
        relay_hint: Option<String>,
        reply: oneshot::Sender<Option<Event>>,
        now: Instant,
    ) {
        let event_id = match EventId::parse(&id) {
            Ok(event_id) => event_id,
            Err(e) => {
                tracing::warn!("[WORKER] invalid event id {}: {}", id, e);
                let _ = reply.send(None);
                return;
            }
        };
        let id = event_id.to_hex();

        match self.collaborators.events.fetch_event(&self.ctx, &id) {
            Ok(Some(event)) => {
                let _ = reply.send(Some(event));
                return;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("[WORKER] store lookup for {} failed: {}", id, e),
        }

        let request = move |sub: &str| ClientMessage::req(sub, vec![Filter::new().id(event_id).limit(1)]);
        let mut builder = ReqTask::builder(request).prefix("EVENT-");
        if let Some(hint) = relay_hint {
            builder = builder.alt(hint, request);
        }

        match self.backlog.add(builder.build(), now) {
            Ok(handle) => {
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let outcome = handle.await;
                    let _ = internal.send(Internal::FetchDone { id, outcome, reply });
                });
            }
            Err(e) => {
                tracing::warn!("[WORKER] fetch for {} rejected: {}", id, e);
                let _ = reply.send(None);
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::FetchDone { id, outcome, reply } => {
                let found = match outcome.event() {
                    Some(event) if event.id.to_hex() == id => Some(event.clone()),
                    _ => self
                        .collaborators
                        .events
                        .fetch_event(&self.ctx, &id)
                        .unwrap_or_else(|e| {
                            tracing::warn!("[WORKER] store lookup for {} failed: {}", id, e);
                            None
                        }),
                };
                if found.is_none() {
                    tracing::debug!("[WORKER] event {} not found ({:?})", id, outcome);
                }
                let _ = reply.send(found);
            }
        }
    }
}
