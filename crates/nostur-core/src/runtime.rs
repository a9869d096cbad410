use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use nostr::Event;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::backlog::{ReqTask, TaskHandle};
use crate::config::CoreConfig;
use crate::events::{CoreEvent, NotificationBus};
use crate::relay::{RelayDescriptor, RelayStatus, Transport, WebSocketTransport};
use crate::stats::SharedRelayStats;
use crate::store::{AllowAll, MemoryStore, Settings, SqliteStore, TrustFilter};
use crate::worker::{Collaborators, CoreCommand, RelayWorker, WorkerSetup};

impl Collaborators {
    /// Memory-backed stores with the given settings and trust filter
    pub fn in_memory(settings: Arc<Settings>, trust: Arc<dyn TrustFilter>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            events: store.clone(),
            notifications: store,
            settings,
            trust,
        }
    }

    /// SQLite stores under `config.data_dir`
    pub fn sqlite(config: &CoreConfig, settings: Arc<Settings>, trust: Arc<dyn TrustFilter>) -> Result<Self> {
        let store = Arc::new(
            SqliteStore::open(&config.data_dir)
                .with_context(|| format!("Failed to open store in {}", config.data_dir.display()))?,
        );
        Ok(Self {
            events: store.clone(),
            notifications: store,
            settings,
            trust,
        })
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::in_memory(Arc::new(Settings::default()), Arc::new(AllowAll))
    }
}

/// Cloneable handle for talking to the worker from any thread
#[derive(Clone)]
pub struct CoreHandle {
    command_tx: mpsc::UnboundedSender<CoreCommand>,
    bus: NotificationBus,
}

impl CoreHandle {
    pub fn send(&self, command: CoreCommand) -> Result<(), mpsc::error::SendError<CoreCommand>> {
        self.command_tx.send(command)
    }

    fn command(&self, command: CoreCommand) -> Result<()> {
        self.send(command).map_err(|_| anyhow!("Worker is not running"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.bus.subscribe()
    }

    pub fn add_relay(&self, descriptor: RelayDescriptor) -> Result<()> {
        self.command(CoreCommand::AddRelay(descriptor))
    }

    pub fn remove_relay(&self, url: &str) -> Result<()> {
        self.command(CoreCommand::RemoveRelay(url.to_string()))
    }

    pub fn set_relay_read(&self, url: &str, read: bool) -> Result<()> {
        self.command(CoreCommand::SetRelayRead {
            url: url.to_string(),
            read,
        })
    }

    pub fn set_relay_write(&self, url: &str, write: bool) -> Result<()> {
        self.command(CoreCommand::SetRelayWrite {
            url: url.to_string(),
            write,
        })
    }

    pub fn connect_all(&self) -> Result<()> {
        self.command(CoreCommand::ConnectAll)
    }

    pub fn disconnect_all(&self) -> Result<()> {
        self.command(CoreCommand::DisconnectAll)
    }

    /// Register a request task. The returned handle resolves with its outcome.
    pub async fn request(&self, task: ReqTask) -> Result<TaskHandle> {
        let (reply, rx) = oneshot::channel();
        self.command(CoreCommand::Request { task, reply })?;
        let handle = rx.await.context("Worker dropped the request")??;
        Ok(handle)
    }

    pub fn trigger(&self, subscription_id: &str) -> Result<()> {
        self.command(CoreCommand::TriggerTask(subscription_id.to_string()))
    }

    /// Returns how many write relays the event was routed to
    pub async fn publish_event(&self, event: Event) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.command(CoreCommand::PublishEvent {
            event: Box::new(event),
            reply: Some(reply),
        })?;
        rx.await.context("Worker dropped the publish")
    }

    pub async fn fetch_event(&self, id: &str, relay_hint: Option<String>) -> Result<Option<Event>> {
        let (reply, rx) = oneshot::channel();
        self.command(CoreCommand::FetchEvent {
            id: id.to_string(),
            relay_hint,
            reply,
        })?;
        rx.await.context("Worker dropped the fetch")
    }

    pub fn set_active_account(&self, pubkey: Option<String>) -> Result<()> {
        self.command(CoreCommand::ActiveAccountChanged(pubkey))
    }

    pub fn check_followers(&self) -> Result<()> {
        self.command(CoreCommand::CheckFollowers)
    }

    pub async fn relay_status(&self) -> Result<Vec<RelayStatus>> {
        let (reply, rx) = oneshot::channel();
        self.command(CoreCommand::RelayStatus { reply })?;
        rx.await.context("Worker dropped the status request")
    }
}

/// Owns the worker thread
pub struct CoreRuntime {
    handle: CoreHandle,
    stats: SharedRelayStats,
    worker_handle: Option<JoinHandle<()>>,
}

impl CoreRuntime {
    /// Start the worker with the WebSocket transport
    pub fn new(config: CoreConfig, collaborators: Collaborators) -> Result<Self> {
        Self::with_transport(config, collaborators, Arc::new(WebSocketTransport::new()))
    }

    pub fn with_transport(
        config: CoreConfig,
        collaborators: Collaborators,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel::<CoreCommand>();
        let bus = NotificationBus::new();
        let stats = SharedRelayStats::new();

        let setup = WorkerSetup {
            config,
            collaborators,
            transport,
            commands: command_rx,
            bus: bus.clone(),
            stats: stats.clone(),
        };
        let worker_handle = std::thread::Builder::new()
            .name("nostur-worker".to_string())
            .spawn(move || RelayWorker::run_thread(setup))
            .context("Failed to spawn worker thread")?;

        Ok(Self {
            handle: CoreHandle { command_tx, bus },
            stats,
            worker_handle: Some(worker_handle),
        })
    }

    pub fn handle(&self) -> CoreHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.handle.subscribe()
    }

    pub fn stats(&self) -> SharedRelayStats {
        self.stats.clone()
    }

    pub fn shutdown(&mut self) {
        let _ = self.handle.send(CoreCommand::Shutdown);
        if let Some(worker_handle) = self.worker_handle.take() {
            let _ = worker_handle.join();
        }
    }
}

impl Drop for CoreRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::TaskOutcome;
    use crate::relay::{ClientMessage, MemoryRelay, MemoryTransport, RelayMessage};
    use crate::store::test_util::{contact_list, note};
    use crate::store::{EventStore, NotificationKind, NotificationStore};
    use nostr::{Filter, Keys, Kind};
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> CoreConfig {
        let mut config = CoreConfig::new(dir).with_relays(vec![RelayDescriptor::new("wss://memory.relay")]);
        config.task_timeout = Duration::from_millis(500);
        config.notifier.new_followers_debounce = Duration::from_millis(100);
        config
    }

    async fn recv_relay(accepted: &mut mpsc::UnboundedReceiver<MemoryRelay>) -> MemoryRelay {
        tokio::time::timeout(Duration::from_secs(3), accepted.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn recv_frame(relay: &mut MemoryRelay) -> ClientMessage {
        tokio::time::timeout(Duration::from_secs(3), relay.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn next_bus_event<F>(rx: &mut broadcast::Receiver<CoreEvent>, mut pred: F) -> CoreEvent
    where
        F: FnMut(&CoreEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    fn start() -> (CoreRuntime, mpsc::UnboundedReceiver<MemoryRelay>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (transport, accepted) = MemoryTransport::new();
        let runtime = CoreRuntime::with_transport(
            test_config(dir.path()),
            Collaborators::default(),
            Arc::new(transport),
        )
        .unwrap();
        (runtime, accepted, dir)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_resolves_from_relay_event() {
        let (mut runtime, mut accepted, _dir) = start();
        let handle = runtime.handle();
        handle.connect_all().unwrap();
        let mut relay = recv_relay(&mut accepted).await;

        let task = ReqTask::builder(|id| ClientMessage::req(id, vec![Filter::new().kind(Kind::TextNote)]))
            .prefix("NOTES-")
            .build();
        let pending = handle.request(task).await.unwrap();
        let frame = recv_frame(&mut relay).await;
        assert_eq!(frame.subscription_id(), Some(pending.subscription_id()));

        let event = note(&Keys::generate(), "from relay", 100);
        relay.send(&RelayMessage::event(pending.subscription_id(), event.clone()));
        match pending.await {
            TaskOutcome::Completed(response) => {
                assert_eq!(response.relay_url, "wss://memory.relay");
                assert_eq!(response.event(), Some(&event));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Ingested into the store along the way
        let fetched = handle.fetch_event(&event.id.to_hex(), None).await.unwrap();
        assert_eq!(fetched, Some(event));
        runtime.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_times_out_and_closes() {
        let (mut runtime, mut accepted, _dir) = start();
        let handle = runtime.handle();
        handle.connect_all().unwrap();
        let mut relay = recv_relay(&mut accepted).await;

        let task = ReqTask::builder(|id| ClientMessage::req(id, vec![Filter::new().kind(Kind::Metadata)])).build();
        let pending = handle.request(task).await.unwrap();
        let id = pending.subscription_id().to_string();
        assert!(recv_frame(&mut relay).await.is_req());

        assert_eq!(pending.await, TaskOutcome::TimedOut);
        assert_eq!(recv_frame(&mut relay).await, ClientMessage::close(id));
        let stats = runtime.stats();
        tokio::time::timeout(Duration::from_secs(3), async {
            while stats.snapshot().backlog.timed_out != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        runtime.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fetch_event_uses_relay_hint_after_miss() {
        let (mut runtime, mut accepted, _dir) = start();
        let handle = runtime.handle();
        let missing = note(&Keys::generate(), "only on the hint relay", 100);

        let fetch = {
            let handle = handle.clone();
            let id = missing.id.to_hex();
            tokio::spawn(async move { handle.fetch_event(&id, Some("wss://hint.relay".to_string())).await })
        };

        // The regular relay never connects, so the hint is tried once the task times out
        let mut hint = recv_relay(&mut accepted).await;
        assert_eq!(hint.url, "wss://hint.relay");
        let ClientMessage::Req { subscription_id, .. } = recv_frame(&mut hint).await else {
            panic!("expected a REQ");
        };
        hint.send(&RelayMessage::event(subscription_id, missing.clone()));

        assert_eq!(fetch.await.unwrap().unwrap(), Some(missing));
        runtime.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fetch_event_accepts_uppercase_hex() {
        let (mut runtime, mut accepted, _dir) = start();
        let handle = runtime.handle();
        handle.connect_all().unwrap();
        let mut relay = recv_relay(&mut accepted).await;
        let wanted = note(&Keys::generate(), "asked for in capitals", 100);

        let fetch = {
            let handle = handle.clone();
            let id = wanted.id.to_hex().to_uppercase();
            tokio::spawn(async move { handle.fetch_event(&id, None).await })
        };
        let ClientMessage::Req { subscription_id, .. } = recv_frame(&mut relay).await else {
            panic!("expected a REQ");
        };
        relay.send(&RelayMessage::event(subscription_id, wanted.clone()));

        assert_eq!(fetch.await.unwrap().unwrap(), Some(wanted.clone()));
        // Unparseable ids never reach the relays
        assert_eq!(handle.fetch_event("not-an-id", None).await.unwrap(), None);
        runtime.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_relay_status_and_flags() {
        let (mut runtime, _accepted, _dir) = start();
        let handle = runtime.handle();
        handle
            .add_relay(RelayDescriptor::write_only("wss://Second.Relay"))
            .unwrap();
        handle.set_relay_read("wss://second.relay", true).unwrap();

        let status = handle.relay_status().await.unwrap();
        let urls: Vec<&str> = status.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["wss://memory.relay", "wss://second.relay"]);
        assert!(status[1].read && status[1].write);

        handle.remove_relay("wss://second.relay").unwrap();
        assert_eq!(handle.relay_status().await.unwrap().len(), 1);
        runtime.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_follower_notification_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, mut accepted) = MemoryTransport::new();
        let collaborators = Collaborators::default();
        let me = Keys::generate();
        let known = contact_list(&Keys::generate(), &[&me], 100);
        let ctx = crate::store::BgContext::new();
        collaborators
            .events
            .save_event(&ctx, &serde_json::to_string(&known).unwrap())
            .unwrap();

        let mut runtime = CoreRuntime::with_transport(
            test_config(dir.path()),
            collaborators.clone(),
            Arc::new(transport),
        )
        .unwrap();
        let handle = runtime.handle();
        let mut bus = handle.subscribe();
        handle.set_active_account(Some(me.public_key().to_hex())).unwrap();
        handle.connect_all().unwrap();
        let relay = recv_relay(&mut accepted).await;

        let newcomer = Keys::generate();
        relay.send(&RelayMessage::event("live", contact_list(&newcomer, &[&me], 200)));

        let created = next_bus_event(&mut bus, |e| matches!(e, CoreEvent::NotificationCreated(_))).await;
        let CoreEvent::NotificationCreated(notification) = created else {
            unreachable!()
        };
        assert_eq!(notification.kind, NotificationKind::NewFollowers);
        assert_eq!(notification.pubkeys, vec![newcomer.public_key().to_hex()]);
        runtime.shutdown();

        let stored = collaborators
            .notifications
            .latest_notification(&ctx, &me.public_key().to_hex(), NotificationKind::NewFollowers)
            .unwrap();
        assert_eq!(stored, Some(notification));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replayed_old_contact_list_is_not_a_new_follower() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, mut accepted) = MemoryTransport::new();
        let collaborators = Collaborators::default();
        let me = Keys::generate();
        let unfollowed = Keys::generate();
        let ctx = crate::store::BgContext::new();
        let known = contact_list(&Keys::generate(), &[&me], 100);
        let current = contact_list(&unfollowed, &[], 500);
        for event in [&known, &current] {
            collaborators
                .events
                .save_event(&ctx, &serde_json::to_string(event).unwrap())
                .unwrap();
        }

        let mut runtime = CoreRuntime::with_transport(
            test_config(dir.path()),
            collaborators.clone(),
            Arc::new(transport),
        )
        .unwrap();
        let handle = runtime.handle();
        let mut bus = handle.subscribe();
        handle.set_active_account(Some(me.public_key().to_hex())).unwrap();
        handle.connect_all().unwrap();
        let relay = recv_relay(&mut accepted).await;

        // An older list that still follows me, then one that is already stored
        relay.send(&RelayMessage::event("live", contact_list(&unfollowed, &[&me], 200)));
        relay.send(&RelayMessage::event("live", known.clone()));
        let newcomer = Keys::generate();
        relay.send(&RelayMessage::event("live", contact_list(&newcomer, &[&me], 300)));

        let created = next_bus_event(&mut bus, |e| matches!(e, CoreEvent::NotificationCreated(_))).await;
        let CoreEvent::NotificationCreated(notification) = created else {
            unreachable!()
        };
        assert_eq!(notification.pubkeys, vec![newcomer.public_key().to_hex()]);
        runtime.shutdown();
    }
}
