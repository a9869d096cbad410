use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::message::{ClientMessage, MessageError, RelayMessage};
use super::transport::{Session, Transport};
use super::{RelayDescriptor, RelayNotification};
use crate::constants::{OUTBOX_CAPACITY, RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY};

enum ConnectionCommand {
    Connect,
    Disconnect,
    Send(String),
}

/// One persistent session to one relay.
///
/// The socket lives in a task on the worker's runtime. The handle only
/// forwards commands, so every method is non-blocking. Frames sent while the
/// socket is down wait in a bounded outbox and are flushed on connect.
pub struct Connection {
    url: String,
    descriptor: RwLock<RelayDescriptor>,
    ephemeral: bool,
    connected: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

impl Connection {
    pub(crate) fn spawn(
        descriptor: RelayDescriptor,
        ephemeral: bool,
        transport: Arc<dyn Transport>,
        notifications: mpsc::UnboundedSender<RelayNotification>,
        runtime: &Handle,
    ) -> Arc<Self> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let task = ConnectionTask {
            url: descriptor.url.clone(),
            transport,
            notifications,
            connected: connected.clone(),
            commands: commands_rx,
            outbox: VecDeque::new(),
            session: None,
            want_connected: false,
            retry_at: None,
            backoff: RECONNECT_BASE_DELAY,
        };
        runtime.spawn(task.run());

        Arc::new(Self {
            url: descriptor.url.clone(),
            descriptor: RwLock::new(descriptor),
            ephemeral,
            connected,
            commands: commands_tx,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn descriptor(&self) -> RelayDescriptor {
        self.descriptor.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Added for a relay hint; receives no regular traffic
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn can_read(&self) -> bool {
        !self.ephemeral && self.descriptor.read().read
    }

    pub fn can_write(&self) -> bool {
        !self.ephemeral && self.descriptor.read().write
    }

    pub(crate) fn set_read(&self, read: bool) {
        self.descriptor.write().read = read;
    }

    pub(crate) fn set_write(&self, write: bool) {
        self.descriptor.write().write = write;
    }

    /// Start (or force) a connection attempt
    pub fn connect(&self) {
        let _ = self.commands.send(ConnectionCommand::Connect);
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(ConnectionCommand::Disconnect);
    }

    pub fn send(&self, message: &ClientMessage) {
        self.send_raw(message.as_json());
    }

    pub fn send_raw(&self, text: String) {
        if self.commands.send(ConnectionCommand::Send(text)).is_err() {
            tracing::debug!("[CONN] {} task gone, frame dropped", self.url);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("descriptor", &*self.descriptor.read())
            .field("ephemeral", &self.ephemeral)
            .field("connected", &self.is_connected())
            .finish()
    }
}

struct ConnectionTask {
    url: String,
    transport: Arc<dyn Transport>,
    notifications: mpsc::UnboundedSender<RelayNotification>,
    connected: Arc<AtomicBool>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    outbox: VecDeque<String>,
    session: Option<Session>,
    want_connected: bool,
    retry_at: Option<Instant>,
    backoff: Duration,
}

async fn next_frame(session: &mut Option<Session>) -> Option<String> {
    match session {
        Some(session) => session.incoming.recv().await,
        None => std::future::pending().await,
    }
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            if self.should_attempt() {
                self.attempt_connect().await;
            }

            let retry_at = self.retry_at.unwrap_or_else(Instant::now);
            let waiting_to_retry =
                self.want_connected && self.session.is_none() && self.retry_at.is_some();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Connect) => {
                        self.want_connected = true;
                        self.retry_at = None;
                    }
                    Some(ConnectionCommand::Disconnect) => {
                        self.want_connected = false;
                        self.retry_at = None;
                        self.backoff = RECONNECT_BASE_DELAY;
                        self.close_session();
                    }
                    Some(ConnectionCommand::Send(text)) => self.send(text),
                    None => break,
                },
                frame = next_frame(&mut self.session) => match frame {
                    Some(text) => self.dispatch(&text),
                    None => {
                        tracing::info!("[CONN] {} closed by remote", self.url);
                        self.close_session();
                        if self.want_connected {
                            self.schedule_retry();
                        }
                    }
                },
                _ = tokio::time::sleep_until(retry_at), if waiting_to_retry => {}
            }
        }
        self.close_session();
        tracing::debug!("[CONN] {} task stopped", self.url);
    }

    fn should_attempt(&self) -> bool {
        self.want_connected
            && self.session.is_none()
            && self.retry_at.map_or(true, |at| at <= Instant::now())
    }

    async fn attempt_connect(&mut self) {
        match self.transport.open(&self.url).await {
            Ok(session) => {
                tracing::info!("[CONN] connected to {}", self.url);
                self.session = Some(session);
                self.retry_at = None;
                self.backoff = RECONNECT_BASE_DELAY;
                self.connected.store(true, Ordering::Release);
                let _ = self.notifications.send(RelayNotification::Connected {
                    relay_url: self.url.clone(),
                });
                while let Some(text) = self.outbox.pop_front() {
                    self.send(text);
                }
            }
            Err(e) => {
                tracing::warn!("[CONN] {} connect failed: {}", self.url, e);
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&mut self) {
        self.retry_at = Some(Instant::now() + self.backoff);
        tracing::debug!("[CONN] {} retry in {:?}", self.url, self.backoff);
        self.backoff = (self.backoff * 2).min(RECONNECT_MAX_DELAY);
    }

    fn send(&mut self, text: String) {
        if let Some(session) = &self.session {
            match session.outgoing.send(text) {
                Ok(()) => return,
                Err(mpsc::error::SendError(text)) => {
                    self.close_session();
                    if self.want_connected {
                        self.schedule_retry();
                    }
                    self.enqueue(text);
                    return;
                }
            }
        }
        self.enqueue(text);
    }

    fn enqueue(&mut self, text: String) {
        if self.outbox.len() >= OUTBOX_CAPACITY {
            self.outbox.pop_front();
            tracing::warn!("[CONN] {} outbox full, dropped oldest frame", self.url);
        }
        self.outbox.push_back(text);
    }

    fn dispatch(&self, text: &str) {
        match RelayMessage::from_json(text) {
            Ok(message) => {
                if let RelayMessage::Notice(notice) = &message {
                    tracing::info!("[CONN] NOTICE from {}: {}", self.url, notice);
                }
                let _ = self.notifications.send(RelayNotification::Message {
                    relay_url: self.url.clone(),
                    message,
                });
            }
            Err(e @ MessageError::Unverified { .. }) => {
                tracing::warn!("[CONN] {} dropped: {}", self.url, e);
            }
            Err(e) => {
                tracing::debug!("[CONN] {} sent an unreadable frame: {}", self.url, e);
            }
        }
    }

    fn close_session(&mut self) {
        if self.session.take().is_some() {
            self.connected.store(false, Ordering::Release);
            let _ = self.notifications.send(RelayNotification::Disconnected {
                relay_url: self.url.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::transport::MemoryTransport;

    async fn next_notification(
        rx: &mut mpsc::UnboundedReceiver<RelayNotification>,
    ) -> RelayNotification {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("notification timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_frames_sent_before_connect_are_flushed() {
        let (transport, mut accepted) = MemoryTransport::new();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let connection = Connection::spawn(
            RelayDescriptor::new("wss://relay.one"),
            false,
            Arc::new(transport),
            notify_tx,
            &Handle::current(),
        );

        connection.send(&ClientMessage::close("early"));
        connection.connect();

        let mut relay = accepted.recv().await.unwrap();
        assert_eq!(relay.url, "wss://relay.one");
        assert_eq!(
            next_notification(&mut notify_rx).await,
            RelayNotification::Connected {
                relay_url: "wss://relay.one".to_string()
            }
        );
        assert_eq!(relay.recv().await, Some(ClientMessage::close("early")));
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_incoming_frames_are_decoded_and_garbage_swallowed() {
        let (transport, mut accepted) = MemoryTransport::new();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let connection = Connection::spawn(
            RelayDescriptor::new("wss://relay.two"),
            false,
            Arc::new(transport),
            notify_tx,
            &Handle::current(),
        );
        connection.connect();
        let relay = accepted.recv().await.unwrap();
        next_notification(&mut notify_rx).await;

        relay.send_raw("{{{ not a frame");
        relay.send(&RelayMessage::eose("sub-1"));

        assert_eq!(
            next_notification(&mut notify_rx).await,
            RelayNotification::Message {
                relay_url: "wss://relay.two".to_string(),
                message: RelayMessage::eose("sub-1"),
            }
        );
    }

    #[tokio::test]
    async fn test_forged_events_are_dropped() {
        let (transport, mut accepted) = MemoryTransport::new();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let connection = Connection::spawn(
            RelayDescriptor::new("wss://relay.forged"),
            false,
            Arc::new(transport),
            notify_tx,
            &Handle::current(),
        );
        connection.connect();
        let relay = accepted.recv().await.unwrap();
        next_notification(&mut notify_rx).await;

        let author = nostr::Keys::generate();
        let event = nostr::EventBuilder::new(nostr::Kind::ContactList, "")
            .sign_with_keys(&author)
            .unwrap();
        let mut forged = serde_json::to_value(&event).unwrap();
        forged["pubkey"] = serde_json::json!(nostr::Keys::generate().public_key().to_hex());
        relay.send_raw(&serde_json::json!(["EVENT", "sub-1", forged]).to_string());
        relay.send(&RelayMessage::event("sub-1", event.clone()));

        assert_eq!(
            next_notification(&mut notify_rx).await,
            RelayNotification::Message {
                relay_url: "wss://relay.forged".to_string(),
                message: RelayMessage::event("sub-1", event),
            }
        );
    }

    #[tokio::test]
    async fn test_remote_close_reports_disconnect_and_reconnects() {
        let (transport, mut accepted) = MemoryTransport::new();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let connection = Connection::spawn(
            RelayDescriptor::new("wss://relay.three"),
            false,
            Arc::new(transport),
            notify_tx,
            &Handle::current(),
        );
        connection.connect();
        let relay = accepted.recv().await.unwrap();
        next_notification(&mut notify_rx).await;

        drop(relay);
        assert_eq!(
            next_notification(&mut notify_rx).await,
            RelayNotification::Disconnected {
                relay_url: "wss://relay.three".to_string()
            }
        );
        assert!(!connection.is_connected());

        // Backoff starts at one second
        let relay = tokio::time::timeout(Duration::from_secs(3), accepted.recv())
            .await
            .unwrap();
        assert!(relay.is_some());
    }

    #[tokio::test]
    async fn test_disconnect_stops_reconnecting() {
        let (transport, mut accepted) = MemoryTransport::new();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let connection = Connection::spawn(
            RelayDescriptor::new("wss://relay.four"),
            false,
            Arc::new(transport),
            notify_tx,
            &Handle::current(),
        );
        connection.connect();
        let _relay = accepted.recv().await.unwrap();
        next_notification(&mut notify_rx).await;

        connection.disconnect();
        assert_eq!(
            next_notification(&mut notify_rx).await,
            RelayNotification::Disconnected {
                relay_url: "wss://relay.four".to_string()
            }
        );
        let again = tokio::time::timeout(Duration::from_millis(1500), accepted.recv()).await;
        assert!(again.is_err(), "no reconnect after explicit disconnect");
    }
}
