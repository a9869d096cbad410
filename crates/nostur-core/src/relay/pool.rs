use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nostr::Event;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::connection::Connection;
use super::descriptor::{normalize_url, RelayDescriptor};
use super::message::ClientMessage;
use super::transport::Transport;
use super::RelayNotification;

/// Per-relay snapshot for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub url: String,
    pub connected: bool,
    pub read: bool,
    pub write: bool,
    pub ephemeral: bool,
}

/// Owns one [`Connection`] per relay URL and routes outgoing frames by
/// capability: subscriptions go to read relays, events to write relays.
///
/// Capability flags are read at publish time, so toggling them affects the
/// next publish and never frames already handed to a connection.
///
/// Relay-hint connections live only as long as the subscriptions sent through
/// them: closing the last one drops the connection.
pub struct ConnectionPool {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    /// Open subscription ids per ephemeral relay URL
    hint_subscriptions: Mutex<HashMap<String, HashSet<String>>>,
    transport: Arc<dyn Transport>,
    notifications: mpsc::UnboundedSender<RelayNotification>,
    runtime: Handle,
}

impl ConnectionPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> (Self, mpsc::UnboundedReceiver<RelayNotification>) {
        let (notifications, notifications_rx) = mpsc::unbounded_channel();
        let pool = Self {
            connections: RwLock::new(HashMap::new()),
            hint_subscriptions: Mutex::new(HashMap::new()),
            transport,
            notifications,
            runtime,
        };
        (pool, notifications_rx)
    }

    /// Add a relay. Idempotent per URL (case-insensitive): a second call
    /// returns the existing connection untouched.
    pub fn add_connection(&self, descriptor: RelayDescriptor) -> Arc<Connection> {
        self.insert(descriptor, false)
    }

    fn insert(&self, mut descriptor: RelayDescriptor, ephemeral: bool) -> Arc<Connection> {
        descriptor.url = normalize_url(&descriptor.url);
        let mut connections = self.connections.write();
        if let Some(existing) = connections.get(&descriptor.url) {
            return existing.clone();
        }
        tracing::debug!(
            "[POOL] adding {} (read={} write={} ephemeral={})",
            descriptor.url,
            descriptor.read,
            descriptor.write,
            ephemeral
        );
        let connection = Connection::spawn(
            descriptor.clone(),
            ephemeral,
            self.transport.clone(),
            self.notifications.clone(),
            &self.runtime,
        );
        connections.insert(descriptor.url, connection.clone());
        connection
    }

    pub fn remove_connection(&self, url: &str) -> bool {
        match self.connections.write().remove(&normalize_url(url)) {
            Some(connection) => {
                connection.disconnect();
                true
            }
            None => false,
        }
    }

    pub fn connection_by_url(&self, url: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(&normalize_url(url)).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Connect every regular relay. Each handshake runs independently.
    pub fn connect_all(&self) {
        for connection in self.connections.read().values() {
            if !connection.is_ephemeral() {
                connection.connect();
            }
        }
    }

    /// Disconnect everything and forget relay-hint connections
    pub fn disconnect_all(&self) {
        let mut connections = self.connections.write();
        for connection in connections.values() {
            connection.disconnect();
        }
        connections.retain(|_, connection| !connection.is_ephemeral());
        self.hint_subscriptions.lock().clear();
    }

    /// Returns false for unknown relays. Enabling read forces a connection attempt.
    pub fn set_read(&self, url: &str, read: bool) -> bool {
        match self.connection_by_url(url) {
            Some(connection) => {
                connection.set_read(read);
                if read {
                    connection.connect();
                }
                true
            }
            None => false,
        }
    }

    pub fn set_write(&self, url: &str, write: bool) -> bool {
        match self.connection_by_url(url) {
            Some(connection) => {
                connection.set_write(write);
                true
            }
            None => false,
        }
    }

    /// Send a REQ (or CLOSE) to every read relay. Returns how many relays it was routed to.
    pub fn publish_req(&self, message: &ClientMessage) -> usize {
        let json = message.as_json();
        let mut routed = 0;
        for connection in self.connections.read().values() {
            if connection.can_read() {
                connection.send_raw(json.clone());
                routed += 1;
            }
        }
        routed
    }

    /// Send an event to every write relay
    pub fn publish_event(&self, event: &Event) -> usize {
        let json = ClientMessage::event(event.clone()).as_json();
        let mut routed = 0;
        for connection in self.connections.read().values() {
            if connection.can_write() {
                connection.send_raw(json.clone());
                routed += 1;
            }
        }
        routed
    }

    /// CLOSE a subscription on one relay, or on every relay when `relay_url` is `None`
    pub fn close_subscription(&self, subscription_id: &str, relay_url: Option<&str>) {
        let close = ClientMessage::close(subscription_id);
        match relay_url {
            Some(url) => {
                if let Some(connection) = self.connection_by_url(url) {
                    connection.send(&close);
                }
            }
            None => {
                let json = close.as_json();
                for connection in self.connections.read().values() {
                    if connection.can_read() || connection.is_ephemeral() {
                        connection.send_raw(json.clone());
                    }
                }
            }
        }
        self.release_hint_subscription(subscription_id, relay_url);
    }

    /// Forget a closed subscription on relay-hint connections and drop any
    /// connection left with nothing open.
    fn release_hint_subscription(&self, subscription_id: &str, relay_url: Option<&str>) {
        let only = relay_url.map(normalize_url);
        let mut idle = Vec::new();
        self.hint_subscriptions.lock().retain(|url, subscriptions| {
            if only.as_ref().is_some_and(|only| only != url) {
                return true;
            }
            if subscriptions.remove(subscription_id) && subscriptions.is_empty() {
                idle.push(url.clone());
                return false;
            }
            true
        });
        if idle.is_empty() {
            return;
        }
        let mut connections = self.connections.write();
        for url in idle {
            let is_ephemeral = connections
                .get(&url)
                .is_some_and(|connection| connection.is_ephemeral());
            if !is_ephemeral {
                continue;
            }
            if let Some(connection) = connections.remove(&url) {
                tracing::debug!("[POOL] dropping idle relay hint {}", url);
                connection.disconnect();
            }
        }
    }

    /// Send to one relay, adding an ephemeral connection when the relay is not in the pool
    pub fn send_to_relay_hint(&self, url: &str, message: &ClientMessage) -> bool {
        let url = normalize_url(url);
        if !(url.starts_with("wss://") || url.starts_with("ws://")) {
            tracing::debug!("[POOL] ignoring invalid relay hint {}", url);
            return false;
        }
        let connection = self.insert(RelayDescriptor::read_only(&url), true);
        if connection.is_ephemeral() && message.is_req() {
            if let Some(subscription_id) = message.subscription_id() {
                self.hint_subscriptions
                    .lock()
                    .entry(url)
                    .or_default()
                    .insert(subscription_id.to_string());
            }
        }
        connection.send(message);
        connection.connect();
        true
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .read()
            .values()
            .filter(|connection| connection.is_connected())
            .count()
    }

    pub fn status(&self) -> Vec<RelayStatus> {
        let mut status: Vec<RelayStatus> = self
            .connections
            .read()
            .values()
            .map(|connection| {
                let descriptor = connection.descriptor();
                RelayStatus {
                    url: descriptor.url,
                    connected: connection.is_connected(),
                    read: descriptor.read,
                    write: descriptor.write,
                    ephemeral: connection.is_ephemeral(),
                }
            })
            .collect();
        status.sort_by(|a, b| a.url.cmp(&b.url));
        status
    }
}
