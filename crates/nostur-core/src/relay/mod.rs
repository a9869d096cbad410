pub mod connection;
pub mod descriptor;
pub mod message;
pub mod pool;
pub mod transport;

pub use connection::Connection;
pub use descriptor::{normalize_url, RelayDescriptor};
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use pool::{ConnectionPool, RelayStatus};
pub use transport::{MemoryRelay, MemoryTransport, Session, Transport, WebSocketTransport};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Transport error for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("Connection to {0} timed out")]
    Timeout(String),
    #[error("Connection refused by {0}")]
    Refused(String),
}

/// Everything a connection reports back to the background context
#[derive(Debug, Clone, PartialEq)]
pub enum RelayNotification {
    Connected { relay_url: String },
    Disconnected { relay_url: String },
    Message {
        relay_url: String,
        message: RelayMessage,
    },
}
