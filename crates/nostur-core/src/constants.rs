//! Application-wide constants
//!
//! Centralized location for relay defaults, event kinds and the timing
//! values used by the backlog scheduler and the follower notifier.

use std::time::Duration;

/// Relays used when the config file does not list any
pub const DEFAULT_RELAYS: &[&str] = &["wss://relay.damus.io", "wss://nos.lol", "wss://relay.nostr.band"];

// Backlog defaults
/// Timeout for a request task when the caller does not set one
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(15);
/// Prefix for generated subscription ids
pub const DEFAULT_TASK_PREFIX: &str = "REQ-";

// Connection defaults
/// First reconnect delay; doubles on every failed attempt
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Reconnect delay cap
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
/// Frames buffered per connection while the socket is down
pub const OUTBOX_CAPACITY: usize = 128;
/// Handshake budget per connection attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Follower notifier timings
/// Coalesces bursts of contact lists (imports, backfill) into one notification
pub const NEW_FOLLOWERS_DEBOUNCE: Duration = Duration::from_secs(5);
/// Delay after an account switch before scanning relays for the new account
pub const ACCOUNT_SWITCH_DEBOUNCE: Duration = Duration::from_secs(20);
/// First scan after startup
pub const FOLLOWER_SCAN_STARTUP_DELAY: Duration = Duration::from_secs(15);
/// Periodic fallback scan
pub const FOLLOWER_SCAN_INTERVAL: Duration = Duration::from_secs(4 * 3600);
/// Lookback window when no earlier notification exists (3 days)
pub const FOLLOWER_LOOKBACK_SECS: u64 = 3 * 24 * 3600;
/// Kind-0 prefetch is limited to this many new followers
pub const FOLLOWER_METADATA_PREFETCH: usize = 10;

// Nostr event kinds used by the relay core
pub mod kinds {
    /// Metadata (profiles)
    pub const METADATA: u16 = 0;
    /// Text note
    pub const TEXT_NOTE: u16 = 1;
    /// Contact list (follows)
    pub const CONTACT_LIST: u16 = 3;

    /// Only the newest event per author is kept
    pub fn is_replaceable(kind: u16) -> bool {
        kind == METADATA || kind == CONTACT_LIST || (10_000..20_000).contains(&kind)
    }

    /// Only the newest event per author and `d` tag is kept
    pub fn is_addressable(kind: u16) -> bool {
        (30_000..40_000).contains(&kind)
    }
}
