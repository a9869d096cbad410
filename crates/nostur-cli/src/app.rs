use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use nostur_core::store::{AllowAll, PersistentNotification, Settings, TrustFilter, TrustList};
use nostur_core::{Collaborators, CoreConfig, FileConfig, RelayStats, RelayStatus};
use serde_json::{json, Value};

/// `<config dir>/nostur/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("nostur").join("config.json"))
}

/// Load the given file, or the default one when it exists. No file means defaults.
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => FileConfig::load(path),
        None => match default_config_path() {
            Some(path) if path.exists() => FileConfig::load(&path),
            _ => Ok(FileConfig::default()),
        },
    }
}

/// SQLite-backed stores with settings and trust list taken from the config file
pub fn build_collaborators(file: &FileConfig, config: &CoreConfig) -> Result<Collaborators> {
    std::fs::create_dir_all(&config.data_dir)?;
    let settings = Arc::new(Settings::new(file.low_data_mode, file.wot_filter_enabled));
    let trust: Arc<dyn TrustFilter> = if file.wot_filter_enabled {
        Arc::new(TrustList::new(file.trusted_pubkeys.iter().cloned()))
    } else {
        Arc::new(AllowAll)
    };
    Collaborators::sqlite(config, settings, trust)
}

pub fn format_notification(notification: &PersistentNotification) -> String {
    let when = Utc
        .timestamp_opt(notification.created_at as i64, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| notification.created_at.to_string());
    format!(
        "[{}] {} for {}: {}",
        when,
        notification.kind,
        notification.pubkey,
        notification.pubkeys.join(", ")
    )
}

pub fn format_status(status: &[RelayStatus]) -> String {
    status
        .iter()
        .map(|relay| {
            let mut flags = Vec::new();
            if relay.read {
                flags.push("read");
            }
            if relay.write {
                flags.push("write");
            }
            if relay.ephemeral {
                flags.push("hint");
            }
            format!(
                "{} {} [{}]",
                if relay.connected { "+" } else { "-" },
                relay.url,
                flags.join(",")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Received events by kind and by relay, then how backlog tasks ended
pub fn format_stats(stats: &RelayStats) -> String {
    let mut lines = vec![format!("{} events received", stats.total)];
    for (kind, count) in stats.kinds_by_count() {
        lines.push(format!("  kind {}: {}", kind, count));
    }
    for (relay, total) in relay_totals(stats) {
        lines.push(format!("  {}: {}", relay, total));
    }
    let backlog = &stats.backlog;
    lines.push(format!(
        "tasks: {} completed, {} via hint, {} timed out, {} cancelled",
        backlog.completed, backlog.alt_retried, backlog.timed_out, backlog.cancelled
    ));
    lines.join("\n")
}

pub fn stats_json(stats: &RelayStats) -> Value {
    let kinds: Vec<Value> = stats
        .kinds_by_count()
        .into_iter()
        .map(|(kind, count)| json!({"kind": kind, "count": count}))
        .collect();
    let relays: Vec<Value> = relay_totals(stats)
        .into_iter()
        .map(|(url, count)| json!({"url": url, "count": count}))
        .collect();
    json!({
        "total": stats.total,
        "kinds": kinds,
        "relays": relays,
        "tasks": {
            "completed": stats.backlog.completed,
            "altRetried": stats.backlog.alt_retried,
            "timedOut": stats.backlog.timed_out,
            "cancelled": stats.backlog.cancelled,
        },
    })
}

fn relay_totals(stats: &RelayStats) -> Vec<(String, u64)> {
    let mut totals: Vec<(String, u64)> = stats
        .by_relay()
        .into_iter()
        .map(|(relay, kinds)| (relay, kinds.values().sum()))
        .collect();
    totals.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    totals
}
