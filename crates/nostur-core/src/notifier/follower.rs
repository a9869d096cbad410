use std::collections::HashSet;

use nostr::{Event, Filter, Kind, PublicKey, Timestamp};
use tokio::time::Instant;

use super::diff::SnapshotDiff;
use crate::backlog::timer::{earliest, Debouncer, Periodic};
use crate::backlog::ReqTask;
use crate::config::NotifierConfig;
use crate::constants::kinds;
use crate::relay::ClientMessage;
use crate::store::{
    BgContext, EventQuery, EventStore, NotificationKind, NotificationStore,
    PersistentNotification, SettingsStore, TagMatch, TrustFilter,
};

/// Collaborators the notifier needs on each call
pub struct NotifierDeps<'a> {
    pub ctx: &'a BgContext,
    pub events: &'a dyn EventStore,
    pub notifications: &'a dyn NotificationStore,
    pub settings: &'a dyn SettingsStore,
    pub trust: &'a dyn TrustFilter,
    /// Wall clock, unix seconds
    pub unix_now: u64,
}

/// Work the notifier hands back to the worker
#[derive(Debug)]
pub enum NotifierAction {
    /// Register and send a request
    Request(ReqTask),
    /// A notification was stored and should be announced
    Notify(PersistentNotification),
}

/// Detects new followers of the active account.
///
/// The baseline is the set of authors whose stored contact list tags the
/// account. Incoming contact lists from anyone outside that set are
/// collected and, after a quiet period, turned into one notification.
pub struct FollowerNotifier {
    config: NotifierConfig,
    active_account: Option<String>,
    snapshot: SnapshotDiff<String>,
    recompute: Debouncer,
    /// Account the pending recompute was armed for
    recompute_account: Option<String>,
    account_switch: Debouncer,
    rescan: Periodic,
}

impl FollowerNotifier {
    pub fn new(config: NotifierConfig, now: Instant) -> Self {
        Self {
            recompute: Debouncer::new(config.new_followers_debounce),
            account_switch: Debouncer::new(config.account_switch_debounce),
            rescan: Periodic::new(now + config.startup_delay, config.rescan_interval),
            config,
            active_account: None,
            snapshot: SnapshotDiff::new(),
            recompute_account: None,
        }
    }

    pub fn active_account(&self) -> Option<&str> {
        self.active_account.as_deref()
    }

    pub fn current_followers(&self) -> &HashSet<String> {
        self.snapshot.current()
    }

    pub fn pending_followers(&self) -> &HashSet<String> {
        self.snapshot.pending()
    }

    /// Switch accounts. The new account's baseline is loaded right away;
    /// the relay scan follows after the account-switch debounce.
    pub fn set_active_account(&mut self, deps: &NotifierDeps<'_>, pubkey: Option<String>, now: Instant) {
        if self.active_account == pubkey {
            return;
        }
        self.snapshot.reset();
        self.recompute.cancel();
        self.recompute_account = None;
        self.active_account = pubkey.clone();

        match pubkey {
            Some(pubkey) => {
                self.load_current_followers(deps, &pubkey);
                self.account_switch.arm(now);
            }
            None => self.account_switch.cancel(),
        }
    }

    /// Replace the baseline with the authors of stored contact lists tagging `pubkey`
    pub fn load_current_followers(&mut self, deps: &NotifierDeps<'_>, pubkey: &str) {
        let query = EventQuery::new()
            .kind(kinds::CONTACT_LIST)
            .tag("p", pubkey, TagMatch::Exact);
        let followers: HashSet<String> = match deps.events.fetch_events(deps.ctx, &query) {
            Ok(events) => events.iter().map(|event| event.pubkey.to_hex()).collect(),
            Err(e) => {
                tracing::warn!("[FOLLOWERS] failed to load followers: {}", e);
                HashSet::new()
            }
        };
        tracing::debug!("[FOLLOWERS] {} known followers", followers.len());
        self.snapshot.load(followers);
    }

    /// Offer an incoming contact list. Returns true when its author counts as new.
    pub fn on_contact_list(&mut self, event: &Event, now: Instant) -> bool {
        if event.kind.as_u16() != kinds::CONTACT_LIST {
            return false;
        }
        let Some(account) = self.active_account.clone() else {
            return false;
        };
        let tags_account = event.tags.iter().any(|tag| {
            matches!(tag.as_slice(), [key, value, ..] if key == "p" && *value == account)
        });
        if !tags_account || !self.snapshot.observe(event.pubkey.to_hex()) {
            return false;
        }
        self.recompute.arm(now);
        self.recompute_account = Some(account);
        true
    }

    /// Build the relay scan for `pubkey`, or `None` in low-data mode.
    ///
    /// Reloads the baseline and drops pending followers first; the scan
    /// re-delivers anything newer than the watermark.
    pub fn check_for_updated_contact_list(
        &mut self,
        deps: &NotifierDeps<'_>,
        pubkey: &str,
    ) -> Option<ReqTask> {
        if deps.settings.low_data_mode() {
            tracing::debug!("[FOLLOWERS] low data mode, skipping follower scan");
            return None;
        }
        let target = match PublicKey::parse(pubkey) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!("[FOLLOWERS] invalid account pubkey {}: {}", pubkey, e);
                return None;
            }
        };
        tracing::info!("[FOLLOWERS] checking for new followers");

        self.load_current_followers(deps, pubkey);
        self.snapshot.clear_pending();

        let since = self.scan_since(deps, pubkey);
        Some(
            ReqTask::builder(move |id| {
                let filter = Filter::new()
                    .kind(Kind::ContactList)
                    .pubkey(target)
                    .since(Timestamp::from(since));
                ClientMessage::req(id, vec![filter])
            })
            .prefix("FOLLOWERS-")
            .build(),
        )
    }

    /// Watermark for a scan: the last NewFollowers notification, else the lookback window
    fn scan_since(&self, deps: &NotifierDeps<'_>, pubkey: &str) -> u64 {
        let latest = deps
            .notifications
            .latest_notification(deps.ctx, pubkey, NotificationKind::NewFollowers)
            .unwrap_or_else(|e| {
                tracing::warn!("[FOLLOWERS] failed to read last notification: {}", e);
                None
            });
        match latest {
            Some(notification) => notification.created_at,
            None => deps.unix_now.saturating_sub(self.config.lookback_secs),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.recompute.deadline(),
            self.account_switch.deadline(),
            Some(self.rescan.deadline()),
        ])
    }

    /// Fire due timers
    pub fn poll(&mut self, deps: &NotifierDeps<'_>, now: Instant) -> Vec<NotifierAction> {
        let mut actions = Vec::new();

        if self.recompute.fire(now) {
            let armed_for = self.recompute_account.take();
            match self.active_account.clone() {
                Some(active) if armed_for.as_deref() == Some(active.as_str()) => {
                    actions.extend(self.generate_notification(deps, active));
                }
                _ => tracing::debug!("[FOLLOWERS] account changed, dropping recompute"),
            }
        }

        let switched = self.account_switch.fire(now);
        let rescan = self.rescan.fire(now);
        if switched || rescan {
            if let Some(account) = self.active_account.clone() {
                if let Some(task) = self.check_for_updated_contact_list(deps, &account) {
                    actions.push(NotifierAction::Request(task));
                }
            }
        }
        actions
    }

    fn generate_notification(&mut self, deps: &NotifierDeps<'_>, account: String) -> Vec<NotifierAction> {
        let mut followers: Vec<String> = self.snapshot.take_pending().into_iter().collect();
        if deps.settings.wot_filter_enabled() {
            followers.retain(|pubkey| deps.trust.is_allowed(pubkey));
        }
        if followers.is_empty() {
            return Vec::new();
        }
        followers.sort();

        let notification =
            PersistentNotification::new_followers(account.clone(), followers.clone(), deps.unix_now);
        if let Err(e) = deps.notifications.create_notification(deps.ctx, &notification) {
            tracing::error!("[FOLLOWERS] failed to store notification: {}", e);
            return Vec::new();
        }
        tracing::info!(
            "[FOLLOWERS] new followers ({}) notification for {}",
            followers.len(),
            account
        );
        self.snapshot.absorb(followers.iter().cloned());

        let mut actions = vec![NotifierAction::Notify(notification)];
        if !deps.settings.low_data_mode() {
            let authors: Vec<PublicKey> = followers
                .iter()
                .take(self.config.metadata_prefetch)
                .filter_map(|pubkey| PublicKey::parse(pubkey).ok())
                .collect();
            if !authors.is_empty() {
                let task = ReqTask::builder(move |id| {
                    let filter = Filter::new().kind(Kind::Metadata).authors(authors.clone());
                    ClientMessage::req(id, vec![filter])
                })
                .prefix("META-")
                .build();
                actions.push(NotifierAction::Request(task));
            }
        }
        actions
    }
}
