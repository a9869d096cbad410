use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    NewFollowers,
    NewPosts,
    Mentions,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewFollowers => "NEW_FOLLOWERS",
            Self::NewPosts => "NEW_POSTS",
            Self::Mentions => "MENTIONS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW_FOLLOWERS" => Some(Self::NewFollowers),
            "NEW_POSTS" => Some(Self::NewPosts),
            "MENTIONS" => Some(Self::Mentions),
            _ => None,
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored in-app notification for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentNotification {
    pub id: String,
    /// The account the notification belongs to
    pub pubkey: String,
    pub kind: NotificationKind,
    /// Pubkeys the notification is about (new followers, authors)
    pub pubkeys: Vec<String>,
    /// Unix seconds
    pub created_at: u64,
}

impl PersistentNotification {
    pub fn new(pubkey: impl Into<String>, kind: NotificationKind, pubkeys: Vec<String>, created_at: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pubkey: pubkey.into(),
            kind,
            pubkeys,
            created_at,
        }
    }

    pub fn new_followers(pubkey: impl Into<String>, followers: Vec<String>, created_at: u64) -> Self {
        Self::new(pubkey, NotificationKind::NewFollowers, followers, created_at)
    }
}
