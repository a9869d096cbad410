pub mod diff;
pub mod follower;

pub use diff::SnapshotDiff;
pub use follower::{FollowerNotifier, NotifierAction, NotifierDeps};
