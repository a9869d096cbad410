pub mod backlog;
pub mod config;
pub mod constants;
pub mod events;
pub mod notifier;
pub mod relay;
pub mod runtime;
pub mod stats;
pub mod store;
pub mod worker;

pub use backlog::{Backlog, BacklogError, ReqTask, TaskHandle, TaskOutcome, TaskResponse};
pub use config::{CoreConfig, FileConfig, NotifierConfig};
pub use events::{CoreEvent, NotificationBus};
pub use relay::{ClientMessage, ConnectionPool, RelayDescriptor, RelayMessage, RelayStatus};
pub use runtime::{CoreHandle, CoreRuntime};
pub use stats::{RelayStats, SharedRelayStats};
pub use worker::{Collaborators, CoreCommand};
