pub mod app;
pub mod logging;

pub use app::{
    build_collaborators, default_config_path, format_notification, format_stats, format_status, load_config,
    stats_json,
};
pub use logging::init_tracing;
