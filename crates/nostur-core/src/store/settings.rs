use std::sync::atomic::{AtomicBool, Ordering};

/// User settings the core reads synchronously
pub trait SettingsStore: Send + Sync {
    /// Suppresses background requests (follower scans, metadata prefetch)
    fn low_data_mode(&self) -> bool;
    /// Filters notification subjects through the trust filter
    fn wot_filter_enabled(&self) -> bool;
}

/// Settings that can be flipped from any thread while the worker runs
#[derive(Debug, Default)]
pub struct Settings {
    low_data_mode: AtomicBool,
    wot_filter_enabled: AtomicBool,
}

impl Settings {
    pub fn new(low_data_mode: bool, wot_filter_enabled: bool) -> Self {
        Self {
            low_data_mode: AtomicBool::new(low_data_mode),
            wot_filter_enabled: AtomicBool::new(wot_filter_enabled),
        }
    }

    pub fn set_low_data_mode(&self, enabled: bool) {
        self.low_data_mode.store(enabled, Ordering::Relaxed);
    }

    pub fn set_wot_filter_enabled(&self, enabled: bool) {
        self.wot_filter_enabled.store(enabled, Ordering::Relaxed);
    }
}

impl SettingsStore for Settings {
    fn low_data_mode(&self) -> bool {
        self.low_data_mode.load(Ordering::Relaxed)
    }

    fn wot_filter_enabled(&self) -> bool {
        self.wot_filter_enabled.load(Ordering::Relaxed)
    }
}
