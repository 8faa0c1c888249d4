use std::time::Duration;

use serde::Deserialize;

// =======================================================
// STORE CONFIG + DEFAULTS
// =======================================================
/// Store-wide eviction. A backstop of 0 seconds disables that limit.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub backstop_write_secs: u64,
    pub backstop_access_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backstop_write_secs: 24 * 60 * 60,
            backstop_access_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl StoreConfig {
    pub fn backstop_write(&self) -> Duration {
        Duration::from_secs(self.backstop_write_secs)
    }

    pub fn backstop_access(&self) -> Duration {
        Duration::from_secs(self.backstop_access_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub(crate) fn apply_defaults_from(&mut self, defaults: &StoreConfig) {
        if self.sweep_interval_secs == 0 {
            self.sweep_interval_secs = defaults.sweep_interval_secs;
        }
    }
}
