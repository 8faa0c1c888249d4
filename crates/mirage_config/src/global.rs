use serde::Deserialize;

// =======================================================
// GLOBAL CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    pub log_level: String,
    /// Upper bound of client connections served at once.
    pub worker_connections: u16,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            worker_connections: 1024,
        }
    }
}

impl GlobalConfig {
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn worker_connections(&self) -> u16 {
        self.worker_connections
    }

    pub(crate) fn apply_defaults_from(&mut self, defaults: &GlobalConfig) {
        if self.log_level.is_empty() {
            self.log_level = defaults.log_level.clone();
        }
        if self.worker_connections == 0 {
            self.worker_connections = defaults.worker_connections;
        }
    }
}
