use serde::Deserialize;

// =======================================================
// CLUSTER CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// UDP address replication batches are sent from and received on.
    pub bind: String,
    pub peers: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0:45564".into(),
            peers: Vec::new(),
        }
    }
}

impl ClusterConfig {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn bind(&self) -> &str {
        &self.bind
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }
}
