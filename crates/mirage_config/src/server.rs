use std::time::Duration;

use serde::Deserialize;

// =======================================================
// SERVER CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Origin every cache miss is forwarded to (`host:port`).
    pub upstream: String,

    // Mediators wired into the two legs of each exchange
    pub request_mediator: String,
    pub response_mediator: String,

    // Timeouts (seconds)
    pub client_read_timeout_secs: u64,
    pub keepalive_timeout_secs: u64,
    pub upstream_connect_timeout_secs: u64,
    pub upstream_read_timeout_secs: u64,

    // Limits (bytes)
    pub max_request_headers_bytes: u64,
    pub max_request_body_bytes: u64,
    pub max_upstream_response_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8280".into(),
            upstream: "127.0.0.1:9000".into(),
            request_mediator: "request".into(),
            response_mediator: "response".into(),
            client_read_timeout_secs: 30,
            keepalive_timeout_secs: 75,
            upstream_connect_timeout_secs: 5,
            upstream_read_timeout_secs: 30,
            max_request_headers_bytes: 16 * 1024,
            max_request_body_bytes: 1024 * 1024,
            max_upstream_response_bytes: 8 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn request_mediator(&self) -> &str {
        &self.request_mediator
    }

    pub fn response_mediator(&self) -> &str {
        &self.response_mediator
    }

    pub fn client_read_timeout(&self) -> Duration {
        Duration::from_secs(self.client_read_timeout_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout_secs)
    }

    pub fn upstream_read_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_read_timeout_secs)
    }

    pub(crate) fn apply_defaults_from(&mut self, defaults: &ServerConfig) {
        if self.listen.is_empty() {
            self.listen = defaults.listen.clone();
        }
        if self.upstream.is_empty() {
            self.upstream = defaults.upstream.clone();
        }
        if self.request_mediator.is_empty() {
            self.request_mediator = defaults.request_mediator.clone();
        }
        if self.response_mediator.is_empty() {
            self.response_mediator = defaults.response_mediator.clone();
        }
        if self.client_read_timeout_secs == 0 {
            self.client_read_timeout_secs = defaults.client_read_timeout_secs;
        }
        if self.keepalive_timeout_secs == 0 {
            self.keepalive_timeout_secs = defaults.keepalive_timeout_secs;
        }
        if self.upstream_connect_timeout_secs == 0 {
            self.upstream_connect_timeout_secs = defaults.upstream_connect_timeout_secs;
        }
        if self.upstream_read_timeout_secs == 0 {
            self.upstream_read_timeout_secs = defaults.upstream_read_timeout_secs;
        }
    }
}
