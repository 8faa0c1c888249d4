use std::time::Duration;

use serde::Deserialize;

use crate::StepConfig;

pub const DEFAULT_TIMEOUT_SECS: i64 = 5000;
pub const DEFAULT_IN_MEMORY_SIZE: usize = 1000;
pub const DEFAULT_DISK_SIZE: usize = 200;

// =======================================================
// CACHE SCOPE (enum tipado)
// =======================================================
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheScope {
    /// Shared by every mediator on this node.
    #[default]
    #[serde(rename = "per-host")]
    PerHost,
    /// Private to one mediator id.
    #[serde(rename = "per-mediator")]
    PerMediator,
    /// Shared and replicated across the cluster.
    #[serde(rename = "distributed")]
    Distributed,
}

impl CacheScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerHost => "per-host",
            Self::PerMediator => "per-mediator",
            Self::Distributed => "distributed",
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImplementationType {
    #[default]
    #[serde(rename = "memory")]
    Memory,
    /// Accepted but not implemented; logged at startup.
    #[serde(rename = "disk")]
    Disk,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ImplementationConfig {
    pub r#type: ImplementationType,
    pub max_size: Option<usize>,
}

/// Either a named `[sequence.<name>]` or inline steps.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OnCacheHitConfig {
    pub sequence: Option<String>,
    pub steps: Vec<StepConfig>,
}

// =======================================================
// MEDIATOR CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MediatorConfig {
    pub id: Option<String>,
    pub scope: CacheScope,
    /// true → response leg (collector), false → request leg (requester).
    pub collector: bool,
    pub hash_generator: String,
    pub digest_algorithm: String,
    /// Seconds. 0 or less keeps entries permanently expired.
    pub timeout_secs: i64,
    /// Bytes. 0 caches responses of any size.
    pub max_message_size: usize,
    pub implementation: Vec<ImplementationConfig>,
    pub on_cache_hit: Option<OnCacheHitConfig>,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            id: None,
            scope: CacheScope::PerHost,
            collector: false,
            hash_generator: "url".into(),
            digest_algorithm: "MD5".into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_message_size: 0,
            implementation: Vec::new(),
            on_cache_hit: None,
        }
    }
}

impl MediatorConfig {
    pub fn requester() -> Self {
        Self::default()
    }

    pub fn collector() -> Self {
        Self {
            collector: true,
            ..Self::default()
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn scope(&self) -> CacheScope {
        self.scope
    }

    pub fn is_collector(&self) -> bool {
        self.collector
    }

    pub fn hash_generator(&self) -> &str {
        &self.hash_generator
    }

    pub fn digest_algorithm(&self) -> &str {
        &self.digest_algorithm
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(0) as u64)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn on_cache_hit(&self) -> Option<&OnCacheHitConfig> {
        self.on_cache_hit.as_ref()
    }

    /// Size hint of the in-memory store, from the last sized `memory` entry.
    pub fn in_memory_size(&self) -> usize {
        self.implementation
            .iter()
            .filter(|imp| imp.r#type == ImplementationType::Memory)
            .filter_map(|imp| imp.max_size)
            .last()
            .unwrap_or(DEFAULT_IN_MEMORY_SIZE)
    }

    /// Configured disk size, if a `disk` entry exists at all.
    pub fn disk_size(&self) -> Option<usize> {
        self.implementation
            .iter()
            .filter(|imp| imp.r#type == ImplementationType::Disk)
            .map(|imp| imp.max_size.unwrap_or(DEFAULT_DISK_SIZE))
            .last()
    }

    /// Name of the store this mediator reads and writes.
    pub fn store_name(&self) -> String {
        match (self.scope, self.id()) {
            (CacheScope::PerMediator, Some(id)) => format!("mediation.cache_key_{id}"),
            (CacheScope::Distributed, _) => "mediation.cache_key.distributed".into(),
            _ => "mediation.cache_key".into(),
        }
    }

    pub(crate) fn apply_defaults_from(&mut self, defaults: &MediatorConfig) {
        if self.hash_generator.is_empty() {
            self.hash_generator = defaults.hash_generator.clone();
        }
        if self.digest_algorithm.is_empty() {
            self.digest_algorithm = defaults.digest_algorithm.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_name_depends_on_scope() {
        let mut cfg = MediatorConfig::requester();
        assert_eq!(cfg.store_name(), "mediation.cache_key");

        cfg.scope = CacheScope::PerMediator;
        cfg.id = Some("orders".into());
        assert_eq!(cfg.store_name(), "mediation.cache_key_orders");

        cfg.scope = CacheScope::Distributed;
        assert_eq!(cfg.store_name(), "mediation.cache_key.distributed");
    }

    #[test]
    fn implementation_sizes_fall_back_to_defaults() {
        let mut cfg = MediatorConfig::requester();
        assert_eq!(cfg.in_memory_size(), DEFAULT_IN_MEMORY_SIZE);
        assert_eq!(cfg.disk_size(), None);

        cfg.implementation = vec![
            ImplementationConfig {
                r#type: ImplementationType::Memory,
                max_size: Some(50),
            },
            ImplementationConfig {
                r#type: ImplementationType::Disk,
                max_size: None,
            },
        ];
        assert_eq!(cfg.in_memory_size(), 50);
        assert_eq!(cfg.disk_size(), Some(DEFAULT_DISK_SIZE));
    }

    #[test]
    fn negative_timeout_is_zero() {
        let cfg = MediatorConfig {
            timeout_secs: -5,
            ..MediatorConfig::requester()
        };
        assert_eq!(cfg.timeout(), Duration::ZERO);
        assert_eq!(MediatorConfig::requester().timeout(), Duration::from_secs(5000));
    }
}
