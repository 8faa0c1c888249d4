use serde::Deserialize;
use std::collections::HashMap;

use crate::validation::{validate, ConfigReport};
use crate::{ClusterConfig, GlobalConfig, MediatorConfig, SequenceConfig, ServerConfig, StoreConfig};

// =======================================================
// MIRAGE CONFIG (main config)
// =======================================================
#[derive(Debug, Deserialize, Clone)]
pub struct MirageConfig {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub mediator: HashMap<String, MediatorConfig>,

    #[serde(default)]
    pub sequence: HashMap<String, SequenceConfig>,
}

impl Default for MirageConfig {
    fn default() -> Self {
        let mut cfg = Self {
            global: GlobalConfig::default(),
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            cluster: ClusterConfig::default(),
            mediator: HashMap::new(),
            sequence: HashMap::new(),
        };
        cfg.apply_defaults();
        cfg
    }
}

impl MirageConfig {
    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn mediators(&self) -> &HashMap<String, MediatorConfig> {
        &self.mediator
    }

    pub fn mediator(&self, name: &str) -> Option<&MediatorConfig> {
        self.mediator.get(name)
    }

    pub fn sequences(&self) -> &HashMap<String, SequenceConfig> {
        &self.sequence
    }

    pub fn sequence(&self, name: &str) -> Option<&SequenceConfig> {
        self.sequence.get(name)
    }

    /// Validate the configuration and return a report of warnings and errors.
    pub fn validate(&self) -> ConfigReport {
        validate(self)
    }

    pub fn from_file(file_name: &str) -> Result<Self, config::ConfigError> {
        let built = config::Config::builder()
            .add_source(config::File::new(file_name, config::FileFormat::Toml).required(false))
            .build()?;
        Self::from_built(built)
    }

    /// Parses TOML text directly. Used by tests and embedded setups.
    pub fn from_toml(text: &str) -> Result<Self, config::ConfigError> {
        let built = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;
        Self::from_built(built)
    }

    fn from_built(built: config::Config) -> Result<Self, config::ConfigError> {
        let mut cfg: MirageConfig = built.try_deserialize()?;
        cfg.apply_defaults();
        Ok(cfg)
    }

    pub fn from_file_or_default(file_name: &str) -> Self {
        match Self::from_file(file_name) {
            Ok(cfg) => {
                let report = cfg.validate();
                if report.has_errors() {
                    eprintln!("⚠️  Invalid config in '{file_name}':");
                    eprintln!("{}", report.format());
                    eprintln!("➡️  Using default config(in-memory)...");
                    MirageConfig::default()
                } else {
                    if !report.warnings().is_empty() {
                        eprintln!("⚠️  Config warnings in '{file_name}':");
                        eprintln!("{}", report.format());
                    }
                    cfg
                }
            }
            Err(e) => {
                eprintln!("⚠️  Error reading config '{file_name}': {e}");
                eprintln!("➡️  Using default config(in-memory)...");
                MirageConfig::default()
            }
        }
    }

    fn apply_defaults(&mut self) {
        self.global.apply_defaults_from(&GlobalConfig::default());

        let def_server = ServerConfig::default();
        self.server.apply_defaults_from(&def_server);

        self.store.apply_defaults_from(&StoreConfig::default());

        // A bare config still gets a working request/response pair.
        if self.mediator.is_empty() {
            self.mediator
                .insert(def_server.request_mediator.clone(), MediatorConfig::requester());
            self.mediator
                .insert(def_server.response_mediator.clone(), MediatorConfig::collector());
        }

        let def_mediator = MediatorConfig::default();
        for mediator in self.mediator.values_mut() {
            mediator.apply_defaults_from(&def_mediator);
        }
    }

    pub fn print(&self) {
        println!("================ MIRAGE CONFIG ===============");
        self.print_global();
        self.print_server();
        self.print_store();
        self.print_cluster();
        self.print_mediators();
        self.print_sequences();
        println!("==============================================");
    }

    fn print_global(&self) {
        println!("\n[global]");
        println!("  log_level            = {}", self.global.log_level);
        println!("  worker_connections   = {}", self.global.worker_connections);
    }

    fn print_server(&self) {
        println!("\n[server]");
        println!("  listen               = {}", self.server.listen);
        println!("  upstream             = {}", self.server.upstream);
        println!("  request_mediator     = {}", self.server.request_mediator);
        println!("  response_mediator    = {}", self.server.response_mediator);
        println!(
            "  client_read_timeout_secs = {}",
            self.server.client_read_timeout_secs
        );
        println!(
            "  keepalive_timeout_secs = {}",
            self.server.keepalive_timeout_secs
        );
        println!(
            "  upstream_connect_timeout_secs = {}",
            self.server.upstream_connect_timeout_secs
        );
        println!(
            "  upstream_read_timeout_secs = {}",
            self.server.upstream_read_timeout_secs
        );
        println!(
            "  max_request_headers_bytes = {}",
            self.server.max_request_headers_bytes
        );
        println!(
            "  max_request_body_bytes = {}",
            self.server.max_request_body_bytes
        );
        println!(
            "  max_upstream_response_bytes = {}",
            self.server.max_upstream_response_bytes
        );
    }

    fn print_store(&self) {
        println!("\n[store]");
        println!("  backstop_write_secs  = {}", self.store.backstop_write_secs);
        println!("  backstop_access_secs = {}", self.store.backstop_access_secs);
        println!("  sweep_interval_secs  = {}", self.store.sweep_interval_secs);
    }

    fn print_cluster(&self) {
        println!("\n[cluster]");
        println!("  enabled              = {}", self.cluster.enabled);
        println!("  bind                 = {}", self.cluster.bind);
        println!("  peers                = {:?}", self.cluster.peers);
    }

    fn print_mediators(&self) {
        println!("\n[mediator]");
        for (name, m) in &self.mediator {
            println!("  mediator {}:", name);
            println!("    id               = {:?}", m.id);
            println!("    scope            = {}", m.scope.as_str());
            println!("    collector        = {}", m.collector);
            if m.collector {
                continue;
            }
            println!("    hash_generator   = {}", m.hash_generator);
            println!("    digest_algorithm = {}", m.digest_algorithm);
            println!("    timeout_secs     = {}", m.timeout_secs);
            println!("    max_message_size = {}", m.max_message_size);
            println!("    in_memory_size   = {}", m.in_memory_size());
            if let Some(hit) = &m.on_cache_hit {
                println!("    on_cache_hit.sequence = {:?}", hit.sequence);
                println!("    on_cache_hit.steps    = {}", hit.steps.len());
            }
        }
    }

    fn print_sequences(&self) {
        println!("\n[sequence]");
        for (name, seq) in &self.sequence {
            println!("  sequence {}:", name);
            for step in &seq.steps {
                println!("    - {} {:?}", step.action, step.name);
            }
        }
    }
}
