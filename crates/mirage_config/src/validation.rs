use std::net::SocketAddr;

use mirage_cache::{DigestAlgorithm, DigestStrategy};

use crate::{CacheScope, MediatorConfig, MirageConfig, StepConfig};

/// Validation output for a loaded Mirage configuration.
#[derive(Debug, Default)]
pub struct ConfigReport {
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl ConfigReport {
    /// Returns true when no errors were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Render warnings and errors into a readable, multi-line string.
    pub fn format(&self) -> String {
        let mut out = String::new();
        if !self.errors.is_empty() {
            out.push_str("Errors:\n");
            for err in &self.errors {
                out.push_str("  - ");
                out.push_str(err);
                out.push('\n');
            }
        }
        if !self.warnings.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("Warnings:\n");
            for warn in &self.warnings {
                out.push_str("  - ");
                out.push_str(warn);
                out.push('\n');
            }
        }
        out
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

/// Validate a Mirage configuration and return a report of issues.
pub fn validate(cfg: &MirageConfig) -> ConfigReport {
    let mut report = ConfigReport::default();

    validate_server(cfg, &mut report);
    validate_cluster(cfg, &mut report);
    validate_mediators(cfg, &mut report);
    validate_sequences(cfg, &mut report);

    report
}

fn validate_server(cfg: &MirageConfig, report: &mut ConfigReport) {
    let server = &cfg.server;
    if server.listen.parse::<SocketAddr>().is_err() {
        report.warn(format!(
            "server listen '{listen}' is not a socket address; DNS resolution will be used",
            listen = server.listen
        ));
    }
    if server.upstream.trim().is_empty() {
        report.error("server.upstream is empty");
    }

    match cfg.mediator.get(&server.request_mediator) {
        None => report.error(format!(
            "server.request_mediator references unknown mediator '{name}'",
            name = server.request_mediator
        )),
        Some(m) if m.collector => report.error(format!(
            "server.request_mediator '{name}' is a collector and cannot handle requests",
            name = server.request_mediator
        )),
        Some(_) => {}
    }

    match cfg.mediator.get(&server.response_mediator) {
        None => report.error(format!(
            "server.response_mediator references unknown mediator '{name}'",
            name = server.response_mediator
        )),
        Some(m) if !m.collector => report.error(format!(
            "server.response_mediator '{name}' is not a collector and cannot handle responses",
            name = server.response_mediator
        )),
        Some(_) => {}
    }
}

fn validate_cluster(cfg: &MirageConfig, report: &mut ConfigReport) {
    let cluster = &cfg.cluster;
    if !cluster.enabled {
        let distributed = cfg
            .mediator
            .values()
            .any(|m| m.scope == CacheScope::Distributed);
        if distributed {
            report.warn("a mediator uses scope 'distributed' but [cluster] is disabled; entries stay local");
        }
        return;
    }

    if cluster.bind.parse::<SocketAddr>().is_err() {
        report.error(format!(
            "cluster.bind '{bind}' is not a socket address",
            bind = cluster.bind
        ));
    }
    if cluster.peers.is_empty() {
        report.warn("cluster is enabled but has no peers; replication is a no-op");
    }
    for peer in &cluster.peers {
        if peer.parse::<SocketAddr>().is_err() {
            report.error(format!("cluster peer '{peer}' is not a socket address"));
        }
    }
}

fn validate_mediators(cfg: &MirageConfig, report: &mut ConfigReport) {
    for (name, mediator) in &cfg.mediator {
        if mediator.scope == CacheScope::PerMediator
            && mediator.id.as_deref().map_or(true, |id| id.trim().is_empty())
        {
            report.error(format!(
                "mediator '{name}': id is required for a cache with scope 'per-mediator'"
            ));
        }

        if mediator.collector {
            if has_requester_settings(mediator) {
                report.warn(format!(
                    "mediator '{name}' is a collector; requester settings (timeout, digest, on_cache_hit, implementation) are ignored"
                ));
            }
            continue;
        }

        if let Err(err) = mediator.hash_generator.parse::<DigestStrategy>() {
            report.error(format!("mediator '{name}': {err}"));
        }
        if let Err(err) = mediator.digest_algorithm.parse::<DigestAlgorithm>() {
            report.error(format!("mediator '{name}': {err}"));
        }
        if mediator.timeout_secs <= 0 {
            report.warn(format!(
                "mediator '{name}' timeout_secs is {t}; responses will never be served from cache",
                t = mediator.timeout_secs
            ));
        }
        if mediator.disk_size().is_some() {
            report.warn(format!(
                "mediator '{name}': disk based and hierarchical caching is not implemented yet"
            ));
        }

        if let Some(hit) = &mediator.on_cache_hit {
            match (&hit.sequence, hit.steps.is_empty()) {
                (Some(seq), _) if !cfg.sequence.contains_key(seq) => report.error(format!(
                    "mediator '{name}' on_cache_hit references unknown sequence '{seq}'"
                )),
                (Some(_), false) => report.warn(format!(
                    "mediator '{name}' on_cache_hit defines both a sequence and inline steps; the sequence wins"
                )),
                _ => {}
            }
            for (idx, step) in hit.steps.iter().enumerate() {
                validate_step(&format!("mediator '{name}' on_cache_hit step {idx}"), step, report);
            }
        }
    }
}

fn has_requester_settings(mediator: &MediatorConfig) -> bool {
    let defaults = MediatorConfig::default();
    mediator.timeout_secs != defaults.timeout_secs
        || mediator.hash_generator != defaults.hash_generator
        || mediator.digest_algorithm != defaults.digest_algorithm
        || mediator.max_message_size != defaults.max_message_size
        || mediator.on_cache_hit.is_some()
        || !mediator.implementation.is_empty()
}

fn validate_sequences(cfg: &MirageConfig, report: &mut ConfigReport) {
    for (name, sequence) in &cfg.sequence {
        if sequence.steps.is_empty() {
            report.warn(format!("sequence '{name}' has no steps"));
        }
        for (idx, step) in sequence.steps.iter().enumerate() {
            validate_step(&format!("sequence '{name}' step {idx}"), step, report);
        }
    }
}

fn validate_step(at: &str, step: &StepConfig, report: &mut ConfigReport) {
    let named = step.name.as_deref().is_some_and(|n| !n.trim().is_empty());
    match step.action.as_str() {
        "set_header" => {
            if !named || step.value.is_none() {
                report.error(format!("{at}: set_header requires name and value"));
            }
        }
        "remove_header" => {
            if !named {
                report.error(format!("{at}: remove_header requires name"));
            }
        }
        "log" => {}
        other => report.error(format!("{at}: unknown action '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(text: &str) -> MirageConfig {
        MirageConfig::from_toml(text).expect("parse")
    }

    #[test]
    fn per_mediator_scope_requires_id() {
        let cfg = load(
            "[mediator.request]\nscope = \"per-mediator\"\n[mediator.response]\ncollector = true\n",
        );
        let report = cfg.validate();
        assert!(report.has_errors());
        assert!(report.errors()[0].contains("id is required"));
    }

    #[test]
    fn unknown_generator_is_an_error() {
        let cfg = load(
            "[mediator.request]\nhash_generator = \"dom\"\n[mediator.response]\ncollector = true\n",
        );
        let report = cfg.validate();
        assert!(report.errors().iter().any(|e| e.contains("'dom'")));
    }

    #[test]
    fn disk_implementation_only_warns() {
        let cfg = load(
            "[[mediator.request.implementation]]\ntype = \"disk\"\n[mediator.response]\ncollector = true\n",
        );
        let report = cfg.validate();
        assert!(report.is_ok());
        assert!(report.warnings().iter().any(|w| w.contains("not implemented")));
    }

    #[test]
    fn collector_with_requester_settings_warns() {
        let cfg = load("[mediator.request]\n[mediator.response]\ncollector = true\ntimeout_secs = 10\n");
        let report = cfg.validate();
        assert!(report.is_ok());
        assert!(report.warnings().iter().any(|w| w.contains("collector")));
    }

    #[test]
    fn server_legs_must_match_roles() {
        let cfg = load("[mediator.request]\ncollector = true\n[mediator.response]\n");
        let report = cfg.validate();
        assert_eq!(report.errors().len(), 2);
    }

    #[test]
    fn unknown_sequence_and_bad_steps_are_errors() {
        let cfg = load(
            r#"
[mediator.request.on_cache_hit]
sequence = "missing"
[mediator.response]
collector = true
[sequence.other]
steps = [{ action = "set_header", name = "x" }, { action = "explode" }]
"#,
        );
        let report = cfg.validate();
        let text = report.format();
        assert!(text.contains("unknown sequence 'missing'"));
        assert!(text.contains("set_header requires name and value"));
        assert!(text.contains("unknown action 'explode'"));
    }

    #[test]
    fn cluster_peers_must_be_socket_addresses() {
        let cfg = load("[cluster]\nenabled = true\npeers = [\"not-an-addr\"]\n");
        let report = cfg.validate();
        assert!(report.errors().iter().any(|e| e.contains("not-an-addr")));
    }
}
