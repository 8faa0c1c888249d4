//! Continuations run when a request is served from the cache.

use std::{collections::HashMap, sync::Arc};

use mirage_config::{SequenceConfig, StepConfig};
use tracing::info;

use crate::{error::MediatorError, message::MessageContext};

/// Something that can mediate a message on a cache hit.
///
/// Returns `true` when the (possibly modified) message should be sent back
/// to the caller, `false` when the sequence has taken the message over.
pub trait Sequence: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn mediate(&self, ctx: &mut MessageContext) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    SetHeader { name: String, value: String },
    RemoveHeader { name: String },
    Log { message: String },
}

impl Step {
    pub fn from_config(cfg: &StepConfig) -> Result<Self, MediatorError> {
        let name = cfg.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
        match cfg.action.as_str() {
            "set_header" => match (name, &cfg.value) {
                (Some(name), Some(value)) => Ok(Self::SetHeader {
                    name: name.to_ascii_lowercase(),
                    value: value.clone(),
                }),
                _ => Err(MediatorError::Config(
                    "set_header requires name and value".into(),
                )),
            },
            "remove_header" => name
                .map(|name| Self::RemoveHeader {
                    name: name.to_ascii_lowercase(),
                })
                .ok_or_else(|| MediatorError::Config("remove_header requires name".into())),
            "log" => Ok(Self::Log {
                message: cfg.message.clone().unwrap_or_else(|| "cache hit".into()),
            }),
            other => Err(MediatorError::Config(format!(
                "unknown sequence action '{other}'"
            ))),
        }
    }

    fn apply(&self, sequence: &str, ctx: &mut MessageContext) {
        match self {
            Self::SetHeader { name, value } => ctx.set_header(name, value.clone()),
            Self::RemoveHeader { name } => {
                ctx.remove_header(name);
            }
            Self::Log { message } => info!(
                target: "mirage::sequence",
                sequence,
                message_id = %ctx.message_id(),
                "{message}"
            ),
        }
    }
}

/// Steps applied in order to the message.
#[derive(Debug, Clone)]
pub struct InlineSequence {
    name: String,
    steps: Vec<Step>,
}

impl InlineSequence {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub fn from_config(name: impl Into<String>, steps: &[StepConfig]) -> Result<Self, MediatorError> {
        let steps = steps
            .iter()
            .map(Step::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(name, steps))
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

impl Sequence for InlineSequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn mediate(&self, ctx: &mut MessageContext) -> anyhow::Result<bool> {
        for step in &self.steps {
            step.apply(&self.name, ctx);
        }
        Ok(true)
    }
}

/// Named sequences an on-hit continuation can refer to.
#[derive(Debug, Default)]
pub struct SequenceRegistry {
    sequences: HashMap<String, Arc<dyn Sequence>>,
}

impl SequenceRegistry {
    pub fn from_config(sequences: &HashMap<String, SequenceConfig>) -> Result<Self, MediatorError> {
        let mut registry = Self::default();
        for (name, cfg) in sequences {
            let sequence = InlineSequence::from_config(name.clone(), cfg.steps())
                .map_err(|err| MediatorError::Config(format!("sequence '{name}': {err}")))?;
            registry.register(Arc::new(sequence));
        }
        Ok(registry)
    }

    pub fn register(&mut self, sequence: Arc<dyn Sequence>) {
        self.sequences.insert(sequence.name().to_string(), sequence);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Sequence>> {
        self.sequences.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sequences.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn step(action: &str, name: Option<&str>, value: Option<&str>) -> StepConfig {
        StepConfig {
            action: action.into(),
            name: name.map(Into::into),
            value: value.map(Into::into),
            message: None,
        }
    }

    #[test]
    fn inline_sequence_applies_steps_in_order() {
        let seq = InlineSequence::from_config(
            "hit",
            &[
                step("set_header", Some("X-Cache"), Some("HIT")),
                step("set_header", Some("X-Tmp"), Some("1")),
                step("remove_header", Some("x-tmp"), None),
                step("log", None, None),
            ],
        )
        .expect("valid steps");

        let mut ctx = MessageContext::request("http://x/api", Bytes::new());
        assert!(seq.mediate(&mut ctx).expect("mediate"));
        assert_eq!(ctx.header("x-cache"), Some("HIT"));
        assert_eq!(ctx.header("x-tmp"), None);
    }

    #[test]
    fn invalid_steps_are_rejected() {
        assert!(Step::from_config(&step("set_header", Some("x"), None)).is_err());
        assert!(Step::from_config(&step("remove_header", Some("  "), None)).is_err());
        assert!(matches!(
            Step::from_config(&step("explode", None, None)),
            Err(MediatorError::Config(_))
        ));
    }

    #[test]
    fn registry_builds_named_sequences() {
        let mut sequences = HashMap::new();
        sequences.insert(
            "cachehit".to_string(),
            SequenceConfig {
                steps: vec![step("set_header", Some("x-cache"), Some("HIT"))],
            },
        );
        let registry = SequenceRegistry::from_config(&sequences).expect("registry");
        assert!(registry.contains("cachehit"));
        assert_eq!(registry.get("cachehit").map(|s| s.name().to_string()), Some("cachehit".into()));
        assert!(registry.get("other").is_none());
    }
}
