use serde::Deserialize;

// =======================================================
// SEQUENCES (inline steps run on a cache hit)
// =======================================================
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SequenceConfig {
    pub steps: Vec<StepConfig>,
}

/// One step. `action` is one of `set_header`, `remove_header` or `log`.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StepConfig {
    pub action: String,
    pub name: Option<String>,
    pub value: Option<String>,
    pub message: Option<String>,
}

impl SequenceConfig {
    pub fn steps(&self) -> &[StepConfig] {
        &self.steps
    }
}
