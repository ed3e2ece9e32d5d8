//! Sequence definition: the ordered drip plan every lead walks through.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SequenceError;
use crate::leads::Channel;

/// One A/B alternative for a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub content: String,
}

/// Gating predicate on a step.
///
/// Predicates are kept as raw key/value pairs so unknown keys survive
/// loading and are ignored at evaluation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepCondition {
    #[serde(flatten)]
    pub predicates: BTreeMap<String, serde_json::Value>,
    /// What to do when a predicate does not hold (`"skip"` or anything else).
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub else_action: Option<String>,
}

impl StepCondition {
    pub fn skips_on_failure(&self) -> bool {
        self.else_action.as_deref() == Some("skip")
    }
}

/// One timed, channel-specific touchpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: i64,
    pub channel: Channel,
    #[serde(default)]
    pub delay_days: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
}

/// Ordered list of steps. Immutable for the duration of a scheduler pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    #[serde(default)]
    pub name: String,
    pub steps: Vec<Step>,
}

impl SequenceDefinition {
    /// Read and validate a JSON sequence file.
    pub fn load(path: &Path) -> Result<Self, SequenceError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, SequenceError> {
        let sequence: Self = serde_json::from_str(raw)?;
        sequence.validate()?;
        Ok(sequence)
    }

    pub fn validate(&self) -> Result<(), SequenceError> {
        if self.steps.is_empty() {
            return Err(SequenceError::Invalid("sequence has no steps".into()));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id <= 0 {
                return Err(SequenceError::Invalid(format!(
                    "step id {} must be positive",
                    step.id
                )));
            }
            if !seen.insert(step.id) {
                return Err(SequenceError::Invalid(format!("duplicate step id {}", step.id)));
            }
            if step.delay_days < 0 {
                return Err(SequenceError::Invalid(format!(
                    "step {} has a negative delay",
                    step.id
                )));
            }
            if step.content.is_none() && step.variants.is_empty() {
                return Err(SequenceError::Invalid(format!(
                    "step {} has neither content nor variants",
                    step.id
                )));
            }
        }
        Ok(())
    }

    pub fn step(&self, id: i64) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether `step` opens the sequence.
    pub fn is_first(&self, step: &Step) -> bool {
        self.steps.first().is_some_and(|first| first.id == step.id)
    }
}
