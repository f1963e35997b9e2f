use chrono::Duration;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::{AofError, Result};

/// Where rejected work is sent. The schema allows `origin` only; any other
/// value is a validation error at workflow load, never a guess.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RejectionStrategy {
    /// Route back to the earliest prior gate that produced the work
    #[default]
    Origin,
}

/// One stage in a workflow pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Gate {
    /// Gate id, unique within the workflow
    pub id: String,
    /// Role expected to work this gate
    pub role: String,
    /// Whether this gate may send work back
    #[serde(default)]
    pub can_reject: bool,
    /// Conditional activation expression over {tags, metadata, gateHistory}
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Plain-language description injected into the gate context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Requires a human decision rather than an agent
    #[serde(default)]
    pub require_human: bool,
    /// Stuck threshold, e.g. "30m" or "2h"; invalid formats disable it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Role that receives the work when the timeout fires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_to: Option<String>,
}

impl Gate {
    /// Parsed timeout, `None` when absent or invalid
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.as_deref().and_then(parse_gate_timeout)
    }
}

/// Ordered list of gates with a rejection strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Workflow name, referenced by `routing.workflow`
    pub name: String,
    /// Where rejected work goes
    #[serde(default)]
    pub rejection_strategy: RejectionStrategy,
    /// Pipeline stages, in order
    pub gates: Vec<Gate>,
    /// Optional outcome label overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcomes: Option<BTreeMap<String, String>>,
}

impl Workflow {
    /// Look up a gate by id
    pub fn gate(&self, id: &str) -> Option<&Gate> {
        self.gates.iter().find(|g| g.id == id)
    }

    /// Position of a gate in the pipeline
    pub fn gate_index(&self, id: &str) -> Option<usize> {
        self.gates.iter().position(|g| g.id == id)
    }

    /// First gate of the pipeline
    pub fn first_gate(&self) -> Option<&Gate> {
        self.gates.first()
    }

    /// Gate following the given one, `None` at the end of the pipeline
    pub fn next_gate(&self, after: &str) -> Option<&Gate> {
        let idx = self.gate_index(after)?;
        self.gates.get(idx + 1)
    }

    /// Structural validation: at least one gate, unique ids, non-empty
    /// roles, escalation targets only beside a timeout.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AofError::empty_field("workflow.name"));
        }
        if self.gates.is_empty() {
            return Err(AofError::Workflow(format!(
                "workflow '{}' has no gates",
                self.name
            )));
        }

        let mut seen = std::collections::BTreeSet::new();
        for gate in &self.gates {
            if gate.id.trim().is_empty() {
                return Err(AofError::empty_field("gate.id"));
            }
            if gate.role.trim().is_empty() {
                return Err(AofError::Workflow(format!(
                    "gate '{}' has no role",
                    gate.id
                )));
            }
            if !seen.insert(gate.id.as_str()) {
                return Err(AofError::Workflow(format!(
                    "duplicate gate id '{}' in workflow '{}'",
                    gate.id, self.name
                )));
            }
            if gate.escalate_to.as_deref().is_some_and(str::is_empty) {
                return Err(AofError::Workflow(format!(
                    "gate '{}' has an empty escalateTo",
                    gate.id
                )));
            }
        }
        Ok(())
    }
}

/// What each reported outcome means at the current gate, in plain language
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GateOutcomeGuide {
    pub complete: String,
    pub needs_review: String,
    pub blocked: String,
}

/// Plain-language gate context attached to a dispatch so the agent knows
/// where it stands in the pipeline and which outcomes it may report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GateContext {
    /// Role working the gate
    pub role: String,
    /// Gate id
    pub gate: String,
    /// What the gate expects of the work
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expectations: Vec<String>,
    /// Outcome semantics at this gate
    pub outcomes: GateOutcomeGuide,
    /// Extra guidance (rejection loop-back feedback, human-approval notes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tips: Option<String>,
}

fn timeout_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([1-9]\d*)(m|h)$").expect("gate timeout regex"))
}

/// Parse a gate timeout spec. Accepts whole positive minutes (`m`) or hours
/// (`h`) only; anything else (zero, fractions, seconds, days, negatives,
/// empty) disables the timeout by returning `None`, without error.
pub fn parse_gate_timeout(spec: &str) -> Option<Duration> {
    let caps = timeout_regex().captures(spec)?;
    let quantity: i64 = caps.get(1)?.as_str().parse().ok()?;
    match caps.get(2)?.as_str() {
        "m" => Some(Duration::minutes(quantity)),
        "h" => Some(Duration::hours(quantity)),
        _ => None,
    }
}
