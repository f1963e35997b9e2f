//! AOF/1 envelope and per-type payload schemas with size-limit validation.

use aof_core::{AofError, Result, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol discriminator carried in every envelope
pub const PROTOCOL_NAME: &str = "aof";
/// Supported protocol version
pub const PROTOCOL_VERSION: u32 = 1;

// Field size limits; anything above is rejected, never truncated
const MAX_SUMMARY: usize = 256;
const MAX_NOTES: usize = 10_000;
const MAX_PROGRESS: usize = 1_000;
const MAX_REASON: usize = 512;
const MAX_ITEM: usize = 256;
const MAX_LIST: usize = 50;
const MAX_BLOCKERS: usize = 20;

/// Message type names on the wire
pub mod types {
    pub const HANDOFF_REQUEST: &str = "handoff.request";
    pub const HANDOFF_ACCEPTED: &str = "handoff.accepted";
    pub const HANDOFF_REJECTED: &str = "handoff.rejected";
    pub const STATUS_UPDATE: &str = "status.update";
    pub const COMPLETION_REPORT: &str = "completion.report";
}

/// The structured message wrapper agents send back to the orchestrator.
/// `project_id` is accepted as a snake_case alias for `projectId`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub protocol: String,
    pub version: u32,
    #[serde(alias = "project_id")]
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_relpath: Option<String>,
    pub task_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub sent_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Structural validation of the wrapper itself
    pub fn validate(&self) -> Result<()> {
        if self.protocol != PROTOCOL_NAME {
            return Err(AofError::Parse(format!(
                "unsupported protocol '{}'",
                self.protocol
            )));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(AofError::Parse(format!(
                "unsupported protocol version {}",
                self.version
            )));
        }
        if self.task_id.trim().is_empty() {
            return Err(AofError::empty_field("taskId"));
        }
        if self.from_agent.trim().is_empty() {
            return Err(AofError::empty_field("fromAgent"));
        }
        Ok(())
    }

    /// Parse and validate the typed payload for this envelope's type.
    /// Unknown types are `Ok(None)` so the router can report them as
    /// unknown rather than invalid.
    pub fn parse_payload(&self) -> Result<Option<MessagePayload>> {
        let payload = match self.message_type.as_str() {
            types::STATUS_UPDATE => {
                let p: StatusUpdate = from_payload(&self.payload)?;
                p.validate()?;
                MessagePayload::StatusUpdate(p)
            }
            types::COMPLETION_REPORT => {
                let p: CompletionReport = from_payload(&self.payload)?;
                p.validate()?;
                MessagePayload::CompletionReport(p)
            }
            types::HANDOFF_REQUEST => {
                let p: HandoffRequest = from_payload(&self.payload)?;
                p.validate()?;
                MessagePayload::HandoffRequest(p)
            }
            types::HANDOFF_ACCEPTED => {
                let p: HandoffAccepted = from_payload(&self.payload)?;
                p.validate()?;
                MessagePayload::HandoffAccepted(p)
            }
            types::HANDOFF_REJECTED => {
                let p: HandoffRejected = from_payload(&self.payload)?;
                p.validate()?;
                MessagePayload::HandoffRejected(p)
            }
            _ => return Ok(None),
        };
        Ok(Some(payload))
    }

    /// Canonical wire text: `AOF/1 <json>`
    pub fn to_wire(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("AOF/1 {json}"))
    }
}

fn from_payload<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| AofError::Parse(format!("invalid payload: {e}")))
}

/// Typed, validated payload of an envelope
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    StatusUpdate(StatusUpdate),
    CompletionReport(CompletionReport),
    HandoffRequest(HandoffRequest),
    HandoffAccepted(HandoffAccepted),
    HandoffRejected(HandoffRejected),
}

/// Progress report, optionally carrying a status transition request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
}

impl StatusUpdate {
    pub fn validate(&self) -> Result<()> {
        check_len("progress", self.progress.as_deref(), MAX_PROGRESS)?;
        check_len("notes", self.notes.as_deref(), MAX_NOTES)?;
        check_list("blockers", &self.blockers, MAX_BLOCKERS)?;
        Ok(())
    }
}

/// How a completion report concluded
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    Done,
    NeedsReview,
    Blocked,
    Partial,
}

/// Test totals attached to a completion report
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    #[serde(default)]
    pub skipped: u32,
}

impl TestReport {
    pub fn validate(&self) -> Result<()> {
        if self.passed + self.failed > self.total {
            return Err(AofError::Validation(format!(
                "test report arithmetic: {} passed + {} failed > {} total",
                self.passed, self.failed, self.total
            )));
        }
        Ok(())
    }
}

/// Final (or partial) report on the leased work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub outcome: CompletionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliverables: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_report: Option<TestReport>,
}

impl CompletionReport {
    pub fn validate(&self) -> Result<()> {
        check_len("summaryRef", self.summary_ref.as_deref(), MAX_SUMMARY)?;
        check_len("notes", self.notes.as_deref(), MAX_NOTES)?;
        check_list("deliverables", &self.deliverables, MAX_LIST)?;
        check_list("outputs", &self.outputs, MAX_LIST)?;
        check_list("blockers", &self.blockers, MAX_BLOCKERS)?;
        if let Some(report) = &self.test_report {
            report.validate()?;
        }
        Ok(())
    }
}

/// Request to split work off to another agent as a subtask
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRequest {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliverables: Vec<String>,
}

impl HandoffRequest {
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(AofError::empty_field("title"));
        }
        check_len("title", Some(&self.title), MAX_ITEM)?;
        check_len("reason", self.reason.as_deref(), MAX_REASON)?;
        check_list("contextRefs", &self.context_refs, MAX_LIST)?;
        check_list("acceptance", &self.acceptance, MAX_LIST)?;
        check_list("constraints", &self.constraints, MAX_LIST)?;
        check_list("deliverables", &self.deliverables, MAX_LIST)?;
        Ok(())
    }
}

/// Acceptance of a delegated subtask by its target agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HandoffAccepted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl HandoffAccepted {
    pub fn validate(&self) -> Result<()> {
        check_len("notes", self.notes.as_deref(), MAX_NOTES)
    }
}

/// Refusal of a delegated subtask
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRejected {
    pub reason: String,
}

impl HandoffRejected {
    pub fn validate(&self) -> Result<()> {
        check_len("reason", Some(&self.reason), MAX_REASON)
    }
}

fn check_len(field: &str, value: Option<&str>, max: usize) -> Result<()> {
    match value {
        Some(v) if v.len() > max => Err(AofError::Validation(format!(
            "{field} exceeds {max} bytes ({} given)",
            v.len()
        ))),
        _ => Ok(()),
    }
}

fn check_list(field: &str, items: &[String], max_items: usize) -> Result<()> {
    if items.len() > max_items {
        return Err(AofError::Validation(format!(
            "{field} exceeds {max_items} items ({} given)",
            items.len()
        )));
    }
    for item in items {
        if item.len() > MAX_ITEM {
            return Err(AofError::Validation(format!(
                "{field} item exceeds {MAX_ITEM} bytes"
            )));
        }
    }
    Ok(())
}
