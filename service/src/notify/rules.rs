//! Declarative notification rules. Rules are data, not code; event type
//! globs are compiled once at load.

use anyhow::{Context, Result};
use aof_core::Event;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message severity; `Critical` bypasses dedupe batching and storm windows
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

/// What a rule matches: an event type glob plus exact payload scalars
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    /// Event type pattern, e.g. `task.*` or `gate_timeout*`
    pub event_type: String,
    /// Every key here must equal the event's payload value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, serde_json::Value>,
}

/// One notification rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRule {
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    #[serde(default)]
    pub severity: Severity,
    pub channel: String,
    /// Per-rule dedupe window; the policy default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_window_ms: Option<u64>,
    /// Bypass dedupe for always-critical types
    #[serde(default)]
    pub never_suppress: bool,
    /// Message template with `{field.path}` tokens
    pub template: String,
}

/// A rule with its compiled glob
pub struct CompiledRule {
    pub rule: NotificationRule,
    glob: GlobMatcher,
}

impl CompiledRule {
    /// The rule matches when its glob accepts the event type and every
    /// payload key equals the event's payload value.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.glob.is_match(&event.event_type) {
            return false;
        }
        self.rule
            .matcher
            .payload
            .iter()
            .all(|(key, expected)| event.payload.get(key) == Some(expected))
    }
}

/// An ordered rule list; first match wins.
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile the glob of every rule once
    pub fn compile(rules: Vec<NotificationRule>) -> Result<Self> {
        let compiled = rules
            .into_iter()
            .map(|rule| {
                let glob = Glob::new(&rule.matcher.event_type)
                    .with_context(|| {
                        format!("invalid event type glob '{}'", rule.matcher.event_type)
                    })?
                    .compile_matcher();
                Ok(CompiledRule { rule, glob })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules: compiled })
    }

    /// First rule matching the event
    pub fn first_match(&self, event: &Event) -> Option<&CompiledRule> {
        self.rules.iter().find(|rule| rule.matches(event))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(event_type: &str, payload: serde_json::Value) -> Event {
        Event {
            event_id: 1,
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            actor: "test".to_string(),
            task_id: Some("TASK-2025-06-01-001".to_string()),
            payload,
        }
    }

    fn rule(event_type: &str, channel: &str) -> NotificationRule {
        NotificationRule {
            matcher: RuleMatch {
                event_type: event_type.to_string(),
                payload: BTreeMap::new(),
            },
            severity: Severity::Info,
            channel: channel.to_string(),
            dedupe_window_ms: None,
            never_suppress: false,
            template: "{type}".to_string(),
        }
    }

    #[test]
    fn test_glob_matching() {
        let rules = RuleSet::compile(vec![
            rule("task.*", "tasks"),
            rule("gate_timeout*", "gates"),
        ])
        .unwrap();

        assert_eq!(
            rules
                .first_match(&event("task.transitioned", serde_json::json!({})))
                .unwrap()
                .rule
                .channel,
            "tasks"
        );
        assert_eq!(
            rules
                .first_match(&event("gate_timeout_escalation", serde_json::json!({})))
                .unwrap()
                .rule
                .channel,
            "gates"
        );
        assert!(rules
            .first_match(&event("lease.expired", serde_json::json!({})))
            .is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let mut specific = rule("task.transitioned", "specific");
        specific
            .matcher
            .payload
            .insert("to".to_string(), serde_json::json!("deadletter"));
        let rules = RuleSet::compile(vec![specific, rule("task.*", "general")]).unwrap();

        let deadletter = event("task.transitioned", serde_json::json!({"to": "deadletter"}));
        assert_eq!(rules.first_match(&deadletter).unwrap().rule.channel, "specific");

        let ready = event("task.transitioned", serde_json::json!({"to": "ready"}));
        assert_eq!(rules.first_match(&ready).unwrap().rule.channel, "general");
    }

    #[test]
    fn test_payload_keys_all_must_match() {
        let mut r = rule("task.*", "filtered");
        r.matcher
            .payload
            .insert("from".to_string(), serde_json::json!("ready"));
        r.matcher
            .payload
            .insert("to".to_string(), serde_json::json!("in-progress"));
        let rules = RuleSet::compile(vec![r]).unwrap();

        assert!(rules
            .first_match(&event(
                "task.transitioned",
                serde_json::json!({"from": "ready", "to": "in-progress"})
            ))
            .is_some());
        assert!(rules
            .first_match(&event(
                "task.transitioned",
                serde_json::json!({"from": "ready", "to": "blocked"})
            ))
            .is_none());
    }

    #[test]
    fn test_invalid_glob_fails_compile() {
        assert!(RuleSet::compile(vec![rule("task.[", "broken")]).is_err());
    }
}
