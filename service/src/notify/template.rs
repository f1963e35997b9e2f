//! `{field.path}` token rendering against an event.
//!
//! Tokens resolve through [`Event::field`]; a path that does not resolve
//! leaves the original token literal in place so broken templates stay
//! debuggable instead of silently losing context.

use aof_core::Event;

/// Render a template, replacing every `{path}` token
pub fn render_template(template: &str, event: &Event) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let path = &after_open[..close];
                match lookup(event, path) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(path);
                        out.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                // Unterminated token; emit the rest verbatim
                out.push('{');
                rest = after_open;
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup(event: &Event, path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    let value = event.field(path)?;
    Some(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event() -> Event {
        Event {
            event_id: 7,
            event_type: "task.transitioned".to_string(),
            timestamp: Utc::now(),
            actor: "scheduler".to_string(),
            task_id: Some("TASK-2025-06-01-001".to_string()),
            payload: serde_json::json!({"from": "ready", "to": "in-progress", "attempt": 2}),
        }
    }

    #[test]
    fn test_token_substitution() {
        let rendered = render_template(
            "{taskId}: {payload.from} -> {payload.to} (attempt {payload.attempt})",
            &event(),
        );
        assert_eq!(
            rendered,
            "TASK-2025-06-01-001: ready -> in-progress (attempt 2)"
        );
    }

    #[test]
    fn test_missing_path_keeps_literal_token() {
        let rendered = render_template("{taskId} {payload.nope} {bogus}", &event());
        assert_eq!(rendered, "TASK-2025-06-01-001 {payload.nope} {bogus}");
    }

    #[test]
    fn test_no_tokens_and_unterminated() {
        assert_eq!(render_template("plain text", &event()), "plain text");
        assert_eq!(render_template("dangling {taskId", &event()), "dangling {taskId");
        assert_eq!(render_template("{}", &event()), "{}");
    }
}
