//! Canonical task file codec: `---\n<YAML frontmatter>\n---\n<markdown body>`.
//!
//! YAML is canonical and re-emitted on every update; key order follows the
//! [`Task`] struct declaration, so serializing a parsed file reproduces it
//! byte for byte once it has been written by this codec.

use aof_core::{AofError, Result, Task};

const DELIMITER: &str = "---";

/// Render a task to its on-disk text form
pub fn render(task: &Task) -> Result<String> {
    let yaml =
        serde_yaml::to_string(task).map_err(|e| AofError::Serialization(e.to_string()))?;
    let mut out = String::with_capacity(yaml.len() + task.body.len() + 16);
    out.push_str(DELIMITER);
    out.push('\n');
    out.push_str(&yaml);
    if !yaml.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(DELIMITER);
    out.push('\n');
    out.push_str(&task.body);
    Ok(out)
}

/// Parse the on-disk text form back into a task
pub fn parse(text: &str) -> Result<Task> {
    let rest = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
        .ok_or_else(|| {
            AofError::Serialization("task file does not start with a frontmatter block".to_string())
        })?;

    let (yaml, body) = split_at_closing_delimiter(rest).ok_or_else(|| {
        AofError::Serialization("unterminated frontmatter block".to_string())
    })?;

    let mut task: Task =
        serde_yaml::from_str(yaml).map_err(|e| AofError::Serialization(e.to_string()))?;
    task.body = body.to_string();
    Ok(task)
}

/// Find the `\n---\n` closing delimiter and split into (yaml, body).
/// The body starts immediately after the delimiter line.
fn split_at_closing_delimiter(rest: &str) -> Option<(&str, &str)> {
    // A file may legally end right at the closing delimiter (empty body)
    for (idx, _) in rest.match_indices(DELIMITER) {
        let at_line_start = idx == 0 || rest.as_bytes()[idx - 1] == b'\n';
        if !at_line_start {
            continue;
        }
        let after = &rest[idx + DELIMITER.len()..];
        if after.is_empty() {
            return Some((&rest[..idx], ""));
        }
        if let Some(body) = after.strip_prefix('\n') {
            return Some((&rest[..idx], body));
        }
        if let Some(body) = after.strip_prefix("\r\n") {
            return Some((&rest[..idx], body));
        }
    }
    None
}
