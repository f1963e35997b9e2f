//! Markdown body conventions for task files.
//!
//! Agents and the protocol router append progress and completion records to
//! the task body under standardized headings; this module is the single
//! authority for that format.

use chrono::{DateTime, SecondsFormat, Utc};

/// Heading of the running progress section
pub const WORK_LOG_HEADING: &str = "## Work Log";
/// Heading for completion report summaries
pub const SUMMARY_HEADING: &str = "## Summary";
/// Heading for completion report deliverables
pub const DELIVERABLES_HEADING: &str = "## Deliverables";
/// Heading for completion test reports
pub const TEST_REPORT_HEADING: &str = "## Test Report";

/// Append one work-log line, creating the `## Work Log` section at the end
/// of the body when missing. Lines are `- <iso-timestamp> <kind>: <text>`.
pub fn append_work_log(body: &str, at: DateTime<Utc>, kind: &str, text: &str) -> String {
    let line = format!(
        "- {} {kind}: {text}",
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    append_to_section(body, WORK_LOG_HEADING, &line)
}

/// Append content under a heading, creating the section at the end of the
/// body when missing. Existing sections grow at their end, before the next
/// heading of the same or higher level.
pub fn append_to_section(body: &str, heading: &str, content: &str) -> String {
    match find_section_end(body, heading) {
        Some(insert_at) => {
            let mut out = String::with_capacity(body.len() + content.len() + 2);
            out.push_str(&body[..insert_at]);
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(content);
            out.push('\n');
            out.push_str(&body[insert_at..]);
            out
        }
        None => {
            let mut out = body.to_string();
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(heading);
            out.push('\n');
            out.push('\n');
            out.push_str(content);
            out.push('\n');
            out
        }
    }
}

/// Replace (or create) an entire section's content
pub fn set_section(body: &str, heading: &str, content: &str) -> String {
    match find_section_bounds(body, heading) {
        Some((start, end)) => {
            let mut out = String::with_capacity(body.len() + content.len());
            out.push_str(&body[..start]);
            out.push_str(heading);
            out.push('\n');
            out.push('\n');
            out.push_str(content);
            out.push('\n');
            out.push_str(&body[end..]);
            out
        }
        None => append_to_section(body, heading, content),
    }
}

/// Byte offset right after the last content line of the named section, i.e.
/// where new content should be inserted. `None` when the section is absent.
fn find_section_end(body: &str, heading: &str) -> Option<usize> {
    find_section_bounds(body, heading).map(|(_, end)| end)
}

/// (start of heading line, end of section content) byte offsets
fn find_section_bounds(body: &str, heading: &str) -> Option<(usize, usize)> {
    let level = heading.chars().take_while(|c| *c == '#').count();
    let mut offset = 0;
    let mut start = None;

    for line in body.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if start.is_none() {
            if trimmed == heading {
                start = Some(offset);
            }
        } else {
            let line_level = trimmed.chars().take_while(|c| *c == '#').count();
            if line_level > 0 && line_level <= level && trimmed.starts_with('#') {
                return Some((start.unwrap(), offset));
            }
        }
        offset += line.len();
    }

    start.map(|s| (s, body.len()))
}
