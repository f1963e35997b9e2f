//! Tolerant envelope extraction.
//!
//! Envelopes arrive wrapped in whatever the transport produced: an event
//! object carrying the envelope under `payload`, `message`, or `content`, a
//! bare JSON object, or a string in the canonical `AOF/1 <json>` text form.

use aof_core::{AofError, Result};

use crate::envelope::Envelope;

/// Text-form prefix of the canonical wire encoding
pub const WIRE_PREFIX: &str = "AOF/1 ";

/// Parse an envelope from text: an optional `AOF/1 ` prefix followed by
/// JSON, or a bare JSON object.
pub fn parse_envelope_str(text: &str) -> Result<Envelope> {
    let trimmed = text.trim();
    let json = trimmed.strip_prefix(WIRE_PREFIX).unwrap_or(trimmed);
    serde_json::from_str(json).map_err(|e| AofError::Parse(format!("envelope JSON: {e}")))
}

/// Parse an envelope from a JSON value that is either the envelope object
/// itself or a string carrying the text form.
pub fn parse_envelope_value(value: &serde_json::Value) -> Result<Envelope> {
    match value {
        serde_json::Value::String(text) => parse_envelope_str(text),
        serde_json::Value::Object(_) => serde_json::from_value(value.clone())
            .map_err(|e| AofError::Parse(format!("envelope JSON: {e}"))),
        other => Err(AofError::Parse(format!(
            "envelope must be an object or string, got {other}"
        ))),
    }
}

/// Extract an envelope from an inbound event shape, trying in order:
/// `event.payload`, `event.message`, `event.content`, then the event value
/// itself.
pub fn extract_envelope(event: &serde_json::Value) -> Result<Envelope> {
    let mut last_error = None;
    for key in ["payload", "message", "content"] {
        if let Some(candidate) = event.get(key) {
            match parse_envelope_value(candidate) {
                Ok(envelope) => return Ok(envelope),
                Err(e) => last_error = Some(e),
            }
        }
    }
    match parse_envelope_value(event) {
        Ok(envelope) => Ok(envelope),
        Err(e) => Err(last_error.unwrap_or(e)),
    }
}
