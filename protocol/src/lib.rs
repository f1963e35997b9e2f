//! The AOF/1 agent protocol: envelope schema, tolerant parsing, and the
//! router that validates, authorizes, and applies agent messages as status
//! machine transitions.
//!
//! Wire transport is agnostic: anything that can deliver the envelope text
//! (`AOF/1 <json>` or bare JSON) or an event object wrapping it can feed
//! [`ProtocolRouter::route_value`].

pub mod envelope;
pub mod parse;
pub mod router;

pub use envelope::{
    CompletionOutcome, CompletionReport, Envelope, HandoffAccepted, HandoffRejected,
    HandoffRequest, MessagePayload, StatusUpdate, TestReport, PROTOCOL_NAME, PROTOCOL_VERSION,
};
pub use parse::{extract_envelope, parse_envelope_str, parse_envelope_value};
pub use router::{ProtocolRouter, RouteOutcome};
