//! Normalized inbound events.
//!
//! The normalizer turns one raw wire frame into zero or more [`ServerEvent`]s.
//! Control probes are reported separately so the transport layer can answer
//! them without ever surfacing them to the application.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use tracing::warn;

use crate::stream::proto::{
    Candidate, FunctionCall, InboundFrame, Part, ProbeKind, ServerContent,
};

/// Unified, shape-independent representation of inbound content.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Incremental model text.
    TextDelta(String),
    /// Non-final transcription text from the candidate-list shape.
    PartialTranscript(String),
    /// Decoded inline media chunk.
    AudioDelta(AudioChunk),
    /// The producing side finished emitting for this turn.
    TurnComplete,
    /// The current model turn was interrupted.
    Interrupted,
    /// The session configuration was acknowledged.
    SetupComplete,
    /// The service requests tool invocations.
    ToolCall(Vec<FunctionCall>),
    /// Previously requested tool invocations were cancelled.
    ToolCallCancelled(Vec<String>),
    /// Upstream-reported error, passed through unmodified.
    Error(Value),
}

/// One decoded media chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Result of decoding one raw frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Liveness probe; answered by the transport, never surfaced.
    Control(ProbeKind),
    /// Application-facing events, in emission order.
    Events(Vec<ServerEvent>),
}

/// Failure to decode a raw frame. Degrades that frame only, never the
/// connection.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("binary frame is not valid utf-8")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("unrecognized payload shape: {0}")]
    Unrecognized(#[from] serde_json::Error),
}

/// Decodes one textual frame.
pub fn decode_text(text: &str) -> Result<Decoded, DecodeError> {
    let frame = InboundFrame::from_text(text)?;
    Ok(normalize(frame))
}

/// Decodes one binary frame carrying a UTF-8 encoded document.
pub fn decode_binary(bytes: &[u8]) -> Result<Decoded, DecodeError> {
    decode_text(std::str::from_utf8(bytes)?)
}

/// Maps a structurally decoded frame onto the normalized event stream.
pub fn normalize(frame: InboundFrame) -> Decoded {
    match frame {
        InboundFrame::Error(frame) => Decoded::Events(vec![ServerEvent::Error(frame.error)]),
        InboundFrame::Ping(frame) => Decoded::Control(ProbeKind::Ping(frame.ping)),
        InboundFrame::Pong(frame) => Decoded::Control(ProbeKind::Pong(frame.pong)),
        InboundFrame::ServerContent(frame) => {
            Decoded::Events(server_content_events(frame.server_content))
        }
        InboundFrame::Candidates(frame) => {
            Decoded::Events(candidate_events(frame.candidates.into_iter().next()))
        }
        InboundFrame::SimpleText(frame) => Decoded::Events(vec![
            ServerEvent::TextDelta(frame.text),
            ServerEvent::TurnComplete,
        ]),
        InboundFrame::SetupComplete(_) => Decoded::Events(vec![ServerEvent::SetupComplete]),
        InboundFrame::ToolCall(frame) => {
            Decoded::Events(vec![ServerEvent::ToolCall(frame.tool_call.function_calls)])
        }
        InboundFrame::ToolCallCancellation(frame) => Decoded::Events(vec![
            ServerEvent::ToolCallCancelled(frame.tool_call_cancellation.ids),
        ]),
    }
}

/// Expands a server-content envelope: concatenated text first, then media
/// chunks in arrival order, then any turn markers from the same frame.
fn server_content_events(content: ServerContent) -> Vec<ServerEvent> {
    let mut events = Vec::new();

    let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
    push_part_events(&mut events, &parts, false);

    if content.interrupted {
        events.push(ServerEvent::Interrupted);
    }
    if content.turn_complete {
        events.push(ServerEvent::TurnComplete);
    }
    events
}

/// Expands the candidate-list envelope. Only the first candidate is
/// inspected; whether its text is final is a best-effort finish-reason
/// heuristic and deliberately nothing stronger.
fn candidate_events(candidate: Option<Candidate>) -> Vec<ServerEvent> {
    let Some(candidate) = candidate else {
        return Vec::new();
    };

    let is_final = candidate
        .finish_reason
        .as_deref()
        .is_some_and(|reason| !reason.is_empty() && !reason.to_ascii_uppercase().ends_with("UNSPECIFIED"));

    let mut events = Vec::new();
    let parts = candidate.content.map(|content| content.parts).unwrap_or_default();
    push_part_events(&mut events, &parts, !is_final);

    if is_final {
        events.push(ServerEvent::TurnComplete);
    }
    events
}

fn push_part_events(events: &mut Vec<ServerEvent>, parts: &[Part], partial_text: bool) {
    let text: String = parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect();
    if !text.is_empty() {
        events.push(if partial_text {
            ServerEvent::PartialTranscript(text)
        } else {
            ServerEvent::TextDelta(text)
        });
    }

    for part in parts {
        let Some(blob) = &part.inline_data else {
            continue;
        };
        match BASE64.decode(&blob.data) {
            Ok(data) => events.push(ServerEvent::AudioDelta(AudioChunk {
                mime_type: blob.mime_type.clone(),
                data,
            })),
            Err(err) => {
                warn!(
                    event = "media_decode_failed",
                    mime_type = %blob.mime_type,
                    error = %err,
                );
            }
        }
    }
}
