//! Wire protocol envelopes.
//!
//! Every frame on the wire is a JSON document whose outermost key identifies
//! the payload kind. Outbound frames are externally tagged ([`ClientFrame`]).
//! Inbound frames arrive in several historically incompatible shapes, so
//! [`InboundFrame`] is an untagged enum whose variant order is the shape
//! detection priority: cheap, specific markers (error, control probes) are
//! tried before the structural content envelopes, and the two content shapes
//! before the simplified fallbacks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session configuration sent as the first frame of every connection.
///
/// Immutable after construction; the client re-sends it verbatim inside
/// `{"setup": …}` on every successful (re)connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Model identifier understood by the upstream service.
    pub model: String,
    /// Opaque generation parameters forwarded to the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<Value>,
    /// Opaque system instruction forwarded to the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Value>,
    /// Tool declarations forwarded to the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
}

impl SessionConfig {
    /// Minimal configuration for the given model.
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            generation_config: None,
            system_instruction: None,
            tools: None,
        }
    }
}

/// One content part: either text or inline base64 media.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    /// Text-only part.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }
}

/// Base64 media payload tagged with its MIME type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64-encoded payload bytes.
    pub data: String,
}

/// One conversational turn attributed to a role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub role: String,
    pub parts: Vec<Part>,
}

/// User turn content with an explicit end-of-turn flag.
///
/// When `turn_complete` is false the peer holds the turn open and waits for
/// more input before responding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Turn>,
    pub turn_complete: bool,
}

/// Realtime media input carrying one or more chunks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Tool execution results keyed by the originating call identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// One tool result on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    pub id: String,
    pub response: Value,
}

/// Liveness probe payload; the optional timestamp is echoed in the reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_ms: Option<u64>,
}

/// Outbound client-to-server frame.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientFrame {
    Setup(SessionConfig),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
    Ping(Probe),
    Pong(Probe),
}

impl ClientFrame {
    /// Composes a user text turn with an explicit end-of-turn flag.
    pub fn user_text(text: impl Into<String>, turn_complete: bool) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Turn {
                role: "user".to_string(),
                parts: vec![Part::text(text)],
            }],
            turn_complete,
        })
    }

    /// Composes a single media chunk from an already base64-encoded payload.
    pub fn media_chunk(mime_type: impl Into<String>, data_b64: impl Into<String>) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: mime_type.into(),
                data: data_b64.into(),
            }],
        })
    }

    /// Composes a liveness probe.
    pub fn ping(at_ms: Option<u64>) -> Self {
        Self::Ping(Probe { at_ms })
    }

    /// Composes a probe acknowledgment.
    pub fn pong(at_ms: Option<u64>) -> Self {
        Self::Pong(Probe { at_ms })
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Inbound server-to-client frame, decoded by shape priority.
///
/// Variant order is load-bearing: serde tries untagged variants top to
/// bottom and stops at the first structural match.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InboundFrame {
    Error(ErrorFrame),
    Ping(PingFrame),
    Pong(PongFrame),
    ServerContent(ServerContentFrame),
    Candidates(CandidatesFrame),
    SimpleText(SimpleTextFrame),
    SetupComplete(SetupCompleteFrame),
    ToolCall(ToolCallFrame),
    ToolCallCancellation(ToolCallCancellationFrame),
}

impl InboundFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Upstream error envelope; the payload is passed through unmodified.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErrorFrame {
    pub error: Value,
}

/// Peer-initiated liveness probe.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PingFrame {
    pub ping: Probe,
}

/// Acknowledgment of one of our probes.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PongFrame {
    pub pong: Probe,
}

/// Nested turn-content envelope.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerContentFrame {
    pub server_content: ServerContent,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// Alternate candidate-list envelope the upstream has emitted historically.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CandidatesFrame {
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<CandidateContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// Simplified single-text envelope.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SimpleTextFrame {
    pub text: String,
}

/// Acknowledgment of the session configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetupCompleteFrame {
    pub setup_complete: Value,
}

/// Tool invocation request from the service.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallFrame {
    pub tool_call: ToolCall,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

/// One requested tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Cancellation of previously issued tool invocations.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallCancellationFrame {
    pub tool_call_cancellation: ToolCallCancellation,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

/// Liveness probe classification used by the relay pass-through path.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeKind {
    Ping(Probe),
    Pong(Probe),
}

/// Classifies a text frame as a liveness probe without a full decode.
pub fn probe_kind(text: &str) -> Option<ProbeKind> {
    if let Ok(frame) = serde_json::from_str::<PingFrame>(text) {
        return Some(ProbeKind::Ping(frame.ping));
    }
    if let Ok(frame) = serde_json::from_str::<PongFrame>(text) {
        return Some(ProbeKind::Pong(frame.pong));
    }
    None
}
