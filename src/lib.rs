//! Streaming client and relay for a realtime multimodal conversational API.
//!
//! The crate is organized by transport role:
//! - `stream`: realtime websocket client, wire protocol types, and the
//!   inbound payload normalizer.
//! - `relay`: per-connection websocket intermediary proxying frames to the
//!   real upstream endpoint.
//! - `backoff` / `heartbeat`: reconnect and liveness utilities shared by
//!   both sides.

/// Bounded exponential reconnect backoff policy.
pub mod backoff;
/// Liveness probe bookkeeping shared by the client and the relay.
pub mod heartbeat;
/// Websocket relay server.
pub mod relay;
/// Realtime stream client, protocol types, and event normalization.
pub mod stream;
