//! Realtime stream modules.
//!
//! - `client`: websocket transport, send path, heartbeat, and reconnect
//!   handling.
//! - `proto`: wire envelopes shared with the live API service.
//! - `event`: normalized inbound events and the payload normalizer.

/// Websocket connection, command sender, and worker state machine.
pub mod client;
/// Normalized server events and the inbound payload normalizer.
pub mod event;
/// Wire protocol envelopes.
pub mod proto;
