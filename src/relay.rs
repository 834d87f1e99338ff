//! Websocket relay server.
//!
//! Each accepted connection gets a matching outbound connection to the real
//! upstream endpoint; the original request path and query (credential
//! included) are forwarded unchanged, only the scheme/authority is rewritten.
//! Frames queue while the upstream leg is still opening, then the session
//! settles into pass-through. Liveness probes are intercepted and answered
//! locally on the leg they arrived on, so the relay counts as a live peer to
//! both sides, and an independent per-session timer probes whichever leg has
//! gone silent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{
    CloseFrame as PeerCloseFrame, Message as PeerMessage, WebSocket, WebSocketUpgrade,
};
use axum::extract::State;
use axum::http::Uri;
use axum::response::Response;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::heartbeat::{Heartbeat, DEFAULT_HEARTBEAT_INTERVAL};
use crate::stream::proto::{probe_kind, ClientFrame, Probe, ProbeKind};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay configuration shared by all sessions.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Scheme and authority of the real upstream endpoint, e.g.
    /// `wss://live.example`. Path and query come from each inbound request.
    pub upstream: String,
    /// Liveness check interval applied independently to both legs.
    pub heartbeat_interval: Duration,
}

impl RelayConfig {
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into().trim_end_matches('/').to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Sets the liveness check interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Builds the relay router. Every path upgrades; requests without a
/// websocket upgrade are rejected by the extractor with a 4xx response.
pub fn router(config: RelayConfig) -> Router {
    Router::new()
        .fallback(upgrade_handler)
        .with_state(Arc::new(config))
}

/// Serves the relay on an already-bound listener.
pub async fn serve(listener: TcpListener, config: RelayConfig) -> std::io::Result<()> {
    axum::serve(listener, router(config)).await
}

async fn upgrade_handler(
    State(config): State<Arc<RelayConfig>>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |peer| relay_session(peer, config, uri))
}

fn upstream_url(base: &str, uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{base}{path_and_query}")
}

async fn relay_session(mut peer: WebSocket, config: Arc<RelayConfig>, uri: Uri) {
    let target = upstream_url(&config.upstream, &uri);
    info!(event = "relay_session_opened", path = %uri.path());

    let mut pending: VecDeque<UpstreamMessage> = VecDeque::new();
    let connect = connect_async(target);
    tokio::pin!(connect);

    // Dial upstream while already accepting peer frames; they queue in
    // arrival order until the upstream leg opens.
    let mut upstream: UpstreamSocket = loop {
        tokio::select! {
            connected = &mut connect => match connected {
                Ok((socket, _)) => break socket,
                Err(err) => {
                    warn!(event = "upstream_connect_failed", error = %err);
                    let _ = peer
                        .send(PeerMessage::Close(Some(peer_close(1011, "upstream connect failed"))))
                        .await;
                    return;
                }
            },
            inbound = peer.recv() => match inbound {
                None | Some(Err(_)) | Some(Ok(PeerMessage::Close(_))) => {
                    debug!(event = "peer_closed_before_upstream_open");
                    return;
                }
                Some(Ok(PeerMessage::Text(text))) => match probe_kind(text.as_str()) {
                    Some(ProbeKind::Ping(probe)) => {
                        if answer_peer_probe(&mut peer, probe).await.is_err() {
                            return;
                        }
                    }
                    Some(ProbeKind::Pong(_)) => {}
                    None => pending.push_back(UpstreamMessage::Text(text.as_str().into())),
                },
                Some(Ok(PeerMessage::Binary(bytes))) => {
                    pending.push_back(UpstreamMessage::Binary(bytes));
                }
                Some(Ok(_)) => {}
            }
        }
    };

    while let Some(frame) = pending.pop_front() {
        if upstream.send(frame).await.is_err() {
            warn!(event = "upstream_flush_failed");
            let _ = peer
                .send(PeerMessage::Close(Some(peer_close(1011, "upstream connection lost"))))
                .await;
            return;
        }
    }

    pump(peer, upstream, config.heartbeat_interval).await;
    info!(event = "relay_session_closed");
}

/// Bidirectional pass-through with probe interception and a per-session
/// liveness timer. Closing either leg always closes the other.
async fn pump(mut peer: WebSocket, mut upstream: UpstreamSocket, interval: Duration) {
    let started = Instant::now();
    let mut peer_hb = Heartbeat::new(interval, started);
    let mut upstream_hb = Heartbeat::new(interval, started);
    let mut ticker = tokio::time::interval_at(started + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            inbound = peer.recv() => match inbound {
                None | Some(Err(_)) => {
                    let _ = upstream
                        .close(Some(upstream_close(1011, "peer connection lost")))
                        .await;
                    return;
                }
                Some(Ok(message)) => {
                    peer_hb.note_inbound(Instant::now());
                    match message {
                        PeerMessage::Close(frame) => {
                            debug!(event = "peer_closed", frame = ?frame);
                            let _ = upstream.close(frame.map(close_to_upstream)).await;
                            return;
                        }
                        PeerMessage::Text(text) => match probe_kind(text.as_str()) {
                            Some(ProbeKind::Ping(probe)) => {
                                if answer_peer_probe(&mut peer, probe).await.is_err() {
                                    let _ = upstream
                                        .close(Some(upstream_close(1011, "peer connection lost")))
                                        .await;
                                    return;
                                }
                            }
                            Some(ProbeKind::Pong(_)) => {}
                            None => {
                                if upstream
                                    .send(UpstreamMessage::Text(text.as_str().into()))
                                    .await
                                    .is_err()
                                {
                                    let _ = peer
                                        .send(PeerMessage::Close(Some(peer_close(
                                            1011,
                                            "upstream connection lost",
                                        ))))
                                        .await;
                                    return;
                                }
                            }
                        },
                        PeerMessage::Binary(bytes) => {
                            if upstream.send(UpstreamMessage::Binary(bytes)).await.is_err() {
                                let _ = peer
                                    .send(PeerMessage::Close(Some(peer_close(
                                        1011,
                                        "upstream connection lost",
                                    ))))
                                    .await;
                                return;
                            }
                        }
                        // Transport-level ping/pong is answered by the stack.
                        PeerMessage::Ping(_) | PeerMessage::Pong(_) => {}
                    }
                }
            },
            inbound = upstream.next() => match inbound {
                None | Some(Err(_)) => {
                    let _ = peer
                        .send(PeerMessage::Close(Some(peer_close(1011, "upstream connection lost"))))
                        .await;
                    return;
                }
                Some(Ok(message)) => {
                    upstream_hb.note_inbound(Instant::now());
                    match message {
                        UpstreamMessage::Close(frame) => {
                            debug!(event = "upstream_closed", frame = ?frame);
                            let _ = peer.send(PeerMessage::Close(frame.map(close_to_peer))).await;
                            return;
                        }
                        UpstreamMessage::Text(text) => match probe_kind(text.as_str()) {
                            Some(ProbeKind::Ping(probe)) => {
                                if answer_upstream_probe(&mut upstream, probe).await.is_err() {
                                    let _ = peer
                                        .send(PeerMessage::Close(Some(peer_close(
                                            1011,
                                            "upstream connection lost",
                                        ))))
                                        .await;
                                    return;
                                }
                            }
                            Some(ProbeKind::Pong(_)) => {}
                            None => {
                                if peer
                                    .send(PeerMessage::Text(text.as_str().into()))
                                    .await
                                    .is_err()
                                {
                                    let _ = upstream
                                        .close(Some(upstream_close(1011, "peer connection lost")))
                                        .await;
                                    return;
                                }
                            }
                        },
                        UpstreamMessage::Binary(bytes) => {
                            if peer.send(PeerMessage::Binary(bytes)).await.is_err() {
                                let _ = upstream
                                    .close(Some(upstream_close(1011, "peer connection lost")))
                                    .await;
                                return;
                            }
                        }
                        UpstreamMessage::Ping(payload) => {
                            let _ = upstream.send(UpstreamMessage::Pong(payload)).await;
                        }
                        UpstreamMessage::Pong(_) => {}
                        _ => {}
                    }
                }
            },
            _ = ticker.tick() => {
                let now = Instant::now();
                if peer_hb.probe_due(now) {
                    if let Ok(text) = ClientFrame::ping(None).to_text() {
                        if peer.send(PeerMessage::Text(text.into())).await.is_err() {
                            let _ = upstream
                                .close(Some(upstream_close(1011, "peer connection lost")))
                                .await;
                            return;
                        }
                    }
                    peer_hb.mark_probe(now);
                }
                if upstream_hb.probe_due(now) {
                    if let Ok(text) = ClientFrame::ping(None).to_text() {
                        if upstream.send(UpstreamMessage::Text(text.into())).await.is_err() {
                            let _ = peer
                                .send(PeerMessage::Close(Some(peer_close(
                                    1011,
                                    "upstream connection lost",
                                ))))
                                .await;
                            return;
                        }
                    }
                    upstream_hb.mark_probe(now);
                }
            }
        }
    }
}

async fn answer_peer_probe(peer: &mut WebSocket, probe: Probe) -> Result<(), ()> {
    let Ok(text) = ClientFrame::Pong(probe).to_text() else {
        return Ok(());
    };
    peer.send(PeerMessage::Text(text.into())).await.map_err(|_| ())
}

async fn answer_upstream_probe(upstream: &mut UpstreamSocket, probe: Probe) -> Result<(), ()> {
    let Ok(text) = ClientFrame::Pong(probe).to_text() else {
        return Ok(());
    };
    upstream
        .send(UpstreamMessage::Text(text.into()))
        .await
        .map_err(|_| ())
}

fn close_to_upstream(frame: PeerCloseFrame) -> UpstreamCloseFrame {
    UpstreamCloseFrame {
        code: CloseCode::from(frame.code),
        reason: frame.reason.as_str().into(),
    }
}

fn close_to_peer(frame: UpstreamCloseFrame) -> PeerCloseFrame {
    PeerCloseFrame {
        code: frame.code.into(),
        reason: frame.reason.as_str().into(),
    }
}

fn peer_close(code: u16, reason: &str) -> PeerCloseFrame {
    PeerCloseFrame {
        code,
        reason: reason.into(),
    }
}

fn upstream_close(code: u16, reason: &str) -> UpstreamCloseFrame {
    UpstreamCloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }
}
