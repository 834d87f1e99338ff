//! Low-level live websocket client and outbound command sender.
//!
//! The client spawns a background worker that owns the websocket and the
//! whole connection lifecycle: connect timeout, setup handshake, heartbeat,
//! inbound normalization, and automatic reconnects with bounded backoff.
//! Application code talks to the worker through a cloneable [`LiveSender`]
//! and receives [`ServerEvent`]s and [`ConnectionStatus`] notifications over
//! channels.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::heartbeat::{Heartbeat, DEFAULT_HEARTBEAT_INTERVAL};
use crate::stream::event::{decode_binary, decode_text, Decoded, DecodeError, ServerEvent};
use crate::stream::proto::{
    ClientFrame, FunctionResponse, ProbeKind, SessionConfig, ToolResponse,
};

/// Default timeout for one transport-open attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Entry point for creating live connections.
#[derive(Clone)]
pub struct LiveClient {
    endpoint: String,
    api_key: SecretString,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    reconnect: ReconnectPolicy,
}

impl LiveClient {
    /// Creates a client for the given websocket endpoint and credential.
    pub fn new(endpoint: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            endpoint: endpoint.into().trim_end().to_string(),
            api_key,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Sets the transport-open timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the liveness check interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the reconnect backoff policy.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Opens a configured live connection.
    ///
    /// This spawns a background worker that owns the websocket and returns a
    /// handle pair for sending frames and receiving normalized events. The
    /// session configuration is transmitted as the first frame of this and
    /// every later (re)connection.
    pub async fn connect(&self, config: SessionConfig) -> Result<LiveConnection, LiveError> {
        if self.api_key.expose_secret().trim().is_empty() {
            return Err(LiveError::MissingCredential);
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = ConnectionWorker {
            url: credentialed_url(&self.endpoint, &self.api_key),
            setup: config,
            connect_timeout: self.connect_timeout,
            heartbeat_interval: self.heartbeat_interval,
            reconnect: self.reconnect.clone(),
            cmd_rx,
            events_tx,
            status_tx,
            state_tx,
        };
        tokio::spawn(worker.run(ready_tx));

        let sender = LiveSender { cmd_tx, state_rx };
        match ready_rx.await {
            Ok(Ok(())) => Ok(LiveConnection {
                sender,
                events: events_rx,
                status: status_rx,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(LiveError::Protocol(
                "connection worker stopped before initial connect".to_string(),
            )),
        }
    }
}

/// Connection lifecycle state, observable through [`LiveSender`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

/// Lifecycle notifications produced by the connection worker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    ReconnectFailed,
    /// Transport-level failure, always followed by the teardown or retry
    /// notifications it caused.
    Error { message: String },
}

/// Active live connection channels.
///
/// Events and statuses are produced by the background websocket worker.
#[derive(Debug)]
pub struct LiveConnection {
    sender: LiveSender,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    status: mpsc::UnboundedReceiver<ConnectionStatus>,
}

impl LiveConnection {
    /// Returns a cloneable sender for outbound frames.
    pub fn sender(&self) -> LiveSender {
        self.sender.clone()
    }

    /// Whether the connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.sender.is_connected()
    }

    /// Receives the next normalized server event.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Receives the next lifecycle notification.
    pub async fn recv_status(&mut self) -> Option<ConnectionStatus> {
        self.status.recv().await
    }

    /// Splits into sender and normalized event receiver.
    pub fn split(self) -> (LiveSender, mpsc::UnboundedReceiver<ServerEvent>) {
        (self.sender, self.events)
    }

    /// Splits into sender, event receiver, and lifecycle receiver.
    pub fn split_with_status(
        self,
    ) -> (
        LiveSender,
        mpsc::UnboundedReceiver<ServerEvent>,
        mpsc::UnboundedReceiver<ConnectionStatus>,
    ) {
        (self.sender, self.events, self.status)
    }
}

/// Tool execution result to report back to the service.
///
/// Carries the originating call identifier and exactly one of an output
/// value or an error string.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub id: String,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ToolResult {
    /// Successful result for the given call.
    pub fn ok(id: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            output: Some(output),
            error: None,
        }
    }

    /// Failed result for the given call.
    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Cloneable sender for outbound frames and lifecycle commands.
#[derive(Clone, Debug)]
pub struct LiveSender {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl LiveSender {
    /// Requests a connection and awaits the in-flight outcome.
    ///
    /// A no-op returning success if the connection is already open.
    pub async fn connect(&self) -> Result<(), LiveError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect { done: done_tx })
            .map_err(|_| LiveError::WorkerStopped)?;
        done_rx.await.map_err(|_| LiveError::WorkerStopped)?
    }

    /// Closes the connection without reconnection. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    /// Whether the connection is currently open.
    pub fn is_connected(&self) -> bool {
        *self.state_rx.borrow() == ConnectionState::Open
    }

    /// Sends a user text turn with an explicit end-of-turn flag.
    pub async fn send_text(
        &self,
        text: impl Into<String>,
        end_of_turn: bool,
    ) -> Result<(), LiveError> {
        self.send_frame(ClientFrame::user_text(text, end_of_turn)).await
    }

    /// Sends one base64-encoded media chunk tagged with its MIME type.
    pub async fn send_media_chunk(
        &self,
        mime_type: impl Into<String>,
        data_b64: impl Into<String>,
    ) -> Result<(), LiveError> {
        self.send_frame(ClientFrame::media_chunk(mime_type, data_b64)).await
    }

    /// Reports a tool execution result.
    ///
    /// Fails before any transmission attempt if the result lacks a call id
    /// or does not carry exactly one of output and error.
    pub async fn send_tool_result(&self, result: ToolResult) -> Result<(), LiveError> {
        self.send_frame(tool_response_frame(result)?).await
    }

    /// Sends a raw outbound frame.
    ///
    /// If the connection is not open this first drives a connect attempt and
    /// awaits its outcome; when the connection still cannot be opened the
    /// send fails rather than queuing silently.
    pub async fn send_frame(&self, frame: ClientFrame) -> Result<(), LiveError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                frame,
                done: done_tx,
            })
            .map_err(|_| LiveError::WorkerStopped)?;
        done_rx.await.map_err(|_| LiveError::WorkerStopped)?
    }
}

/// Errors produced by live transport and protocol handling.
#[derive(Debug, Error)]
pub enum LiveError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// No credential was configured.
    #[error("api key is missing")]
    MissingCredential,

    /// The transport did not open within the configured timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A send was attempted and the connection could not be opened.
    #[error("connection is not open")]
    NotConnected,

    /// The background worker is gone.
    #[error("connection worker stopped")]
    WorkerStopped,

    /// Malformed tool result, rejected before transmission.
    #[error("invalid tool result: {0}")]
    InvalidToolResult(String),

    /// Live protocol contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub(crate) fn tool_response_frame(result: ToolResult) -> Result<ClientFrame, LiveError> {
    if result.id.trim().is_empty() {
        return Err(LiveError::InvalidToolResult(
            "missing originating call id".to_string(),
        ));
    }
    let response = match (result.output, result.error) {
        (Some(output), None) => json!({ "output": output }),
        (None, Some(error)) => json!({ "error": error }),
        (Some(_), Some(_)) => {
            return Err(LiveError::InvalidToolResult(
                "carries both output and error".to_string(),
            ))
        }
        (None, None) => {
            return Err(LiveError::InvalidToolResult(
                "carries neither output nor error".to_string(),
            ))
        }
    };
    Ok(ClientFrame::ToolResponse(ToolResponse {
        function_responses: vec![FunctionResponse {
            id: result.id,
            response,
        }],
    }))
}

fn credentialed_url(endpoint: &str, api_key: &SecretString) -> String {
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!("{endpoint}{separator}key={}", api_key.expose_secret())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Close codes that count as a clean remote closure.
fn is_clean_close(frame: &Option<CloseFrame>) -> bool {
    match frame {
        Some(frame) => matches!(frame.code, CloseCode::Normal | CloseCode::Away),
        // No status received; do not fight a peer that closed on purpose.
        None => true,
    }
}

enum Command {
    Connect {
        done: oneshot::Sender<Result<(), LiveError>>,
    },
    Send {
        frame: ClientFrame,
        done: oneshot::Sender<Result<(), LiveError>>,
    },
    Disconnect,
}

type Waiter = oneshot::Sender<Result<(), LiveError>>;
type ParkedSend = (ClientFrame, Waiter);

enum SessionEnd {
    Clean,
    Abnormal,
    Shutdown,
}

enum DialEnd {
    Opened(WsSocket),
    Failed(LiveError),
    Disconnected,
    Shutdown,
}

enum WaitEnd {
    Elapsed,
    Disconnected,
    Shutdown,
}

enum IdleNext {
    Wanted {
        waiters: Vec<Waiter>,
        parked: VecDeque<ParkedSend>,
    },
    Shutdown,
}

struct ConnectionWorker {
    url: String,
    setup: SessionConfig,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    reconnect: ReconnectPolicy,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    status_tx: mpsc::UnboundedSender<ConnectionStatus>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionWorker {
    async fn run(mut self, ready: Waiter) {
        let mut waiters: Vec<Waiter> = vec![ready];
        let mut parked: VecDeque<ParkedSend> = VecDeque::new();

        'lifecycle: loop {
            // One explicit connect attempt for the current waiters. A failed
            // explicit attempt is reported and not retried automatically.
            self.set_state(ConnectionState::Connecting);
            self.notify(ConnectionStatus::Connecting);
            let mut socket = match self.dial(&mut waiters, &mut parked).await {
                DialEnd::Opened(socket) => socket,
                DialEnd::Failed(err) => {
                    debug!(event = "connect_failed", error = %err);
                    self.notify_error(&err);
                    fail_pending(&mut waiters, &mut parked, err);
                    self.set_state(ConnectionState::Closed);
                    self.notify(ConnectionStatus::Disconnected);
                    match self.idle_wait().await {
                        IdleNext::Wanted {
                            waiters: next_waiters,
                            parked: next_parked,
                        } => {
                            waiters = next_waiters;
                            parked = next_parked;
                            continue 'lifecycle;
                        }
                        IdleNext::Shutdown => return,
                    }
                }
                DialEnd::Disconnected => {
                    debug!(event = "connect_cancelled");
                    fail_pending(&mut waiters, &mut parked, LiveError::NotConnected);
                    self.set_state(ConnectionState::Closed);
                    self.notify(ConnectionStatus::Disconnected);
                    match self.idle_wait().await {
                        IdleNext::Wanted {
                            waiters: next_waiters,
                            parked: next_parked,
                        } => {
                            waiters = next_waiters;
                            parked = next_parked;
                            continue 'lifecycle;
                        }
                        IdleNext::Shutdown => return,
                    }
                }
                DialEnd::Shutdown => return,
            };

            'session: loop {
                self.set_state(ConnectionState::Open);
                self.notify(ConnectionStatus::Connected);
                info!(event = "connected");
                for done in waiters.drain(..) {
                    let _ = done.send(Ok(()));
                }

                match self.open_loop(&mut socket, &mut parked).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Clean => {
                        self.set_state(ConnectionState::Closed);
                        self.notify(ConnectionStatus::Disconnected);
                        info!(event = "disconnected");
                        fail_pending(&mut waiters, &mut parked, LiveError::NotConnected);
                        break 'session;
                    }
                    SessionEnd::Abnormal => {
                        warn!(event = "connection_lost");
                        self.set_state(ConnectionState::Closed);
                        self.notify(ConnectionStatus::Disconnected);

                        let mut attempt = 0u32;
                        loop {
                            attempt += 1;
                            if !self.reconnect.allows_attempt(attempt) {
                                warn!(event = "reconnect_exhausted", attempts = attempt - 1);
                                self.notify(ConnectionStatus::ReconnectFailed);
                                self.set_state(ConnectionState::Closed);
                                fail_pending(&mut waiters, &mut parked, LiveError::NotConnected);
                                break 'session;
                            }

                            let delay = self.reconnect.delay_for_attempt(attempt);
                            self.set_state(ConnectionState::Reconnecting);
                            self.notify(ConnectionStatus::Reconnecting { attempt, delay });
                            debug!(
                                event = "reconnect_scheduled",
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                            );
                            match self.wait_backoff(delay, &mut waiters, &mut parked).await {
                                WaitEnd::Elapsed => {}
                                WaitEnd::Disconnected => {
                                    self.set_state(ConnectionState::Closed);
                                    self.notify(ConnectionStatus::Disconnected);
                                    fail_pending(&mut waiters, &mut parked, LiveError::NotConnected);
                                    break 'session;
                                }
                                WaitEnd::Shutdown => return,
                            }

                            match self.dial(&mut waiters, &mut parked).await {
                                DialEnd::Opened(next_socket) => {
                                    socket = next_socket;
                                    continue 'session;
                                }
                                DialEnd::Failed(err) => {
                                    debug!(
                                        event = "reconnect_attempt_failed",
                                        attempt,
                                        error = %err,
                                    );
                                    self.notify_error(&err);
                                    // Senders that awaited this attempt learn
                                    // the outcome now instead of blocking on
                                    // the whole budget.
                                    fail_pending(&mut waiters, &mut parked, err);
                                }
                                DialEnd::Disconnected => {
                                    self.set_state(ConnectionState::Closed);
                                    self.notify(ConnectionStatus::Disconnected);
                                    fail_pending(&mut waiters, &mut parked, LiveError::NotConnected);
                                    break 'session;
                                }
                                DialEnd::Shutdown => return,
                            }
                        }
                    }
                }
            }

            match self.idle_wait().await {
                IdleNext::Wanted {
                    waiters: next_waiters,
                    parked: next_parked,
                } => {
                    waiters = next_waiters;
                    parked = next_parked;
                }
                IdleNext::Shutdown => return,
            }
        }
    }

    /// One transport-open attempt that keeps servicing commands.
    ///
    /// Connect requests arriving mid-dial attach to the in-flight outcome,
    /// sends park for the post-open flush, and a disconnect aborts the dial
    /// immediately instead of queuing behind the connect timeout.
    async fn dial(
        &mut self,
        waiters: &mut Vec<Waiter>,
        parked: &mut VecDeque<ParkedSend>,
    ) -> DialEnd {
        let attempt = open_socket(self.url.clone(), self.setup.clone(), self.connect_timeout);
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                outcome = &mut attempt => return match outcome {
                    Ok(socket) => DialEnd::Opened(socket),
                    Err(err) => DialEnd::Failed(err),
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return DialEnd::Shutdown,
                    Some(Command::Disconnect) => return DialEnd::Disconnected,
                    Some(Command::Connect { done }) => waiters.push(done),
                    Some(Command::Send { frame, done }) => parked.push_back((frame, done)),
                }
            }
        }
    }

    /// Serves one open connection until it ends.
    ///
    /// Flushes frames parked while the connection was down first, in FIFO
    /// order, then multiplexes outbound commands, inbound frames, and the
    /// heartbeat.
    async fn open_loop(&mut self, socket: &mut WsSocket, parked: &mut VecDeque<ParkedSend>) -> SessionEnd {
        while let Some((frame, done)) = parked.pop_front() {
            match send_frame(socket, &frame).await {
                Ok(()) => {
                    let _ = done.send(Ok(()));
                }
                Err(err) => {
                    self.notify_error(&err);
                    let _ = done.send(Err(err));
                    return SessionEnd::Abnormal;
                }
            }
        }

        let mut heartbeat = Heartbeat::new(self.heartbeat_interval, Instant::now());
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None => {
                        let _ = socket.close(None).await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Command::Disconnect) => {
                        let _ = socket.close(None).await;
                        return SessionEnd::Clean;
                    }
                    Some(Command::Connect { done }) => {
                        let _ = done.send(Ok(()));
                    }
                    Some(Command::Send { frame, done }) => {
                        match send_frame(socket, &frame).await {
                            Ok(()) => {
                                let _ = done.send(Ok(()));
                            }
                            Err(err) => {
                                self.notify_error(&err);
                                let _ = done.send(Err(err));
                                return SessionEnd::Abnormal;
                            }
                        }
                    }
                },
                inbound = socket.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat.note_inbound(Instant::now());
                        if self.dispatch(socket, decode_text(text.as_str())).await.is_err() {
                            return SessionEnd::Abnormal;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        heartbeat.note_inbound(Instant::now());
                        if self.dispatch(socket, decode_binary(&bytes)).await.is_err() {
                            return SessionEnd::Abnormal;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        heartbeat.note_inbound(Instant::now());
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            self.notify_error(&LiveError::WebSocket(err));
                            return SessionEnd::Abnormal;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        heartbeat.note_inbound(Instant::now());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if is_clean_close(&frame) {
                            return SessionEnd::Clean;
                        }
                        self.notify_error(&LiveError::Protocol(format!(
                            "peer closed abnormally: {frame:?}"
                        )));
                        return SessionEnd::Abnormal;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "transport_error", error = %err);
                        self.notify_error(&LiveError::WebSocket(err));
                        return SessionEnd::Abnormal;
                    }
                    None => {
                        self.notify_error(&LiveError::Protocol(
                            "connection ended without a close handshake".to_string(),
                        ));
                        return SessionEnd::Abnormal;
                    }
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if heartbeat.probe_due(now) {
                        if let Err(err) = send_frame(socket, &ClientFrame::ping(Some(now_ms()))).await {
                            self.notify_error(&err);
                            return SessionEnd::Abnormal;
                        }
                        heartbeat.mark_probe(now);
                    }
                }
            }
        }
    }

    /// Routes one decoded frame: probes are answered on the spot, events are
    /// forwarded, decode failures degrade only that frame.
    async fn dispatch(
        &self,
        socket: &mut WsSocket,
        decoded: Result<Decoded, DecodeError>,
    ) -> Result<(), ()> {
        match decoded {
            Ok(Decoded::Control(ProbeKind::Ping(probe))) => {
                if let Err(err) = send_frame(socket, &ClientFrame::Pong(probe)).await {
                    self.notify_error(&err);
                    return Err(());
                }
            }
            Ok(Decoded::Control(ProbeKind::Pong(_))) => {}
            Ok(Decoded::Events(events)) => {
                for event in events {
                    let _ = self.events_tx.send(event);
                }
            }
            Err(err) => {
                warn!(event = "frame_decode_failed", error = %err);
            }
        }
        Ok(())
    }

    /// Waits out a reconnect delay while collecting commands that arrive in
    /// the meantime.
    async fn wait_backoff(
        &mut self,
        delay: Duration,
        waiters: &mut Vec<Waiter>,
        parked: &mut VecDeque<ParkedSend>,
    ) -> WaitEnd {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return WaitEnd::Elapsed,
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return WaitEnd::Shutdown,
                    Some(Command::Disconnect) => return WaitEnd::Disconnected,
                    Some(Command::Connect { done }) => waiters.push(done),
                    Some(Command::Send { frame, done }) => parked.push_back((frame, done)),
                }
            }
        }
    }

    /// Waits, closed, for the next command that needs the wire.
    async fn idle_wait(&mut self) -> IdleNext {
        loop {
            match self.cmd_rx.recv().await {
                None => return IdleNext::Shutdown,
                Some(Command::Disconnect) => continue,
                Some(Command::Connect { done }) => {
                    return IdleNext::Wanted {
                        waiters: vec![done],
                        parked: VecDeque::new(),
                    }
                }
                Some(Command::Send { frame, done }) => {
                    return IdleNext::Wanted {
                        waiters: Vec::new(),
                        parked: VecDeque::from([(frame, done)]),
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    fn notify(&self, status: ConnectionStatus) {
        let _ = self.status_tx.send(status);
    }

    fn notify_error(&self, err: &LiveError) {
        self.notify(ConnectionStatus::Error {
            message: err.to_string(),
        });
    }
}

/// Connects within the timeout, then transmits the session configuration as
/// the first frame.
async fn open_socket(
    url: String,
    setup: SessionConfig,
    connect_timeout: Duration,
) -> Result<WsSocket, LiveError> {
    let request = url.as_str().into_client_request()?;
    let (mut socket, _) = match tokio::time::timeout(connect_timeout, connect_async(request)).await
    {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => return Err(LiveError::WebSocket(err)),
        Err(_) => return Err(LiveError::ConnectTimeout(connect_timeout)),
    };
    send_frame(&mut socket, &ClientFrame::Setup(setup)).await?;
    Ok(socket)
}

/// Fails every pending waiter and parked send.
///
/// The triggering error goes to the first waiter; the rest observe a plain
/// not-connected failure.
fn fail_pending(waiters: &mut Vec<Waiter>, parked: &mut VecDeque<ParkedSend>, err: LiveError) {
    let mut first = Some(err);
    for done in waiters.drain(..) {
        let _ = done.send(Err(first.take().unwrap_or(LiveError::NotConnected)));
    }
    for (_, done) in parked.drain(..) {
        let _ = done.send(Err(first.take().unwrap_or(LiveError::NotConnected)));
    }
}

async fn send_frame(socket: &mut WsSocket, frame: &ClientFrame) -> Result<(), LiveError> {
    let text = frame.to_text()?;
    socket.send(Message::Text(text.into())).await?;
    Ok(())
}
