//! End-to-end relay tests with a scripted mock upstream.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use multimodal_live::relay::{self, RelayConfig};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type ServerSocket = WebSocketStream<TcpStream>;
type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn start_relay(upstream: String, heartbeat: Duration) -> SocketAddr {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let config = RelayConfig::new(upstream).with_heartbeat_interval(heartbeat);
    tokio::spawn(async move {
        relay::serve(listener, config).await.expect("relay serve");
    });
    addr
}

async fn accept_upstream(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = listener.accept().await.expect("accept");
    tokio_tungstenite::accept_async(stream).await.expect("upgrade")
}

async fn connect_peer(relay: SocketAddr, path_and_query: &str) -> ClientSocket {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{relay}{path_and_query}"))
        .await
        .expect("connect to relay");
    socket
}

/// Receives the next text frame as JSON, answering transport pings.
async fn recv_json<S>(socket: &mut WebSocketStream<S>) -> Value
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let message = timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("timely frame")
            .expect("open socket")
            .expect("ws frame");
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json"),
            Message::Ping(payload) => {
                socket.send(Message::Pong(payload)).await.expect("pong");
            }
            Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_text<S>(socket: &mut WebSocketStream<S>, text: &str)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    socket
        .send(Message::Text(text.to_string().into()))
        .await
        .expect("send");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwards_frames_both_ways_and_preserves_path_and_query() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");
    let relay = start_relay(format!("ws://{upstream_addr}"), Duration::from_secs(30)).await;

    let (uri_tx, uri_rx) = oneshot::channel();
    let upstream_task = tokio::spawn(async move {
        let (stream, _) = upstream_listener.accept().await.expect("accept");
        let mut socket = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, resp: Response| {
                let _ = uri_tx.send(req.uri().clone());
                Ok(resp)
            },
        )
        .await
        .expect("upgrade");

        let inbound = recv_json(&mut socket).await;
        assert_eq!(inbound["clientContent"]["turnComplete"], true);
        send_text(&mut socket, r#"{"serverContent":{"turnComplete":true}}"#).await;
        socket
    });

    let mut peer = connect_peer(relay, "/v1/live?key=secret").await;
    send_text(&mut peer, r#"{"clientContent":{"turns":[],"turnComplete":true}}"#).await;

    let reply = recv_json(&mut peer).await;
    assert_eq!(reply["serverContent"]["turnComplete"], true);

    let uri = uri_rx.await.expect("captured upstream uri");
    assert_eq!(uri.path(), "/v1/live");
    assert_eq!(uri.query(), Some("key=secret"));

    let _socket = upstream_task.await.expect("upstream task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_sent_before_upstream_opens_arrive_in_order() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");
    let relay = start_relay(format!("ws://{upstream_addr}"), Duration::from_secs(30)).await;

    let upstream_task = tokio::spawn(async move {
        // Hold the websocket handshake back so the relay has to queue.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut socket = accept_upstream(&upstream_listener).await;
        for expected in ["one", "two", "three"] {
            let inbound = recv_json(&mut socket).await;
            assert_eq!(inbound["text"], expected);
        }
    });

    let mut peer = connect_peer(relay, "/session").await;
    for text in ["one", "two", "three"] {
        send_text(&mut peer, &format!(r#"{{"text":"{text}"}}"#)).await;
    }

    upstream_task.await.expect("upstream task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn json_ping_is_answered_locally_and_never_forwarded() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");
    let relay = start_relay(format!("ws://{upstream_addr}"), Duration::from_secs(30)).await;

    let upstream_task = tokio::spawn(async move {
        let mut socket = accept_upstream(&upstream_listener).await;
        // The first frame to come through must be the marker, not the probe.
        let inbound = recv_json(&mut socket).await;
        assert_eq!(inbound["text"], "marker");
    });

    let mut peer = connect_peer(relay, "/session").await;
    send_text(&mut peer, r#"{"ping":{"atMs":7}}"#).await;
    send_text(&mut peer, r#"{"text":"marker"}"#).await;

    let reply = recv_json(&mut peer).await;
    assert_eq!(reply["pong"]["atMs"], 7);

    upstream_task.await.expect("upstream task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_close_code_and_reason_reach_upstream() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");
    let relay = start_relay(format!("ws://{upstream_addr}"), Duration::from_secs(30)).await;

    let upstream_task = tokio::spawn(async move {
        let mut socket = accept_upstream(&upstream_listener).await;
        loop {
            match timeout(RECV_TIMEOUT, socket.next())
                .await
                .expect("timely frame")
            {
                Some(Ok(Message::Close(frame))) => {
                    let frame = frame.expect("close frame with status");
                    assert_eq!(frame.code, CloseCode::Normal);
                    assert_eq!(frame.reason.as_str(), "bye");
                    break;
                }
                Some(Ok(_)) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    });

    let mut peer = connect_peer(relay, "/session").await;
    // Give the relay time to finish the upstream handshake so the close is
    // forwarded rather than ending the session early.
    tokio::time::sleep(Duration::from_millis(100)).await;
    peer.close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "bye".into(),
    }))
    .await
    .expect("close");

    upstream_task.await.expect("upstream task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_legs_receive_liveness_probes() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");
    let relay = start_relay(format!("ws://{upstream_addr}"), Duration::from_millis(100)).await;

    let upstream_task = tokio::spawn(async move {
        let mut socket = accept_upstream(&upstream_listener).await;
        let inbound = recv_json(&mut socket).await;
        assert!(inbound.get("ping").is_some(), "expected probe, got {inbound}");
    });

    let mut peer = connect_peer(relay, "/session").await;
    let inbound = recv_json(&mut peer).await;
    assert!(inbound.get("ping").is_some(), "expected probe, got {inbound}");

    upstream_task.await.expect("upstream task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_connect_failure_closes_peer_with_server_error() {
    // Nothing listens on the upstream side.
    let relay = start_relay("ws://127.0.0.1:9".to_string(), Duration::from_secs(30)).await;

    let mut peer = connect_peer(relay, "/session").await;
    loop {
        match timeout(RECV_TIMEOUT, peer.next()).await.expect("timely frame") {
            Some(Ok(Message::Close(frame))) => {
                let frame = frame.expect("close frame with status");
                assert_eq!(u16::from(frame.code), 1011);
                assert_eq!(frame.reason.as_str(), "upstream connect failed");
                break;
            }
            Some(Ok(_)) => {}
            None => panic!("connection ended without a close frame"),
            Some(Err(err)) => panic!("transport error: {err}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_http_requests_are_rejected() {
    let relay = start_relay("ws://127.0.0.1:9".to_string(), Duration::from_secs(30)).await;

    let mut stream = TcpStream::connect(relay).await.expect("connect");
    stream
        .write_all(b"GET /v1/live HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("write request");

    let mut response = Vec::new();
    timeout(RECV_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("timely response")
        .expect("read response");
    let response = String::from_utf8_lossy(&response);
    assert!(
        response.starts_with("HTTP/1.1 4"),
        "expected a 4xx status line, got: {response}"
    );
}
