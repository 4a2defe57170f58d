//! Connection handlers for Huddle server.
//!
//! This module handles the connection lifecycle and event processing.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use huddle_core::{DisconnectReason, Lifecycle, Relay, Session};
use huddle_protocol::{codec, now_millis, ClientEvent, RejectedEvent, ServerEvent, WireFormat};
use huddle_transport::{ChannelTransport, ConnectionId, Outbound, Transport};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError as WsProtocolError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// WebSocket close code for a server going away.
const CLOSE_GOING_AWAY: u16 = 1001;

/// Ack error for a frame that is not a valid event.
const INVALID_EVENT: &str = "invalid event";

/// Shared server state.
pub struct AppState {
    /// The presence relay.
    pub relay: Relay,
    /// Connection registry and room groups.
    pub transport: Arc<ChannelTransport>,
    /// Cancelled when the server starts shutting down.
    pub shutdown: CancellationToken,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, shutdown: CancellationToken) -> Self {
        let transport = Arc::new(ChannelTransport::new());
        let relay = Relay::new(transport.clone(), config.relay_config());

        Self {
            relay,
            transport,
            shutdown,
            config,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let token = CancellationToken::new();
    let state = Arc::new(AppState::new(config.clone(), token.clone()));
    let lifecycle = Lifecycle::start(state.relay.clone());

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            lifecycle.shutdown().await;
            token.cancel();
        })
        .await?;

    info!("Huddle server stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
        () = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.relay.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "timestamp": now_millis(),
        "roomCount": stats.room_count,
        "liveConnectionCount": state.relay.live_connections(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.shutdown.is_cancelled() || state.relay.is_closing() {
        metrics::record_rejected("shutting_down");
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    if state.transport.connection_count() >= state.config.limits.max_connections {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached, rejecting upgrade"
        );
        metrics::record_rejected("max_connections");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

type WsSender = SplitSink<WebSocket, Message>;

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    let mut outbound = state.transport.register(connection_id.clone());
    let mut session = Session::new(connection_id.clone());

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Replies use the format of the client's most recent frame.
    let mut format = WireFormat::Json;

    let connected = ServerEvent::connected(connection_id.as_str());
    let reason = if let Err(e) = send_event(&mut sender, &connected, format).await {
        warn!(connection = %connection_id, error = %e, "Failed to send connected event");
        send_error_reason(&e)
    } else {
        connection_loop(
            &state,
            &mut session,
            &mut sender,
            &mut receiver,
            &mut outbound,
            &mut format,
        )
        .await
    };

    state.relay.disconnect(&mut session, &reason);
    state.transport.unregister(&connection_id);
    metrics::set_active_rooms(state.relay.stats().room_count);

    debug!(connection = %connection_id, reason = %reason, "WebSocket disconnected");
}

/// Pump events until the connection ends, returning why it ended.
async fn connection_loop(
    state: &Arc<AppState>,
    session: &mut Session,
    sender: &mut WsSender,
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    outbound: &mut Outbound,
    format: &mut WireFormat,
) -> DisconnectReason {
    let idle_timeout = state.config.idle_timeout();
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    let shutdown = state.shutdown.child_token();
    let connection_id = session.connection_id().clone();

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                let close = Message::Close(Some(CloseFrame {
                    code: CLOSE_GOING_AWAY,
                    reason: "server shutting down".into(),
                }));
                let _ = sender.send(close).await;
                return DisconnectReason::ServerClose;
            }

            event = outbound.recv() => {
                let Some(event) = event else {
                    return DisconnectReason::ServerClose;
                };
                if let Err(e) = send_event(sender, &event, *format).await {
                    debug!(connection = %connection_id, error = %e, "Outbound send failed");
                    return send_error_reason(&e);
                }
            }

            msg = receiver.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);

                let replies = match msg {
                    Some(Ok(Message::Text(text))) => {
                        *format = WireFormat::Json;
                        match codec::decode_event_json(&text) {
                            Ok(event) => handle_event(state, session, event).into_iter().collect(),
                            Err(rejected) => reject_event(&connection_id, &rejected).into_iter().collect(),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        *format = WireFormat::MessagePack;
                        read_buffer.extend_from_slice(&data);
                        decode_binary(state, session, &mut read_buffer)
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            return stream_error_reason(&e);
                        }
                        Vec::new()
                    }
                    Some(Ok(Message::Pong(_))) => Vec::new(),
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        return DisconnectReason::ClientClose;
                    }
                    Some(Err(e)) => {
                        let reason = stream_error_reason(&e);
                        if reason.is_transient() {
                            debug!(connection = %connection_id, error = %e, "WebSocket connection lost");
                        } else {
                            warn!(connection = %connection_id, error = %e, "WebSocket error");
                            metrics::record_error("websocket");
                        }
                        return reason;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        return DisconnectReason::TransportClose;
                    }
                };

                for reply in replies {
                    if let Err(e) = send_event(sender, &reply, *format).await {
                        debug!(connection = %connection_id, error = %e, "Ack send failed");
                        return send_error_reason(&e);
                    }
                }
            }

            () = &mut idle => {
                debug!(connection = %connection_id, "Idle timeout");
                return DisconnectReason::PingTimeout;
            }
        }
    }
}

/// Decode and handle every complete frame in the buffer.
fn decode_binary(
    state: &AppState,
    session: &mut Session,
    read_buffer: &mut BytesMut,
) -> Vec<ServerEvent> {
    let mut replies = Vec::new();
    loop {
        match codec::decode_event_from(read_buffer) {
            Ok(Some(event)) => replies.extend(handle_event(state, session, event)),
            Ok(None) => break,
            Err(rejected) => {
                replies.extend(reject_event(session.connection_id(), &rejected));
                if rejected.is_fatal() {
                    // Framing is lost; drop what is buffered.
                    read_buffer.clear();
                    break;
                }
            }
        }
    }
    replies
}

/// Log an undecodable frame and answer it if it carried an id.
fn reject_event(connection_id: &ConnectionId, rejected: &RejectedEvent) -> Option<ServerEvent> {
    warn!(connection = %connection_id, error = %rejected, "Undecodable frame");
    metrics::record_error("decode");
    rejected
        .request_id
        .map(|id| ServerEvent::ack_error(id, INVALID_EVENT))
}

/// Dispatch one client event, returning its acknowledgment if any.
fn handle_event(state: &AppState, session: &mut Session, event: ClientEvent) -> Option<ServerEvent> {
    let name = event.name();
    metrics::record_event(name);

    let start = Instant::now();
    let ack = state.relay.dispatch(session, event);
    metrics::record_latency(start.elapsed().as_secs_f64());

    if let Some(ServerEvent::Ack { success: false, .. }) = &ack {
        metrics::record_failed_ack(name);
    }
    if name == "join-room" {
        metrics::set_active_rooms(state.relay.stats().room_count);
    }

    ack
}

/// Classify a socket error.
///
/// Losing the peer (reset without a close handshake, I/O failure) is a
/// network drop and gets the long grace window. Errors that cannot be
/// inspected are treated the same way.
fn stream_error_reason(err: &axum::Error) -> DisconnectReason {
    use std::error::Error as _;

    match err.source().and_then(|e| e.downcast_ref::<WsError>()) {
        Some(WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake))
        | Some(WsError::Io(_))
        | Some(WsError::ConnectionClosed)
        | Some(WsError::AlreadyClosed)
        | None => DisconnectReason::TransportClose,
        Some(_) => DisconnectReason::TransportError,
    }
}

/// Classify a failure from [`send_event`].
fn send_error_reason(err: &anyhow::Error) -> DisconnectReason {
    err.downcast_ref::<axum::Error>()
        .map_or(DisconnectReason::TransportError, stream_error_reason)
}

/// Encode an event in `format` and send it.
async fn send_event(sender: &mut WsSender, event: &ServerEvent, format: WireFormat) -> Result<()> {
    let message = match format {
        WireFormat::Json => Message::Text(codec::encode_json(event)?),
        WireFormat::MessagePack => Message::Binary(codec::encode(event)?.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn spawn_server(config: Config) -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(config, CancellationToken::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (addr, state)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        client
    }

    async fn next_json(client: &mut Client) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn send_json(client: &mut Client, value: serde_json::Value) {
        client.send(WsMessage::Text(value.to_string())).await.unwrap();
    }

    /// One second for deliberate disconnects, three for network drops.
    fn short_grace_config() -> Config {
        let mut config = Config::default();
        config.presence.default_grace_secs = 1;
        config.presence.transient_grace_secs = 3;
        config
    }

    async fn join(client: &mut Client, room_id: &str, client_id: &str) {
        next_json(client).await;
        send_json(
            client,
            serde_json::json!({"type": "join-room", "id": 1, "roomId": room_id, "clientId": client_id}),
        )
        .await;
        assert_eq!(next_json(client).await["success"], true);
    }

    async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let mut waited = Duration::ZERO;
        while !done() {
            assert!(waited < Duration::from_secs(5), "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
    }

    async fn wait_disconnected(state: &AppState) {
        wait_for("disconnect", || {
            state.relay.member("R", "alice").is_some_and(|m| !m.connected)
        })
        .await;
    }

    /// Checks the member outlives the short grace window, then expires.
    async fn assert_long_grace(state: &AppState) {
        wait_disconnected(state).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(state.relay.member("R", "alice").is_some());
        assert!(state.relay.has_pending_removal("R", "alice"));
        wait_for("removal", || state.relay.member("R", "alice").is_none()).await;
    }

    /// Checks the member is removed once the short grace window passes.
    async fn assert_short_grace(state: &AppState) {
        wait_disconnected(state).await;
        assert!(state.relay.has_pending_removal("R", "alice"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(state.relay.member("R", "alice").is_none());
    }

    #[tokio::test]
    async fn test_join_and_chat_over_websocket() {
        let (addr, _state) = spawn_server(Config::default()).await;

        let mut alice = connect(addr).await;
        assert_eq!(next_json(&mut alice).await["type"], "connected");
        send_json(
            &mut alice,
            serde_json::json!({"type": "join-room", "id": 1, "roomId": "R", "clientId": "alice"}),
        )
        .await;
        let ack = next_json(&mut alice).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["success"], true);
        assert_eq!(ack["members"], serde_json::json!([]));

        let mut bob = connect(addr).await;
        next_json(&mut bob).await;
        send_json(
            &mut bob,
            serde_json::json!({"type": "join-room", "id": 1, "roomId": "R", "clientId": "bob"}),
        )
        .await;
        let ack = next_json(&mut bob).await;
        assert_eq!(ack["members"][0]["clientId"], "alice");

        let joined = next_json(&mut alice).await;
        assert_eq!(joined["type"], "user-joined");
        assert_eq!(joined["clientId"], "bob");

        send_json(
            &mut bob,
            serde_json::json!({"type": "send-message", "id": 2, "message": "hi"}),
        )
        .await;

        let received = next_json(&mut alice).await;
        assert_eq!(received["type"], "receive-message");
        assert_eq!(received["message"], "hi");
        assert_eq!(received["clientId"], "bob");
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let (addr, state) = spawn_server(Config::default()).await;

        let mut client = connect(addr).await;
        next_json(&mut client).await;
        send_json(
            &mut client,
            serde_json::json!({"type": "join-room", "id": 1, "roomId": "R", "clientId": "alice"}),
        )
        .await;
        next_json(&mut client).await;

        let response = health_handler(State(state)).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(response["status"], "ok");
        assert_eq!(response["roomCount"], 1);
        assert_eq!(response["liveConnectionCount"], 1);
        assert!(response["timestamp"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_rejects_when_full() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let (addr, _state) = spawn_server(config).await;

        let mut first = connect(addr).await;
        next_json(&mut first).await;

        let second = connect_async(format!("ws://{addr}/ws")).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_abrupt_drop_keeps_member_for_long_grace() {
        let (addr, state) = spawn_server(short_grace_config()).await;

        let mut client = connect(addr).await;
        join(&mut client, "R", "alice").await;
        drop(client);

        assert_long_grace(&state).await;
    }

    #[tokio::test]
    async fn test_close_frame_removes_after_short_grace() {
        let (addr, state) = spawn_server(short_grace_config()).await;

        let mut client = connect(addr).await;
        join(&mut client, "R", "alice").await;
        client.close(None).await.unwrap();

        assert_short_grace(&state).await;
    }

    #[tokio::test]
    async fn test_idle_timeout_keeps_member_for_long_grace() {
        let mut config = short_grace_config();
        config.heartbeat.timeout_ms = 300;
        let (addr, state) = spawn_server(config).await;

        let mut client = connect(addr).await;
        join(&mut client, "R", "alice").await;

        assert_long_grace(&state).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_with_going_away() {
        let (addr, state) = spawn_server(short_grace_config()).await;

        let mut client = connect(addr).await;
        join(&mut client, "R", "alice").await;
        state.shutdown.cancel();

        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            WsMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), CLOSE_GOING_AWAY),
            other => panic!("expected close frame, got {other:?}"),
        }

        assert_short_grace(&state).await;
    }

    #[tokio::test]
    async fn test_missing_client_id_gets_failed_ack() {
        let (addr, state) = spawn_server(Config::default()).await;

        let mut client = connect(addr).await;
        next_json(&mut client).await;
        send_json(
            &mut client,
            serde_json::json!({"type": "join-room", "id": 7, "roomId": "R"}),
        )
        .await;

        let ack = next_json(&mut client).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["id"], 7);
        assert_eq!(ack["success"], false);
        assert_eq!(ack["error"], "clientId is required");
        assert_eq!(state.relay.stats().room_count, 0);
    }

    #[tokio::test]
    async fn test_unknown_event_gets_failed_ack() {
        let (addr, _state) = spawn_server(Config::default()).await;

        let mut client = connect(addr).await;
        next_json(&mut client).await;
        send_json(&mut client, serde_json::json!({"type": "bogus", "id": 9})).await;

        let ack = next_json(&mut client).await;
        assert_eq!(ack["id"], 9);
        assert_eq!(ack["success"], false);
        assert_eq!(ack["error"], INVALID_EVENT);

        // The connection survives the bad frame.
        send_json(&mut client, serde_json::json!({"type": "heartbeat", "id": 10})).await;
        let ack = next_json(&mut client).await;
        assert_eq!(ack["id"], 10);
        assert_eq!(ack["success"], true);
    }

    #[test]
    fn test_stream_error_reason() {
        let reset = axum::Error::new(WsError::Protocol(
            WsProtocolError::ResetWithoutClosingHandshake,
        ));
        assert_eq!(stream_error_reason(&reset), DisconnectReason::TransportClose);

        let io = axum::Error::new(WsError::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset,
        )));
        assert_eq!(stream_error_reason(&io), DisconnectReason::TransportClose);

        let utf8 = axum::Error::new(WsError::Utf8);
        assert_eq!(stream_error_reason(&utf8), DisconnectReason::TransportError);

        let wrapped = anyhow::Error::new(axum::Error::new(WsError::ConnectionClosed));
        assert_eq!(send_error_reason(&wrapped), DisconnectReason::TransportClose);
        let encode = anyhow::anyhow!("encode failed");
        assert_eq!(send_error_reason(&encode), DisconnectReason::TransportError);
    }
}
