//! WebSocket Server - 세션 스트림과 제어 커맨드
//!
//! 연결 하나 = 옵저버 하나. 업그레이드 요청의 쿼리로 세션을 지정합니다.
//!
//! ```text
//! TcpListener ── accept ──► handshake (/stream?session_id=..)
//!                               │
//!                               ├── WsObserver ──► EventBus.subscribe(session)
//!                               │        │
//!                               │        ▼
//!                               │   outbound queue ──► writer task ──► socket
//!                               │        ▲
//!                               └── reader: ping / subscribe_task / command → dispatch
//! ```

use crate::protocol::{self, ClientMessage, Response, StreamTarget};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use pilot_foundation::{Error, Observer, StreamEvent, TransportError};
use pilot_session::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response as HandshakeResponse};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

// ============================================================================
// WsObserver
// ============================================================================

/// EventBus observer backed by one WebSocket connection
pub struct WsObserver {
    name: String,
    outbound: mpsc::Sender<Message>,
    /// Fired when the bus drops this observer; the connection then closes
    closed: CancellationToken,
}

impl WsObserver {
    pub fn new(name: impl Into<String>, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            name: name.into(),
            outbound,
            closed: CancellationToken::new(),
        }
    }

    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[async_trait]
impl Observer for WsObserver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &StreamEvent) -> Result<(), TransportError> {
        let json = event
            .to_json()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.outbound
            .send(Message::Text(json))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn on_dropped(&self, reason: &TransportError) {
        debug!(observer = %self.name, reason = %reason, "Observer dropped by bus");
        self.closed.cancel();
    }
}

// ============================================================================
// Server
// ============================================================================

/// Accept loop over one listening socket
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Server {
    pub async fn bind(addr: &str, registry: Arc<Registry>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr()?, "Server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let registry = Arc::clone(&self.registry);
                        let shutdown = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, registry, shutdown).await {
                                debug!(peer = %peer, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

// ============================================================================
// Connection
// ============================================================================

fn reject(status: StatusCode, error: &Error) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = status;
    response
}

/// Resolve the upgrade request to an existing session
fn route(registry: &Registry, request: &Request) -> std::result::Result<StreamTarget, ErrorResponse> {
    let uri = request.uri();
    let target = StreamTarget::parse(uri.path(), uri.query()).map_err(|e| match e {
        Error::NotFound { .. } => reject(StatusCode::NOT_FOUND, &e),
        _ => reject(StatusCode::BAD_REQUEST, &e),
    })?;
    registry
        .controller
        .get_session(target.session_id)
        .map_err(|e| reject(StatusCode::NOT_FOUND, &e))?;
    Ok(target)
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut target = None;
    let ws = accept_hdr_async(
        stream,
        |request: &Request,
         response: HandshakeResponse|
         -> std::result::Result<HandshakeResponse, ErrorResponse> {
            let routed = route(&registry, request)?;
            target = Some(routed);
            Ok(response)
        },
    )
    .await
    .context("WebSocket handshake failed")?;
    let target = target.context("handshake completed without a target")?;

    let (sink, mut incoming) = ws.split();
    let (outbound, rx) = mpsc::channel(registry.config.bus.observer_queue.max(1));
    let writer = tokio::spawn(write_loop(sink, rx));

    let observer = Arc::new(WsObserver::new(
        format!(
            "ws:{}@{}",
            target.user_id.as_deref().unwrap_or("anonymous"),
            peer
        ),
        outbound.clone(),
    ));
    let dropped = observer.closed();
    let handle = registry.bus.subscribe(target.session_id, observer).await;
    info!(
        session_id = %target.session_id,
        user_id = target.user_id.as_deref().unwrap_or("-"),
        peer = %peer,
        "Observer connected"
    );

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            // 이벤트를 받지 못하는 연결은 닫아서 클라이언트가 재연결하도록 함
            _ = dropped.cancelled() => {
                warn!(session_id = %target.session_id, peer = %peer, "Event delivery failed, closing connection");
                break;
            }
            frame = incoming.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                if let Some(reply) = handle_text(&registry, &text).await {
                    if outbound.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(peer = %peer, error = %e, "Read failed");
                break;
            }
        }
    }

    registry.bus.unsubscribe(&handle).await;
    drop(outbound);
    // 막힌 소켓이면 close 프레임도 못 보내므로 기다리지 않음
    let mut writer = writer;
    if tokio::time::timeout(registry.bus.config().send_timeout, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!(session_id = %target.session_id, peer = %peer, "Observer disconnected");
    Ok(())
}

/// Answer one text frame; `None` when the frame needs no reply
async fn handle_text(registry: &Registry, text: &str) -> Option<Message> {
    let reply = match protocol::parse_client_message(text) {
        Ok(ClientMessage::Ping) => protocol::pong(),
        Ok(ClientMessage::SubscribeTask { task_id }) => {
            debug!(task_id = ?task_id, "subscribe_task ignored");
            return None;
        }
        Ok(ClientMessage::Command {
            request_id,
            command,
        }) => {
            let op = command.op();
            let result = protocol::dispatch(&registry.controller, command).await;
            match &result {
                Err(e) if e.is_user_facing() => {
                    debug!(op, request_id = %request_id, error = %e, "Command rejected")
                }
                Err(e) => warn!(op, request_id = %request_id, error = %e, "Command failed"),
                Ok(_) => {}
            }
            to_value(Response::from_result(Some(request_id), result))
        }
        Err(e) => to_value(Response::failure(None, &e)),
    };
    Some(Message::Text(reply.to_string()))
}

fn to_value(response: Response) -> serde_json::Value {
    serde_json::to_value(response).unwrap_or_else(|e| {
        serde_json::json!({
            "type": "response",
            "ok": false,
            "error": { "kind": "internal", "message": e.to_string() },
        })
    })
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
    let _ = sink.close().await;
}
