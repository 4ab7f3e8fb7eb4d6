//! WebSocket 서버 통합 테스트
//!
//! `cargo test -p pilot-server --test server_test`

use futures::{SinkExt, StreamExt};
use pilot_foundation::{PilotConfig, Session};
use pilot_server::Server;
use pilot_session::Registry;
use pilot_task::LogLevel;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    registry: Arc<Registry>,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(PilotConfig::default()).await
    }

    async fn start_with(config: PilotConfig) -> Self {
        let registry = Arc::new(Registry::init(config).await.unwrap());
        let server = Server::bind("127.0.0.1:0", Arc::clone(&registry))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(shutdown.clone()));
        Self {
            registry,
            addr,
            shutdown,
        }
    }

    async fn session(&self, dry_run: bool) -> Session {
        let controller = &self.registry.controller;
        let session = controller
            .create_session("ws", std::env::temp_dir())
            .unwrap();
        controller.toggle_dry_run(session.id, dry_run).await.unwrap()
    }

    async fn connect(&self, session: &Session) -> Client {
        let url = format!(
            "ws://{}/stream?session_id={}&user_id=tester",
            self.addr, session.id
        );
        let (client, _) = connect_async(url).await.unwrap();
        client
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.registry.shutdown().await;
    }
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn next_matching<F: Fn(&Value) -> bool>(client: &mut Client, predicate: F) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            let message = client.next().await.expect("socket closed").unwrap();
            if let Message::Text(text) = message {
                let value: Value = serde_json::from_str(&text).unwrap();
                if predicate(&value) {
                    return value;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

async fn command(client: &mut Client, request_id: &str, command: Value) -> Value {
    send(
        client,
        json!({ "type": "command", "requestId": request_id, "command": command }),
    )
    .await;
    next_matching(client, |v| v["type"] == "response" && v["requestId"] == request_id).await
}

#[tokio::test]
async fn test_ping_pong() {
    let harness = Harness::start().await;
    let session = harness.session(false).await;
    let mut client = harness.connect(&session).await;

    send(&mut client, json!({ "type": "ping" })).await;
    let pong = next_matching(&mut client, |v| v["type"] == "pong").await;
    assert!(pong["timestamp"].is_string());

    // 예약된 프레임은 응답 없이 무시
    send(&mut client, json!({ "type": "subscribe_task" })).await;
    send(&mut client, json!({ "type": "ping" })).await;
    next_matching(&mut client, |v| v["type"] == "pong").await;

    harness.stop().await;
}

#[tokio::test]
async fn test_run_task_over_socket() {
    let harness = Harness::start().await;
    let session = harness.session(true).await;
    let mut client = harness.connect(&session).await;

    let created = command(
        &mut client,
        "1",
        json!({
            "op": "create_task",
            "sessionId": session.id,
            "title": "dry",
            "plan": [
                { "action": "check_tool", "tool": "git" },
                { "action": "shell_exec", "command": "echo hi" }
            ]
        }),
    )
    .await;
    assert_eq!(created["ok"], true);
    let task_id = created["result"]["id"].as_str().unwrap().to_string();
    assert_eq!(created["result"]["status"], "pending");

    let run = command(&mut client, "2", json!({ "op": "run_task", "taskId": task_id })).await;
    assert_eq!(run["ok"], true);

    let complete = next_matching(&mut client, |v| v["type"] == "task_complete").await;
    assert_eq!(complete["taskId"], task_id.as_str());
    assert_eq!(complete["sessionId"], session.id.to_string());

    let task = command(&mut client, "3", json!({ "op": "get_task", "taskId": task_id })).await;
    assert_eq!(task["result"]["status"], "completed");
    assert_eq!(task["result"]["currentStep"], 2);

    let approvals = command(
        &mut client,
        "4",
        json!({ "op": "list_approvals", "sessionId": session.id }),
    )
    .await;
    assert_eq!(approvals["result"], json!([]));

    harness.stop().await;
}

#[tokio::test]
async fn test_rejection_over_socket() {
    let harness = Harness::start().await;
    let session = harness.session(false).await;
    let mut operator = harness.connect(&session).await;
    let mut watcher = harness.connect(&session).await;

    let created = command(
        &mut operator,
        "1",
        json!({
            "op": "create_task",
            "sessionId": session.id,
            "title": "delete",
            "plan": [{ "action": "delete_file", "path": "/x" }]
        }),
    )
    .await;
    let task_id = created["result"]["id"].as_str().unwrap().to_string();
    command(&mut operator, "2", json!({ "op": "run_task", "taskId": task_id })).await;

    // 두 옵저버 모두 승인 요청을 받음
    let required = next_matching(&mut operator, |v| v["type"] == "approval_required").await;
    let seen = next_matching(&mut watcher, |v| v["type"] == "approval_required").await;
    assert_eq!(required["data"]["approvalId"], seen["data"]["approvalId"]);
    assert_eq!(required["data"]["action"], "delete_file");

    let approval_id = required["data"]["approvalId"].clone();
    let resolved = command(
        &mut operator,
        "3",
        json!({ "op": "resolve_approval", "approvalId": approval_id, "approved": false }),
    )
    .await;
    assert_eq!(resolved["ok"], true);
    assert_eq!(resolved["result"]["status"], "rejected");

    let error = next_matching(&mut watcher, |v| v["type"] == "task_error").await;
    assert_eq!(error["data"]["error"], "step rejected by operator");

    let again = command(
        &mut operator,
        "4",
        json!({ "op": "resolve_approval", "approvalId": approval_id, "approved": true }),
    )
    .await;
    assert_eq!(again["ok"], false);
    assert_eq!(again["error"]["kind"], "conflict");

    harness.stop().await;
}

#[tokio::test]
async fn test_command_errors() {
    let harness = Harness::start().await;
    let session = harness.session(false).await;
    let mut client = harness.connect(&session).await;

    let missing = command(
        &mut client,
        "1",
        json!({ "op": "get_task", "taskId": "00000000-0000-0000-0000-000000000000" }),
    )
    .await;
    assert_eq!(missing["ok"], false);
    assert_eq!(missing["error"]["kind"], "not_found");

    let empty_plan = command(
        &mut client,
        "2",
        json!({ "op": "create_task", "sessionId": session.id, "title": "x", "plan": [] }),
    )
    .await;
    assert_eq!(empty_plan["error"]["kind"], "validation");

    let renamed = command(
        &mut client,
        "3",
        json!({ "op": "update_session", "sessionId": session.id, "name": " " }),
    )
    .await;
    assert_eq!(renamed["error"]["kind"], "validation");

    send(&mut client, json!({ "type": "bogus" })).await;
    let malformed = next_matching(&mut client, |v| v["type"] == "response" && v["ok"] == false).await;
    assert!(malformed.get("requestId").is_none());
    assert_eq!(malformed["error"]["kind"], "validation");

    let stopped = command(
        &mut client,
        "4",
        json!({ "op": "stop_session", "sessionId": session.id }),
    )
    .await;
    assert_eq!(stopped["ok"], true);
    assert_eq!(stopped["result"]["session"]["status"], "idle");

    harness.stop().await;
}

#[tokio::test]
async fn test_handshake_requires_session() {
    let harness = Harness::start().await;

    let no_query = format!("ws://{}/stream", harness.addr);
    assert!(connect_async(no_query).await.is_err());

    let unknown = format!(
        "ws://{}/stream?session_id={}",
        harness.addr,
        pilot_foundation::SessionId::new()
    );
    assert!(connect_async(unknown).await.is_err());

    let session = harness.session(false).await;
    let wrong_path = format!("ws://{}/events?session_id={}", harness.addr, session.id);
    assert!(connect_async(wrong_path).await.is_err());

    harness.stop().await;
}

#[tokio::test]
async fn test_connection_closed_when_observer_dropped() {
    let mut config = PilotConfig::default();
    config.bus.observer_queue = 1;
    let harness = Harness::start_with(config).await;
    let session = harness.session(false).await;
    let mut client = harness.connect(&session).await;

    let bus = Arc::clone(&harness.registry.bus);
    tokio::time::timeout(WAIT, async {
        while bus.observer_count(session.id).await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("observer never subscribed");

    // 전달 워커가 돌기 전에 연속 발행 → 큐 초과로 옵저버 제거
    for i in 0..32 {
        harness
            .registry
            .engine
            .log(session.id, None, LogLevel::Info, format!("burst {}", i))
            .await;
    }
    assert_eq!(bus.observer_count(session.id).await, 0);
    assert!(bus.dropped_count() >= 1);

    // 서버가 연결을 닫아야 함
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match client.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection stayed open after its observer was dropped");

    harness.stop().await;
}
