use futures::{SinkExt, StreamExt};
use rpc_session::client::Client;
use rpc_session::config::ClientSettings;
use rpc_session::events::{ClientEvent, RecordingObserver};
use rpc_session::networking::api_message::FunctionCall;
use rpc_session::request::{Callback, Memoize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};
use warp::Filter;

/// Answers control messages as an accepting server and echoes every call.
fn answer(frame: &Value) -> Option<Value> {
    let data = &frame["data"];
    match frame["event"].as_str()? {
        "command" => Some(json!({
            "event": "command",
            "data": {
                "id": data["id"],
                "command": data["command"],
                "status": true,
                "accepted": true,
                "guest_allowed": false,
                "version": "test",
            }
        })),
        "server_call" => {
            let results: Vec<Value> = data["msg"]["data"]
                .as_array()?
                .iter()
                .map(|call| json!({"fname": call["fname"], "data": {"echo": call}}))
                .collect();
            Some(json!({
                "event": "server_call",
                "data": {"id": data["id"], "msg": {"session": "s1", "data": results}}
            }))
        }
        _ => None,
    }
}

async fn serve_socket(socket: WebSocket) {
    let (mut tx, mut rx) = socket.split();
    while let Some(Ok(message)) = rx.next().await {
        let text = match message.to_str() {
            Ok(text) => text.to_string(),
            Err(_) => continue,
        };
        let frame: Value = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        if let Some(reply) = answer(&frame) {
            if tx.send(Message::text(reply.to_string())).await.is_err() {
                break;
            }
        }
    }
}

fn start_server() -> SocketAddr {
    let routes = warp::any()
        .and(warp::ws())
        .map(|ws: warp::ws::Ws| ws.on_upgrade(serve_socket));
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

#[tokio::test]
async fn queued_call_is_answered_after_connect() {
    let addr = start_server();
    let data_dir = tempfile::tempdir().unwrap();
    let mut settings = ClientSettings::default();
    settings.server_url = format!("ws://{}", addr);
    settings.data_dir = data_dir.path().to_path_buf();
    settings.socket_redial_ms = 50;

    let observer = RecordingObserver::new();
    let client = Client::connect(settings, Arc::new(observer.clone()))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.call_func(
        FunctionCall::new("echo").arg("text", "hi"),
        Some(Callback::plain(move |data, error| {
            let _ = tx.send((data, error));
        })),
        Memoize::Off,
    );

    let (data, error) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(error.is_none());
    assert_eq!(data, Some(json!({"echo": {"fname": "echo", "text": "hi"}})));
    assert_eq!(observer.count(&ClientEvent::Connected), 1);
    assert!(client.server_state().accepted);
    assert_eq!(client.server_state().version, "test");
    assert!(data_dir.path().join("sessionstore.json").exists());

    client.shutdown().await;
}

#[tokio::test]
async fn commands_are_tracked_over_their_own_socket() {
    let addr = start_server();
    let data_dir = tempfile::tempdir().unwrap();
    let mut settings = ClientSettings::default();
    settings.server_url = format!("ws://{}", addr);
    settings.data_dir = data_dir.path().to_path_buf();

    let client = Client::connect(settings, Arc::new(RecordingObserver::new()))
        .await
        .unwrap();
    let command = client.track(vec![1u64, 2]).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    command.check_status();
    // the echo server answers a state query with the query itself, so states stay unknown
    let connection = client.command_connection().clone();
    connection.call_func(
        FunctionCall::new("ping"),
        Some(Callback::plain(move |data, _| {
            let _ = tx.send(data);
        })),
        Memoize::Off,
    );
    let data = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data, Some(json!({"echo": {"fname": "ping"}})));
    assert!(!command.finished(false));
    assert_eq!(connection.name(), "command");

    client.shutdown().await;
}
