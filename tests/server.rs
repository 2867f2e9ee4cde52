//! HTTP API and import socket, exercised over real TCP.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use ingest_relay::channel::{ChannelOptions, ResilientChannel, WebSocketTransport};
use ingest_relay::config::Config;
use ingest_relay::progress::NoProgress;
use ingest_relay::protocol::{ServerControl, ServerFrame};
use ingest_relay::server::{self, AppContext};
use ingest_relay::upload::{self, UploadOptions};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

async fn start_server() -> (u16, AppContext) {
    let ctx = AppContext::build(Config::minimal()).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let served = ctx.clone();
    tokio::spawn(async move {
        let _ = server::serve(listener, served).await;
    });
    wait_for_server(port).await;
    (port, ctx)
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("Server did not become ready within 5 seconds");
}

fn base(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

#[tokio::test]
async fn test_health_and_stage_listing() {
    let (port, _ctx) = start_server().await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/health", base(port)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let all: Value = client
        .get(format!("{}/api/stages", base(port)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all["stages"].as_array().unwrap().len(), 7);

    let splitters: Value = client
        .get(format!("{}/api/stages?kind=splitter", base(port)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = splitters["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["paragraph", "token"]);

    let resp = client
        .get(format!("{}/api/stages?kind=transformer", base(port)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_unknown_files_are_not_found() {
    let (port, _ctx) = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/api/files/missing", base(port)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .post(format!("{}/api/files/missing/retry", base(port)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .delete(format!("{}/api/files/missing", base(port)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_socket_ping_and_snapshot() {
    let (port, _ctx) = start_server().await;
    let url = format!("ws://127.0.0.1:{}/ws/import", port);
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
    let reply = next_text(&mut ws).await;
    assert_eq!(
        ServerFrame::parse(&reply).unwrap(),
        ServerFrame::Control(ServerControl::Pong)
    );

    ws.send(Message::Text(r#"{"type":"snapshot","fileIDs":["nobody"]}"#.into()))
        .await
        .unwrap();
    let reply: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(reply["type"], "snapshot");
    assert_eq!(reply["files"][0]["fileID"], "nobody");
    assert!(reply["files"][0]["status"].is_null());
}

async fn next_text<S>(ws: &mut S) -> String
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return text.as_str().to_owned(),
            Ok(Some(Ok(_))) => continue,
            other => panic!("no text frame: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_upload_end_to_end() {
    let (port, ctx) = start_server().await;
    let client = reqwest::Client::new();

    let tmp = TempDir::new().unwrap();
    let first = tmp.path().join("first.md");
    std::fs::write(&first, "# First\n\nSome text for the relay.\n\nAnother paragraph.").unwrap();
    let second = tmp.path().join("second.txt");
    std::fs::write(&second, "word ".repeat(2000)).unwrap();

    let options = UploadOptions {
        labels: vec!["Docs".to_string()],
        ..Default::default()
    };
    let transfers = vec![
        upload::build_transfer(&first, &options).unwrap(),
        upload::build_transfer(&second, &options).unwrap(),
    ];
    let ids: Vec<String> = transfers.iter().map(|t| t.file_id.clone()).collect();

    let channel = ResilientChannel::new(
        Arc::new(WebSocketTransport::new(format!("ws://127.0.0.1:{}/ws/import", port))),
        ChannelOptions::default(),
    );
    let summary = tokio::time::timeout(
        Duration::from_secs(20),
        upload::upload(&channel, transfers, 500, &NoProgress),
    )
    .await
    .expect("upload timed out")
    .unwrap();
    channel.disconnect("test finished");

    assert_eq!(summary.files.len(), 2);
    assert_eq!(summary.failed(), 0, "{:?}", summary);
    assert!(summary.files.iter().all(|f| f.message.starts_with("Imported ")));

    // Record
    let record: Value = client
        .get(format!("{}/api/files/{}", base(port), ids[0]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["state"]["state"], "DONE");
    assert_eq!(record["display_name"], "first.md");
    assert_eq!(record["stage_history"].as_array().unwrap().len(), 4);

    // Documents
    let docs: Value = client
        .get(format!("{}/api/documents", base(port)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(docs["documents"].as_array().unwrap().len(), 2);
    assert_eq!(ctx.memory.get(&ids[0]).unwrap().labels, vec!["Docs".to_string()]);

    // Snapshot
    let snap: Value = client
        .post(format!("{}/api/snapshot", base(port)))
        .json(&json!({ "fileIDs": ids }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let statuses: Vec<&str> = snap["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["DONE", "DONE"]);

    // Delete with removal, then reset what is left.
    let deleted: Value = client
        .delete(format!("{}/api/files/{}?remove=true", base(port), ids[0]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deleted["removed"], true);
    assert_eq!(deleted["cancelled"], false);
    let resp = client
        .get(format!("{}/api/files/{}", base(port), ids[0]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let reset: Value = client
        .post(format!("{}/api/reset", base(port)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reset["removed"], 1);
    assert!(ctx.orchestrator.is_empty());
}

async fn settle(ctx: &AppContext, file_id: &str) -> String {
    for _ in 0..200 {
        if let Some(state) = ctx.orchestrator.get_state(file_id).filter(|s| s.is_terminal()) {
            return state.wire_status().to_string();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("file {} never settled", file_id);
}

#[tokio::test]
async fn test_retry_hits_existing_document() {
    let (port, ctx) = start_server().await;
    let client = reqwest::Client::new();

    let transfer: ingest_relay_core::models::FileTransfer = serde_json::from_value(json!({
        "fileID": "r1",
        "filename": "r1.txt",
        "content": "retry me",
    }))
    .unwrap();
    for frame in upload::encode_transfer(&transfer, 100).unwrap() {
        ctx.handle_frame(&frame);
    }
    assert_eq!(settle(&ctx, "r1").await, "DONE");

    let resp = client
        .post(format!("{}/api/files/r1/retry", base(port)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    // Same file id without overwrite: the sink refuses the second copy.
    assert_eq!(settle(&ctx, "r1").await, "ERROR");
    let message = ctx.broadcaster.latest("r1").unwrap().message;
    assert!(message.contains("already exists"), "{}", message);
    assert_eq!(ctx.memory.len(), 1);
}
