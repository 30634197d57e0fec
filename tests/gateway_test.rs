//! Progress gateway and progress client over real local sockets.

mod helpers;

use futures_util::{SinkExt, StreamExt};
use helpers::*;
use import_progress::{
    client::{ConnectionState, FileStatus, ProgressClient, StatusPoller},
    config::ClientConfig,
    models::{
        job::{ImportStats, Job, JobStatus},
        message::ServerMessage,
    },
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

fn client_config(progress_url: String) -> ClientConfig {
    ClientConfig {
        progress_url,
        reconnect_delay: Duration::from_millis(50),
        polling_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

async fn wait_for_state(client: &ProgressClient, wanted: ConnectionState) {
    let mut rx = client.watch_state();
    timeout(WAIT, rx.wait_for(|state| *state == wanted))
        .await
        .expect("state never reached")
        .expect("client dropped");
}

async fn wait_for_statuses(
    client: &ProgressClient,
    done: impl Fn(&[FileStatus]) -> bool,
) -> Vec<FileStatus> {
    timeout(WAIT, async {
        loop {
            let statuses = client.statuses();
            if done(&statuses) {
                return statuses;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("statuses never converged")
}

async fn next_text(ws: &mut WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>) -> String {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("no message from gateway")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return text.to_string();
        }
    }
}

fn progress(stats: &Option<ImportStats>) -> Option<f64> {
    stats.as_ref().and_then(|s| s.progress)
}

#[tokio::test]
async fn test_client_reconciles_broadcasts_by_file_name() {
    let gateway = TestGateway::start().await;
    let config = fast_config();
    seed(gateway.store.as_ref(), &config, &Job::queued_import("job-1", "a.csv", None)).await;

    let client = ProgressClient::spawn(client_config(gateway.ws_url()));
    wait_for_state(&client, ConnectionState::Connected).await;
    gateway.wait_for_subscribers(1).await;
    assert!(client.is_connected());
    assert!(client.statuses().is_empty());

    gateway.status.mark_job_processing("job-1").await;
    let statuses = wait_for_statuses(&client, |s| !s.is_empty()).await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].file_name, "a.csv");
    assert_eq!(statuses[0].status, JobStatus::Processing);

    gateway.status.update_job_progress("job-1", 42.0, 1.2).await;
    let statuses = wait_for_statuses(&client, |s| progress(&s[0].stats) == Some(42.0)).await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].job_id.as_deref(), Some("job-1"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_resolved_job_leaves_active_set() {
    let gateway = TestGateway::start().await;
    let config = fast_config();
    seed(gateway.store.as_ref(), &config, &Job::queued_import("job-1", "a.csv", None)).await;

    let client = ProgressClient::spawn(client_config(gateway.ws_url()));
    client.track("job-1", "a.csv");
    assert_eq!(client.active_job_ids(), ["job-1"]);
    gateway.wait_for_subscribers(1).await;

    gateway.status.mark_job_processing("job-1").await;
    gateway
        .status
        .mark_job_done(
            "job-1",
            ImportStats {
                created: Some(3),
                ..Default::default()
            },
        )
        .await;

    let statuses = wait_for_statuses(&client, |s| s[0].status == JobStatus::Done).await;
    assert_eq!(statuses[0].stats.as_ref().unwrap().created, Some(3));
    assert!(client.active_job_ids().is_empty());

    client.clear();
    assert!(client.statuses().is_empty());
    client.disconnect().await;
}

#[tokio::test]
async fn test_gateway_forwards_only_after_subscribe() {
    let gateway = TestGateway::start().await;
    let (mut ws, _) = connect_async(gateway.ws_url()).await.unwrap();

    // Not subscribed yet: nobody receives this
    assert_eq!(gateway.hub.publish("[]"), 0);

    ws.send(Message::Text(r#"{"type":"subscribe:imports"}"#.into()))
        .await
        .unwrap();
    let ack: ServerMessage = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(ack, ServerMessage::Subscribed);

    // One channel payload with two snapshots becomes two messages
    let jobs = vec![
        Job::queued_import("job-1", "a.csv", None),
        Job::queued_import("job-2", "b.csv", None),
    ];
    gateway.hub.publish(&serde_json::to_string(&jobs).unwrap());

    for expected in &jobs {
        let raw = next_text(&mut ws).await;
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "import:progress");
        assert_eq!(value["data"]["jobId"], expected.job_id.as_str());
    }

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_client_disconnect_closes_connection() {
    let gateway = TestGateway::start().await;
    let client = ProgressClient::spawn(client_config(gateway.ws_url()));
    gateway.wait_for_subscribers(1).await;

    let mut state = client.watch_state();
    client.disconnect().await;
    assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);

    timeout(WAIT, async {
        while gateway.hub.subscriber_count() > 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("gateway kept the connection");
}

/// Local WebSocket server that records every subscribe message and runs
/// `behaviour` for each accepted connection (0-based index).
async fn scripted_server<F, Fut>(behaviour: F) -> (String, Arc<AtomicU32>, Arc<Mutex<Vec<String>>>)
where
    F: Fn(u32, WebSocketStream<tokio::net::TcpStream>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let connections = Arc::new(AtomicU32::new(0));
    let subscribes = Arc::new(Mutex::new(Vec::new()));

    let counter = connections.clone();
    let seen = subscribes.clone();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let Ok(mut ws) = accept_async(tcp).await else {
                continue;
            };
            let index = counter.fetch_add(1, Ordering::SeqCst);
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                seen.lock().unwrap().push(text.to_string());
            }
            tokio::spawn(behaviour(index, ws));
        }
    });

    (url, connections, subscribes)
}

#[tokio::test]
async fn test_client_reconnects_and_resubscribes_after_abnormal_close() {
    let snapshot = serde_json::json!({
        "type": "import:progress",
        "data": {
            "jobId": "job-1",
            "type": "import-transactions",
            "status": "processing",
            "fileName": "a.csv",
            "revision": 2,
            "stats": {"progress": 55}
        }
    })
    .to_string();

    let (url, connections, subscribes) = scripted_server(move |index, mut ws| {
        let snapshot = snapshot.clone();
        async move {
            if index == 0 {
                // Drop the socket without a close handshake
                drop(ws);
                return;
            }
            let _ = ws.send(Message::Text(snapshot.into())).await;
            while ws.next().await.is_some() {}
        }
    })
    .await;

    let client = ProgressClient::spawn(client_config(url));
    let statuses = wait_for_statuses(&client, |s| !s.is_empty()).await;

    assert_eq!(progress(&statuses[0].stats), Some(55.0));
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    let subscribes = subscribes.lock().unwrap().clone();
    assert_eq!(subscribes, vec![r#"{"type":"subscribe:imports"}"#.to_string(); 2]);
    assert!(client.is_connected());

    client.disconnect().await;
}

#[tokio::test]
async fn test_client_stays_disconnected_after_normal_close() {
    let (url, connections, _) = scripted_server(|_, mut ws| async move {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "done".into(),
        };
        let _ = ws.close(Some(frame)).await;
    })
    .await;

    let client = ProgressClient::spawn(client_config(url));
    timeout(WAIT, async {
        while connections.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never connected");

    // Several reconnect delays pass without a second connection
    sleep(Duration::from_millis(200)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    client.disconnect().await;
}

#[tokio::test]
async fn test_point_read_and_polling_fallback() {
    let gateway = TestGateway::start().await;
    let config = fast_config();
    seed(gateway.store.as_ref(), &config, &Job::queued_import("job-1", "a.csv", None)).await;

    let poller = StatusPoller::new(&ClientConfig {
        api_base_url: gateway.base_url(),
        polling_interval: Duration::from_millis(20),
        ..Default::default()
    });

    let job = poller.fetch("job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(poller.fetch("missing").await.unwrap().is_none());

    let status = gateway.status.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(60)).await;
        status.mark_job_processing("job-1").await;
        status.mark_job_done("job-1", ImportStats::default()).await;
    });

    let resolved = poller
        .wait_until_resolved("job-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(resolved.status, JobStatus::Done);

    // A client that missed the broadcasts catches up from the point read
    let client = ProgressClient::spawn(client_config(gateway.ws_url()));
    client.apply_snapshot(resolved);
    assert_eq!(client.statuses()[0].status, JobStatus::Done);
    client.disconnect().await;
}

#[tokio::test]
async fn test_health_reports_store_status() {
    let gateway = TestGateway::start().await;
    let response = reqwest::get(format!("{}/health", gateway.base_url()))
        .await
        .unwrap();
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["store"]["status"], "ok");
}
