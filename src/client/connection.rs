//! Reconnecting WebSocket consumer of the progress gateway.

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::tracker::{FileStatus, ImportTracker};
use crate::config::ClientConfig;
use crate::models::job::Job;
use crate::models::message::{ClientMessage, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer closed with code 1000; no reconnect.
    Normal,
    /// `disconnect` was called.
    Shutdown,
    /// Anything else; reconnect after the configured delay.
    Abnormal(String),
}

/// Classify a received close frame. Only code 1000 counts as intentional.
pub fn classify_close(frame: Option<&CloseFrame>) -> SessionEnd {
    match frame {
        Some(frame) if frame.code == CloseCode::Normal => SessionEnd::Normal,
        Some(frame) => SessionEnd::Abnormal(format!("closed with code {}", u16::from(frame.code))),
        None => SessionEnd::Abnormal("closed without status".to_string()),
    }
}

struct Shared {
    tracker: RwLock<ImportTracker>,
    state: watch::Sender<ConnectionState>,
    updates: watch::Sender<u64>,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, ImportTracker> {
        self.tracker.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ImportTracker> {
        self.tracker.write().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn bump(&self) {
        self.updates.send_modify(|n| *n += 1);
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::ImportProgress(data)) => {
                let applied = self.write().apply(data.into_jobs());
                if applied > 0 {
                    self.bump();
                }
            }
            Ok(ServerMessage::Subscribed) => debug!("subscribed to import progress"),
            Err(e) => debug!(error = %e, "ignoring unrecognised gateway message"),
        }
    }
}

/// Handle to a background progress consumer.
///
/// Subscribes on every (re)connect and folds progress messages into an
/// [`ImportTracker`]. Events broadcast while disconnected are not replayed;
/// use a point read and [`ProgressClient::apply_snapshot`] to catch up.
pub struct ProgressClient {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ProgressClient {
    /// Start connecting in the background. Never blocks the caller.
    pub fn spawn(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (updates, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            tracker: RwLock::new(ImportTracker::new()),
            state,
            updates,
        });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(config, shared.clone(), shutdown.clone()));
        Self {
            shared,
            shutdown,
            task,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Ticks whenever a message changed the reconciled statuses.
    pub fn watch_updates(&self) -> watch::Receiver<u64> {
        self.shared.updates.subscribe()
    }

    pub fn statuses(&self) -> Vec<FileStatus> {
        self.shared.read().statuses().to_vec()
    }

    pub fn active_job_ids(&self) -> Vec<String> {
        self.shared.read().active_job_ids().to_vec()
    }

    pub fn track(&self, job_id: &str, file_name: &str) {
        self.shared.write().track(job_id, file_name);
        self.shared.bump();
    }

    /// Fold a snapshot obtained out of band, e.g. from a point read.
    pub fn apply_snapshot(&self, job: Job) {
        if self.shared.write().apply_one(&job) {
            self.shared.bump();
        }
    }

    pub fn clear(&self) {
        self.shared.write().clear();
        self.shared.bump();
    }

    /// Close with code 1000 and stop reconnecting.
    pub async fn disconnect(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "progress client task failed");
        }
    }
}

async fn run(config: ClientConfig, shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        shared.set_state(ConnectionState::Connecting);
        let end = session(&config, &shared, &shutdown).await;
        shared.set_state(ConnectionState::Disconnected);

        match end {
            SessionEnd::Normal => {
                info!("progress connection closed normally");
                return;
            }
            SessionEnd::Shutdown => {
                debug!("progress client stopped");
                return;
            }
            SessionEnd::Abnormal(reason) => {
                warn!(
                    reason = %reason,
                    delay_ms = config.reconnect_delay.as_millis() as u64,
                    "progress connection lost, reconnecting"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(config.reconnect_delay) => {}
                }
            }
        }
    }
}

async fn session(config: &ClientConfig, shared: &Shared, shutdown: &CancellationToken) -> SessionEnd {
    let connected = tokio::select! {
        _ = shutdown.cancelled() => return SessionEnd::Shutdown,
        result = connect_async(config.progress_url.as_str()) => result,
    };
    let (ws_stream, _) = match connected {
        Ok(pair) => pair,
        Err(e) => return SessionEnd::Abnormal(format!("connect failed: {e}")),
    };
    let (mut sink, mut stream) = ws_stream.split();
    shared.set_state(ConnectionState::Connected);
    info!(url = %config.progress_url, "progress connection established");

    let subscribe = match serde_json::to_string(&ClientMessage::SubscribeImports) {
        Ok(json) => json,
        Err(e) => return SessionEnd::Abnormal(format!("encode subscribe failed: {e}")),
    };
    if let Err(e) = sink.send(Message::Text(subscribe.into())).await {
        return SessionEnd::Abnormal(format!("subscribe send failed: {e}"));
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!(error = %e, "close frame not delivered");
                }
                return SessionEnd::Shutdown;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => shared.handle_text(&text),
                Some(Ok(Message::Close(frame))) => return classify_close(frame.as_ref()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Abnormal(e.to_string()),
                None => return SessionEnd::Abnormal("connection dropped".to_string()),
            },
        }
    }
}
