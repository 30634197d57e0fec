use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::models::message::{decode_channel_payload, ClientMessage, ProgressData, ServerMessage};
use crate::services::gateway::ProgressHub;

/// GET /ws — progress stream. Nothing is forwarded until the client sends
/// `{"type":"subscribe:imports"}`.
pub async fn progress_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: ProgressHub) {
    let (mut sink, mut stream) = socket.split();
    let mut subscription: Option<broadcast::Receiver<Arc<str>>> = None;

    metrics::gauge!("progress_gateway_connections").increment(1.0);
    debug!("progress connection opened");

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::SubscribeImports) => {
                        if subscription.is_none() {
                            subscription = Some(hub.subscribe());
                            info!("client subscribed to import progress");
                        }
                        if send(&mut sink, &ServerMessage::Subscribed).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring unknown client message"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Pong is handled automatically by axum
                Some(Ok(_)) => {}
            },
            payload = next_payload(&mut subscription) => match payload {
                Ok(payload) => {
                    if forward(&mut sink, &payload).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "progress connection lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    metrics::gauge!("progress_gateway_connections").decrement(1.0);
    debug!("progress connection closed");
}

async fn next_payload(
    subscription: &mut Option<broadcast::Receiver<Arc<str>>>,
) -> Result<Arc<str>, broadcast::error::RecvError> {
    match subscription {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Unwrap a channel payload (an array of snapshots) into one message per snapshot.
async fn forward(
    sink: &mut SplitSink<WebSocket, Message>,
    payload: &str,
) -> Result<(), axum::Error> {
    let jobs = match decode_channel_payload(payload) {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "dropping malformed progress payload");
            return Ok(());
        }
    };
    for job in jobs {
        send(sink, &ServerMessage::ImportProgress(ProgressData::One(Box::new(job)))).await?;
    }
    Ok(())
}

async fn send(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(json) => sink.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "failed to encode server message");
            Ok(())
        }
    }
}
