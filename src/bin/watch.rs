use import_progress::{
    client::{ConnectionState, ProgressClient},
    config::AppConfig,
};
use tracing_subscriber::EnvFilter;

/// Follow the progress stream and log every reconciled file status.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let client = ProgressClient::spawn(config.client());
    let mut state = client.watch_state();
    let mut updates = client.watch_updates();

    tracing::info!(url = %config.progress_url, "Watching import progress");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if current == ConnectionState::Disconnected {
                    tracing::warn!("Progress stream disconnected");
                } else {
                    tracing::info!(state = ?current, "Connection state changed");
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                updates.borrow_and_update();
                for status in client.statuses() {
                    let progress = status.stats.as_ref().and_then(|s| s.progress).unwrap_or(0.0);
                    tracing::info!(
                        file_name = %status.file_name,
                        job_id = ?status.job_id,
                        status = %status.status,
                        progress = progress,
                        error = ?status.error,
                        "Import status"
                    );
                }
            }
        }
    }

    client.disconnect().await;
}
