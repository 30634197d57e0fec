//! Shared helpers for integration tests: fault-injecting stores and an
//! in-process gateway.

#![allow(dead_code)]

use async_trait::async_trait;
use import_progress::{
    app_state::AppState,
    config::JobProcessingConfig,
    models::job::Job,
    routes,
    services::{
        gateway::{spawn_memory_forwarder, ProgressHub},
        job_status::JobStatusService,
        store::{JobStore, MemoryJobStore, StoreError},
    },
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Write `job` straight into the store, as `JobQueue::enqueue` seeds it.
pub async fn seed(store: &dyn JobStore, config: &JobProcessingConfig, job: &Job) {
    store
        .set(
            &config.job_key(&job.job_id),
            &serde_json::to_string(job).unwrap(),
            config.job_ttl,
        )
        .await
        .unwrap();
}

pub async fn stored(store: &dyn JobStore, config: &JobProcessingConfig, job_id: &str) -> Option<Job> {
    store
        .get(&config.job_key(job_id))
        .await
        .unwrap()
        .map(|raw| serde_json::from_str(&raw).unwrap())
}

/// Memory store whose first `failures` reads fail, and whose publishes can be
/// made to fail.
pub struct FlakyStore {
    pub inner: MemoryJobStore,
    failures_left: AtomicU32,
    pub reads: AtomicU32,
    fail_publish: bool,
}

impl FlakyStore {
    pub fn failing_reads(failures: u32) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            failures_left: AtomicU32::new(failures),
            reads: AtomicU32::new(0),
            fail_publish: false,
        }
    }

    pub fn failing_publish() -> Self {
        Self {
            fail_publish: true,
            ..Self::failing_reads(0)
        }
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.inner.set(key, value, ttl).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.inner.compare_and_set(key, expected, value, ttl).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        if self.fail_publish {
            return Err(StoreError::Unavailable("publish rejected".to_string()));
        }
        self.inner.publish(channel, payload).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.inner.ttl(key).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

/// Memory store that lets a competing writer land between the service's read
/// and its first conditional write.
pub struct RacingStore {
    pub inner: MemoryJobStore,
    competing_value: std::sync::Mutex<Option<String>>,
    pub writes_attempted: AtomicU32,
}

impl RacingStore {
    pub fn new(competing_value: String) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            competing_value: std::sync::Mutex::new(Some(competing_value)),
            writes_attempted: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl JobStore for RacingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.inner.set(key, value, ttl).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.writes_attempted.fetch_add(1, Ordering::SeqCst);
        let competing = self.competing_value.lock().unwrap().take();
        if let Some(competing) = competing {
            self.inner.set(key, &competing, ttl).await?;
        }
        self.inner.compare_and_set(key, expected, value, ttl).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.inner.publish(channel, payload).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.inner.ttl(key).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

/// Config with a short retry delay for tests that run on the real clock.
pub fn fast_config() -> JobProcessingConfig {
    JobProcessingConfig {
        retry_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

/// A gateway served on an ephemeral local port, backed by a memory store.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub store: Arc<MemoryJobStore>,
    pub status: Arc<JobStatusService>,
    pub hub: ProgressHub,
}

impl TestGateway {
    pub async fn start() -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let config = fast_config();
        let hub = ProgressHub::new();
        spawn_memory_forwarder(store.subscribe(), config.progress_channel.clone(), hub.clone());

        let state = AppState::new(store.clone(), JobStatusService::new(store.clone(), config), hub.clone());
        let status = state.status.clone();
        let app = routes::router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            store,
            status,
            hub,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Wait until `n` connections have subscribed.
    pub async fn wait_for_subscribers(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.hub.subscriber_count() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriber never arrived");
    }
}
