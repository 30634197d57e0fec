use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Sets the value with a fresh TTL only if the current value still equals ARGV[1].
const COMPARE_AND_SET: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
    return 1
end
return 0
"#;

/// Key/value store holding serialized job snapshots with a bounded lifetime,
/// plus the pub/sub channel the snapshots are broadcast on.
///
/// There is no server-side merge: callers read, merge and write back.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Overwrite the value and reset its lifetime to `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Like [`JobStore::set`], but only when the stored value is still
    /// `expected`. Returns `false` when another writer got there first or the
    /// entry expired.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Remaining lifetime, `None` when the key does not exist.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Redis-backed job store.
pub struct RedisJobStore {
    conn: ConnectionManager,
    compare_and_set: redis::Script,
}

impl RedisJobStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            compare_and_set: redis::Script::new(COMPARE_AND_SET),
        })
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let applied: i32 = self
            .compare_and_set
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, i64>(channel, payload).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        // -2: no such key, -1: key without expiry
        let secs: i64 = conn.ttl(key).await?;
        Ok(u64::try_from(secs).ok().map(Duration::from_secs))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// A message published through a [`MemoryJobStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub channel: String,
    pub payload: String,
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process job store. Expiry follows the tokio clock, so paused-time tests
/// can advance past a TTL.
pub struct MemoryJobStore {
    entries: Mutex<HashMap<String, Entry>>,
    published: broadcast::Sender<Published>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        let (published, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(HashMap::new()),
            published,
        }
    }

    /// Receive everything published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.published.subscribe()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> T,
    ) -> Result<T, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(f(&mut entries))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entries(|entries| entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            );
        })
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.value = value.to_string();
                entry.expires_at = Instant::now() + ttl;
                true
            }
            _ => false,
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        // No subscribers is fine.
        let _ = self.published.send(Published {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.with_entries(|entries| {
            entries
                .get(key)
                .map(|e| e.expires_at.saturating_duration_since(Instant::now()))
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let store = MemoryJobStore::new();
        store.set("k", "v", DAY).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(DAY + Duration::from_secs(1)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.ttl("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_resets_ttl() {
        let store = MemoryJobStore::new();
        store.set("k", "v1", DAY).await.unwrap();
        tokio::time::advance(DAY - Duration::from_secs(10)).await;

        store.set("k", "v2", DAY).await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), Some(DAY));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = MemoryJobStore::new();
        store.set("k", "v1", DAY).await.unwrap();

        assert!(!store.compare_and_set("k", "stale", "v2", DAY).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v1"));

        assert!(store.compare_and_set("k", "v1", "v2", DAY).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));

        // Never creates a missing key
        assert!(!store.compare_and_set("missing", "", "v", DAY).await.unwrap());
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let store = MemoryJobStore::new();
        let mut rx = store.subscribe();
        store.publish("import:progress", "[]").await.unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.channel, "import:progress");
        assert_eq!(message.payload, "[]");
    }
}
