use super::CounterStore;
use crate::config::StoreSettings;
use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, IntoConnectionInfo, RedisError, Script};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, warn};

/// Increment, and set the expiry only on the increment that created the key.
const INCR_WITH_FIRST_EXPIRY: &str = r#"
local key, increment, ttl = KEYS[1], tonumber(ARGV[1]), ARGV[2]
local value = redis.call("INCRBY", key, increment)
if value == increment then
    redis.call("EXPIRE", key, ttl)
end
return value
"#;

/// Redis-backed counter store sharing one multiplexed connection.
///
/// The connection is opened on first use so an unreachable server does not
/// prevent startup; requests made meanwhile fail open.
pub struct RedisStore {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    script: Script,
    timeout: Duration,
}

impl RedisStore {
    pub fn new(settings: &StoreSettings) -> Result<Self, StoreError> {
        let mut info = (settings.host.as_str(), settings.port).into_connection_info()?;
        info.redis.db = settings.db;
        info.redis.password = settings.password.clone();

        let client = Client::open(info)?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            script: Script::new(INCR_WITH_FIRST_EXPIRY),
            timeout: settings.timeout,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut slot = self.connection.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = time::timeout(self.timeout, self.client.get_multiplexed_tokio_connection())
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;
        debug!(target: "custom_ratelimit::store", "redis connection established");

        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drop a connection that can no longer carry commands so the next call reconnects.
    async fn discard_if_broken(&self, err: &RedisError) {
        if err.is_io_error() || err.is_connection_dropped() {
            warn!(target: "custom_ratelimit::store", error = %err, "discarding redis connection");
            *self.connection.write().await = None;
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr_with_first_expiry(
        &self,
        key: &str,
        by: i64,
        ttl: Duration,
    ) -> Result<Option<i64>, StoreError> {
        let mut conn = self.connection().await?;

        let result: Result<Option<i64>, RedisError> = self
            .script
            .key(key)
            .arg(by)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.discard_if_broken(&err).await;
                Err(err.into())
            }
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        let reply = time::timeout(
            self.timeout,
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.timeout))?;

        match reply {
            Ok(pong) if pong == "PONG" => Ok(()),
            Ok(other) => Err(StoreError::Unavailable(format!("unexpected ping reply '{}'", other))),
            Err(err) => {
                self.discard_if_broken(&err).await;
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(port: u16) -> StoreSettings {
        StoreSettings {
            host: "127.0.0.1".to_string(),
            port,
            password: Some("secret".to_string()),
            db: 3,
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_client_is_built_without_connecting() {
        assert!(RedisStore::new(&settings(6379)).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_store_error() {
        // Port 1 is reserved and never has a redis behind it.
        let store = RedisStore::new(&settings(1)).unwrap();
        let result = store
            .incr_with_first_expiry("kong:customratelimit:x:qps:1", 1, Duration::from_secs(1))
            .await;
        assert!(matches!(
            result,
            Err(StoreError::Redis(_)) | Err(StoreError::Timeout(_))
        ));
        assert!(store.ping().await.is_err());
    }

    fn live_store() -> RedisStore {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisStore {
            client: Client::open(url).unwrap(),
            connection: RwLock::new(None),
            script: Script::new(INCR_WITH_FIRST_EXPIRY),
            timeout: Duration::from_secs(2),
        }
    }

    async fn pttl(store: &RedisStore, key: &str) -> i64 {
        let mut conn = store.connection().await.unwrap();
        redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running redis (REDIS_URL)"]
    async fn test_live_expiry_is_anchored_to_first_increment() {
        let store = live_store();
        let key = format!("kong:customratelimit:test:{}:qps:1", uuid::Uuid::new_v4());
        let ttl = Duration::from_secs(60);

        assert_eq!(store.incr_with_first_expiry(&key, 1, ttl).await.unwrap(), Some(1));
        let anchored = pttl(&store, &key).await;
        assert!(anchored > 0 && anchored <= 60_000);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.incr_with_first_expiry(&key, 1, ttl).await.unwrap(), Some(2));
        assert!(pttl(&store, &key).await < anchored);

        let mut conn = store.connection().await.unwrap();
        let _: () = redis::cmd("DEL").arg(&key).query_async(&mut conn).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running redis (REDIS_URL)"]
    async fn test_live_concurrent_increments_have_no_gaps() {
        let store = std::sync::Arc::new(live_store());
        let key = format!("kong:customratelimit:test:{}:qps:1", uuid::Uuid::new_v4());

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .incr_with_first_expiry(&key, 1, Duration::from_secs(60))
                    .await
                    .unwrap()
                    .unwrap()
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=50).collect::<Vec<i64>>());
        assert!(pttl(&store, &key).await > 0);

        let mut conn = store.connection().await.unwrap();
        let _: () = redis::cmd("DEL").arg(&key).query_async(&mut conn).await.unwrap();
    }
}
