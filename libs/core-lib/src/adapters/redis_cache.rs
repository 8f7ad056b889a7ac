use crate::{Cache, CoreError};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, RedisError, aio::MultiplexedConnection};
use tracing::info;

const KEY_PREFIX: &str = "booking:";

/// Redis implementation of the Cache port. Sessions and cached listings
/// live here when `REDIS_URL` is set. Keys are namespaced so the instance
/// can be shared with other services.
#[derive(Clone, Debug)]
pub struct RedisCache {
    connection: MultiplexedConnection,
    default_ttl_seconds: u64,
}

fn infra(e: RedisError) -> CoreError {
    CoreError::Infrastructure(Box::new(e))
}

fn namespaced(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

impl RedisCache {
    pub async fn new(redis_url: &str, default_ttl_seconds: u64) -> Result<Self, CoreError> {
        let client = Client::open(redis_url)
            .map_err(|e| CoreError::Configuration(format!("Invalid Redis URL: {}", e)))?;
        let connection = client.get_multiplexed_tokio_connection().await.map_err(infra)?;
        info!(default_ttl_seconds, "Redis cache connected");
        Ok(Self {
            connection,
            default_ttl_seconds,
        })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let mut conn = self.connection.clone();
        conn.get(namespaced(key)).await.map_err(infra)
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl_seconds: Option<u64>,
    ) -> Result<(), CoreError> {
        let mut conn = self.connection.clone();
        // SETEX rejects a zero expiry.
        let ttl = ttl_seconds.unwrap_or(self.default_ttl_seconds).max(1);
        conn.set_ex(namespaced(key), value, ttl).await.map_err(infra)
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        let mut conn = self.connection.clone();
        conn.del(namespaced(key))
            .await
            .map(|_: usize| ())
            .map_err(infra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use testcontainers::ContainerAsync;
    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::redis::Redis as RedisImage;
    use tokio::time::sleep;

    async fn setup_redis(default_ttl_seconds: u64) -> (RedisCache, ContainerAsync<RedisImage>) {
        let node = RedisImage::default()
            .start()
            .await
            .expect("Failed to start Redis container");
        let port = node
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get host port");
        let cache = RedisCache::new(&format!("redis://localhost:{port}/"), default_ttl_seconds)
            .await
            .expect("Failed to connect to testcontainer Redis");
        (cache, node)
    }

    #[tokio::test]
    #[ignore = "requires a Docker daemon"]
    async fn test_session_round_trip_and_delete() {
        let (cache, _node) = setup_redis(3600).await;
        let key = "session:token-1";
        let value = br#"{"user_id":"u1","role":"admin"}"#.to_vec();

        cache.set(key, &value, None).await.expect("SET failed");
        assert_eq!(cache.get(key).await.expect("GET failed"), Some(value));

        cache.delete(key).await.expect("DEL failed");
        assert_eq!(cache.get(key).await.expect("GET failed"), None);
        assert_eq!(cache.get("session:unknown").await.expect("GET failed"), None);
    }

    #[tokio::test]
    #[ignore = "requires a Docker daemon"]
    async fn test_explicit_ttl_expires() {
        let (cache, _node) = setup_redis(3600).await;
        cache
            .set("registrations:pending", b"[]", Some(1))
            .await
            .expect("SET with TTL failed");
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.get("registrations:pending").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "requires a Docker daemon"]
    async fn test_default_ttl_expires() {
        let (cache, _node) = setup_redis(1).await;
        cache.set("session:short", b"x", None).await.expect("SET failed");
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.get("session:short").await.unwrap(), None);
    }
}
