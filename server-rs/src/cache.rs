use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};

use crate::config::Config;
use crate::error::AppResult;

/// Best-effort JSON cache in front of immutable lookups. Redis failures are
/// logged and treated as misses.
#[derive(Clone)]
pub struct Cache {
    conn: ConnectionManager,
    prefix: String,
}

impl Cache {
    pub async fn connect(config: &Config) -> AppResult<Self> {
        let client = Client::open(config.redis_url())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: config.redis.key_prefix.clone(),
        })
    }

    fn key(&self, k: &str) -> String {
        format!("{}{}", self.prefix, k)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.conn.clone();
        let raw = match conn.get::<_, Option<String>>(self.key(key)).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::debug!(key, "cache read failed: {e}");
                return None;
            }
        };
        serde_json::from_str(&raw).ok()
    }

    /// `ttl_secs == 0` keeps the entry until evicted.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        let Ok(json) = serde_json::to_string(value) else {
            return;
        };
        let mut conn = self.conn.clone();
        let k = self.key(key);
        let result: Result<(), _> = if ttl_secs > 0 {
            conn.set_ex(&k, json, ttl_secs).await
        } else {
            conn.set(&k, json).await
        };
        if let Err(e) = result {
            tracing::debug!("cache write for {k} failed: {e}");
        }
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }
}
