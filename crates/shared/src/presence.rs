//! Account presence
//!
//! Tracks which accounts currently hold a realtime connection. Entries expire after a
//! TTL, so a crashed instance never leaves an account marked online forever; the
//! connection owner refreshes with `mark_online` on every heartbeat.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Default presence lifetime without a heartbeat
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(90);

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("presence backend error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait PresenceService: Send + Sync {
    async fn mark_online(&self, account_id: Uuid) -> Result<(), PresenceError>;

    async fn mark_offline(&self, account_id: Uuid) -> Result<(), PresenceError>;

    async fn is_online(&self, account_id: Uuid) -> Result<bool, PresenceError>;
}

/// Presence in Redis as `presence:{account_id}` keys with an expiry
#[derive(Clone)]
pub struct RedisPresence {
    redis: ConnectionManager,
    ttl: Duration,
}

impl RedisPresence {
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self { redis, ttl }
    }

    pub fn key(account_id: Uuid) -> String {
        format!("presence:{}", account_id)
    }
}

#[async_trait]
impl PresenceService for RedisPresence {
    async fn mark_online(&self, account_id: Uuid) -> Result<(), PresenceError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .set_ex(Self::key(account_id), 1, self.ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn mark_offline(&self, account_id: Uuid) -> Result<(), PresenceError> {
        let mut conn = self.redis.clone();
        let _: () = conn.del(Self::key(account_id)).await?;
        Ok(())
    }

    async fn is_online(&self, account_id: Uuid) -> Result<bool, PresenceError> {
        let mut conn = self.redis.clone();
        let online: bool = conn.exists(Self::key(account_id)).await?;
        Ok(online)
    }
}

/// Single-process presence for tests and local development
#[derive(Debug)]
pub struct MemoryPresence {
    online: RwLock<HashMap<Uuid, Instant>>,
    ttl: Duration,
}

impl Default for MemoryPresence {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TTL)
    }
}

impl MemoryPresence {
    pub fn new(ttl: Duration) -> Self {
        Self {
            online: RwLock::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl PresenceService for MemoryPresence {
    async fn mark_online(&self, account_id: Uuid) -> Result<(), PresenceError> {
        let mut online = self.online.write().await;
        online.insert(account_id, Instant::now() + self.ttl);
        Ok(())
    }

    async fn mark_offline(&self, account_id: Uuid) -> Result<(), PresenceError> {
        self.online.write().await.remove(&account_id);
        Ok(())
    }

    async fn is_online(&self, account_id: Uuid) -> Result<bool, PresenceError> {
        let online = self.online.read().await;
        Ok(online
            .get(&account_id)
            .is_some_and(|expires| *expires > Instant::now()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_presence_round_trip() {
        let presence = MemoryPresence::default();
        let account = Uuid::new_v4();

        assert!(!presence.is_online(account).await.unwrap());
        presence.mark_online(account).await.unwrap();
        assert!(presence.is_online(account).await.unwrap());
        presence.mark_offline(account).await.unwrap();
        assert!(!presence.is_online(account).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_presence_expires() {
        let presence = MemoryPresence::new(Duration::from_millis(20));
        let account = Uuid::new_v4();

        presence.mark_online(account).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!presence.is_online(account).await.unwrap());
    }

    #[test]
    fn test_redis_key_layout() {
        let account = Uuid::nil();
        assert_eq!(
            RedisPresence::key(account),
            "presence:00000000-0000-0000-0000-000000000000"
        );
    }
}
