//! Patronage shared infrastructure
//!
//! Connection setup for Postgres and Redis, embedded migrations, and the presence
//! service used to route notifications.

pub mod db;
pub mod presence;

pub use db::{connect_redis, create_pool, run_migrations, DbConfig};
pub use presence::{
    MemoryPresence, PresenceError, PresenceService, RedisPresence, DEFAULT_PRESENCE_TTL,
};
