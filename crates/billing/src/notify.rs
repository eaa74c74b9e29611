//! Billing notifications
//!
//! Fire-and-forget: a failed delivery is logged and never fails the billing operation
//! that triggered it.

use std::sync::Arc;

use async_trait::async_trait;
use patronage_shared::PresenceService;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use uuid::Uuid;

/// Pending notifications kept per offline account
const PENDING_NOTIFICATION_LIMIT: isize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    SubscriptionActivated,
    NewSubscriber,
    SubscriptionRenewed,
    SubscriptionCanceled,
    PaymentFailed,
    ContentPurchased,
    PurchaseFailed,
    RefundIssued,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, account_id: Uuid, kind: NotificationKind, payload: serde_json::Value);
}

/// Logs notifications; used when no realtime transport is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, account_id: Uuid, kind: NotificationKind, payload: serde_json::Value) {
        tracing::info!(account_id = %account_id, kind = ?kind, payload = %payload, "Notification");
    }
}

/// Publishes to `notifications:{account_id}` for online accounts and queues the message
/// in `notifications:pending:{account_id}` for offline ones
#[derive(Clone)]
pub struct RealtimeNotifier {
    redis: ConnectionManager,
    presence: Arc<dyn PresenceService>,
}

impl RealtimeNotifier {
    pub fn new(redis: ConnectionManager, presence: Arc<dyn PresenceService>) -> Self {
        Self { redis, presence }
    }

    pub fn channel(account_id: Uuid) -> String {
        format!("notifications:{}", account_id)
    }

    pub fn pending_key(account_id: Uuid) -> String {
        format!("notifications:pending:{}", account_id)
    }

    async fn deliver(&self, account_id: Uuid, message: String) -> redis::RedisResult<bool> {
        let online = match self.presence.is_online(account_id).await {
            Ok(online) => online,
            Err(e) => {
                tracing::warn!(account_id = %account_id, error = %e, "Presence lookup failed, queueing notification");
                false
            }
        };

        let mut conn = self.redis.clone();
        if online {
            let _: i64 = conn.publish(Self::channel(account_id), message).await?;
        } else {
            let key = Self::pending_key(account_id);
            let _: () = redis::pipe()
                .lpush(&key, message)
                .ignore()
                .ltrim(&key, 0, PENDING_NOTIFICATION_LIMIT - 1)
                .ignore()
                .query_async(&mut conn)
                .await?;
        }
        Ok(online)
    }
}

#[async_trait]
impl Notifier for RealtimeNotifier {
    async fn notify(&self, account_id: Uuid, kind: NotificationKind, payload: serde_json::Value) {
        let message = serde_json::json!({
            "kind": kind,
            "account_id": account_id,
            "payload": payload,
        })
        .to_string();

        match self.deliver(account_id, message).await {
            Ok(online) => {
                tracing::debug!(account_id = %account_id, kind = ?kind, online, "Notification sent");
            }
            Err(e) => {
                tracing::warn!(account_id = %account_id, kind = ?kind, error = %e, "Failed to send notification");
            }
        }
    }
}
