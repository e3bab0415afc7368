use chat_protocol::PresencePayload;
use redis::AsyncCommands;
use tracing::warn;
use uuid::Uuid;

// Per-namespace TTLs.  All cache contents are advisory: a miss (or a cache
// outage) falls through to the durable store.
pub const PRESENCE_TTL_SECS: u64 = 5 * 60;
pub const CHATS_TTL_SECS: u64 = 10 * 60;
pub const MESSAGES_TTL_SECS: u64 = 5 * 60;
pub const CHAT_MEMBERS_TTL_SECS: u64 = 15 * 60;
pub const MSG_STATUS_TTL_SECS: u64 = 2 * 60;

/// Shared cache handle.  `disabled()` yields a no-op cache for tests and
/// for running without Redis; every operation is best-effort and logs
/// instead of propagating errors.
#[derive(Clone)]
pub struct Cache {
    conn: Option<redis::aio::ConnectionManager>,
}

impl Cache {
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Cache { conn: Some(conn) })
    }

    pub fn disabled() -> Self {
        Cache { conn: None }
    }

    /// Presence hint for other instances: `presence:{user}` with a short
    /// TTL.  The session registry stays authoritative.
    pub async fn set_presence(&self, user_id: Uuid, payload: &PresencePayload) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let Ok(json) = serde_json::to_string(payload) else {
            return;
        };
        if let Err(e) = conn
            .set_ex::<_, _, ()>(format!("presence:{user_id}"), json, PRESENCE_TTL_SECS)
            .await
        {
            warn!(error = %e, user_id = %user_id, "presence cache write failed");
        }
    }

    /// Drop the cached message list for a chat after a new message lands.
    pub async fn invalidate_messages(&self, chat_id: Uuid) {
        self.del(format!("messages:{chat_id}")).await;
    }

    /// Drop the cached status map for a message after a transition.
    pub async fn invalidate_msg_status(&self, message_id: Uuid) {
        self.del(format!("msg_status:{message_id}")).await;
    }

    /// Drop membership-derived entries after a chat_update.
    pub async fn invalidate_chat_members(&self, chat_id: Uuid) {
        self.del(format!("chat_members:{chat_id}")).await;
    }

    /// Drop a user's cached chat list after their membership changes.
    pub async fn invalidate_user_chats(&self, user_id: Uuid) {
        self.del(format!("chats:{user_id}")).await;
    }

    async fn del(&self, key: String) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        if let Err(e) = conn.del::<_, ()>(&key).await {
            warn!(error = %e, key = %key, "cache invalidation failed");
        }
    }
}
