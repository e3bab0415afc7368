use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub content_type: String,
    pub reply_to: Option<Uuid>,
    pub forward_from: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub sent_at: DateTime<Utc>,
}

/// chat_id and sender_id of a message, for status routing.
#[derive(Debug, Clone, Copy)]
pub struct MessageMeta {
    pub chat_id: Uuid,
    pub sender_id: Uuid,
}

/// Persist one chat message and its per-recipient status rows in a single
/// transaction:
///
/// 1. insert the message (`sent`),
/// 2. load the current member set,
/// 3. one status row per member -- `delivered` for the sender (they already
///    possess the message), `sent` for everyone else,
/// 4. stamp `delivered_at` (the sender's copy counts as first delivery),
/// 5. bump `chats.last_activity`.
///
/// Returns the stored row plus the member set loaded inside the
/// transaction, which is the authoritative recipient list for fan-out.
pub async fn insert_with_statuses(
    pool: &PgPool,
    new: &NewMessage,
) -> Result<(StoredMessage, Vec<Uuid>), sqlx::Error> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"INSERT INTO messages (id, chat_id, sender_id, content, content_type, reply_to, forward_from)
           VALUES ($1, $2, $3, $4, $5, $6, $7)
           RETURNING id, sent_at"#,
    )
    .bind(Uuid::new_v4())
    .bind(new.chat_id)
    .bind(new.sender_id)
    .bind(&new.content)
    .bind(&new.content_type)
    .bind(new.reply_to)
    .bind(new.forward_from)
    .fetch_one(&mut *tx)
    .await?;
    let message_id: Uuid = row.get("id");
    let sent_at: DateTime<Utc> = row.get("sent_at");

    let member_rows = sqlx::query(
        "SELECT user_id FROM chat_members WHERE chat_id = $1 AND is_banned = false",
    )
    .bind(new.chat_id)
    .fetch_all(&mut *tx)
    .await?;
    let members: Vec<Uuid> = member_rows.into_iter().map(|r| r.get("user_id")).collect();

    for member in &members {
        let status = if *member == new.sender_id {
            "delivered"
        } else {
            "sent"
        };
        sqlx::query(
            r#"INSERT INTO message_status (message_id, user_id, status)
               VALUES ($1, $2, $3)
               ON CONFLICT (message_id, user_id) DO NOTHING"#,
        )
        .bind(message_id)
        .bind(member)
        .bind(status)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("UPDATE messages SET delivered_at = now() WHERE id = $1")
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("UPDATE chats SET last_activity = now() WHERE id = $1")
        .bind(new.chat_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok((
        StoredMessage {
            id: message_id,
            chat_id: new.chat_id,
            sender_id: new.sender_id,
            sent_at,
        },
        members,
    ))
}

pub async fn fetch_meta(
    pool: &PgPool,
    message_id: Uuid,
) -> Result<Option<MessageMeta>, sqlx::Error> {
    let row = sqlx::query("SELECT chat_id, sender_id FROM messages WHERE id = $1")
        .bind(message_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| MessageMeta {
        chat_id: r.get("chat_id"),
        sender_id: r.get("sender_id"),
    }))
}
