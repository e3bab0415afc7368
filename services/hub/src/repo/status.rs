use chat_protocol::DeliveryStatus;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// A status transition that actually changed durable state.
#[derive(Debug, Clone)]
pub struct AppliedTransition {
    pub message_id: Uuid,
    pub chat_id: Uuid,
    /// Sender of the original message -- the party to notify.
    pub sender_id: Uuid,
}

/// Upsert a per-recipient status with a monotone floor: the row only moves
/// forward along `sent -> delivered -> read`.  Returns `None` when the
/// transition was a no-op (row already at or past the new status), in which
/// case no notification is owed.
pub async fn apply_transition(
    pool: &PgPool,
    message_id: Uuid,
    user_id: Uuid,
    new_status: DeliveryStatus,
) -> Result<Option<AppliedTransition>, sqlx::Error> {
    let Some(meta) = super::messages::fetch_meta(pool, message_id).await? else {
        return Ok(None);
    };

    let result = sqlx::query(
        r#"INSERT INTO message_status (message_id, user_id, status)
           VALUES ($1, $2, $3)
           ON CONFLICT (message_id, user_id) DO UPDATE
           SET status = EXCLUDED.status, updated_at = now()
           WHERE CASE message_status.status WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 ELSE 2 END
               < CASE EXCLUDED.status WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 ELSE 2 END"#,
    )
    .bind(message_id)
    .bind(user_id)
    .bind(new_status.as_str())
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Ok(None);
    }

    stamp_message_times(pool, message_id, new_status).await?;
    if new_status == DeliveryStatus::Read {
        bump_last_read(pool, meta.chat_id, user_id).await?;
    }

    Ok(Some(AppliedTransition {
        message_id,
        chat_id: meta.chat_id,
        sender_id: meta.sender_id,
    }))
}

/// First delivery / first read wins: `COALESCE` keeps the earliest stamp.
async fn stamp_message_times(
    pool: &PgPool,
    message_id: Uuid,
    status: DeliveryStatus,
) -> Result<(), sqlx::Error> {
    match status {
        DeliveryStatus::Delivered => {
            sqlx::query(
                "UPDATE messages SET delivered_at = COALESCE(delivered_at, now()) WHERE id = $1",
            )
            .bind(message_id)
            .execute(pool)
            .await?;
        }
        DeliveryStatus::Read => {
            sqlx::query(
                r#"UPDATE messages
                   SET delivered_at = COALESCE(delivered_at, now()),
                       read_at = COALESCE(read_at, now())
                   WHERE id = $1"#,
            )
            .bind(message_id)
            .execute(pool)
            .await?;
        }
        DeliveryStatus::Sent => {}
    }
    Ok(())
}

async fn bump_last_read(pool: &PgPool, chat_id: Uuid, user_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE chat_members SET last_read_at = now() WHERE chat_id = $1 AND user_id = $2",
    )
    .bind(chat_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Bulk "mark entire chat read": bump `last_read_at`, upsert `read` for
/// every not-yet-read message in the chat that the user did not send, and
/// backfill `messages.read_at` where null.  Returns one entry per message
/// that actually transitioned, for sender notification.
pub async fn mark_chat_read(
    pool: &PgPool,
    chat_id: Uuid,
    user_id: Uuid,
) -> Result<Vec<AppliedTransition>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE chat_members SET last_read_at = now() WHERE chat_id = $1 AND user_id = $2",
    )
    .bind(chat_id)
    .bind(user_id)
    .execute(&mut *tx)
    .await?;

    let rows = sqlx::query(
        r#"UPDATE message_status ms
           SET status = 'read', updated_at = now()
           FROM messages m
           WHERE ms.message_id = m.id
             AND m.chat_id = $1
             AND ms.user_id = $2
             AND ms.status <> 'read'
             AND m.sender_id <> $2
             AND m.sent_at <= now()
           RETURNING ms.message_id, m.sender_id"#,
    )
    .bind(chat_id)
    .bind(user_id)
    .fetch_all(&mut *tx)
    .await?;

    let changed: Vec<AppliedTransition> = rows
        .into_iter()
        .map(|r| AppliedTransition {
            message_id: r.get("message_id"),
            chat_id,
            sender_id: r.get("sender_id"),
        })
        .collect();

    if !changed.is_empty() {
        let ids: Vec<Uuid> = changed.iter().map(|c| c.message_id).collect();
        sqlx::query(
            r#"UPDATE messages
               SET delivered_at = COALESCE(delivered_at, now()),
                   read_at = COALESCE(read_at, now())
               WHERE id = ANY($1)"#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(changed)
}
