use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MemberRow {
    pub role: String,
    pub is_banned: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LeaveError {
    #[error("the creator of a group cannot leave it")]
    CreatorCannotLeave,
    #[error("user is not a member of the chat")]
    NotAMember,
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

/// All chats the user durably belongs to (bans excluded).  Drives both
/// RoomIndex registration and presence fan-out.
pub async fn member_chat_ids(pool: &PgPool, user_id: Uuid) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT chat_id FROM chat_members WHERE user_id = $1 AND is_banned = false",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.get("chat_id")).collect())
}

/// The membership row for one (chat, user), if any.
pub async fn membership(
    pool: &PgPool,
    chat_id: Uuid,
    user_id: Uuid,
) -> Result<Option<MemberRow>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT role, is_banned FROM chat_members WHERE chat_id = $1 AND user_id = $2",
    )
    .bind(chat_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| MemberRow {
        role: r.get("role"),
        is_banned: r.get("is_banned"),
    }))
}

/// Remove a member from a chat.  The creator of a group chat may never
/// leave it; anyone else may.
pub async fn leave_chat(pool: &PgPool, chat_id: Uuid, user_id: Uuid) -> Result<(), LeaveError> {
    let chat = sqlx::query("SELECT chat_type, created_by FROM chats WHERE id = $1")
        .bind(chat_id)
        .fetch_optional(pool)
        .await?
        .ok_or(LeaveError::NotAMember)?;
    let chat_type: String = chat.get("chat_type");
    let created_by: Option<Uuid> = chat.get("created_by");
    if chat_type == "group" && created_by == Some(user_id) {
        return Err(LeaveError::CreatorCannotLeave);
    }

    let result = sqlx::query("DELETE FROM chat_members WHERE chat_id = $1 AND user_id = $2")
        .bind(chat_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(LeaveError::NotAMember);
    }
    Ok(())
}

/// Archive chats whose `last_activity` is older than `days`.  Runs as a
/// single UPDATE so it serializes naturally against in-flight message
/// persists for the same chat.
pub async fn archive_inactive(pool: &PgPool, days: u32) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"UPDATE chats
           SET is_archived = true
           WHERE is_archived = false
             AND last_activity < now() - make_interval(days => $1)"#,
    )
    .bind(i32::try_from(days).unwrap_or(i32::MAX))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
