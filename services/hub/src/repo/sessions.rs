use sqlx::PgPool;
use uuid::Uuid;

/// Check the session row named by a token's `sid` claim: it must exist,
/// belong to the token's user, not be revoked, and not be expired.
pub async fn session_is_active(
    pool: &PgPool,
    session_id: Uuid,
    user_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"SELECT id FROM user_sessions
           WHERE id = $1 AND user_id = $2
             AND revoked_at IS NULL
             AND expires_at > now()"#,
    )
    .bind(session_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}
