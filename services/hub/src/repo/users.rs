use sqlx::PgPool;
use uuid::Uuid;

/// Record that a user has come online or gone offline, stamping `last_seen`
/// either way.
pub async fn set_online(pool: &PgPool, user_id: Uuid, online: bool) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET is_online = $1, last_seen = now() WHERE id = $2")
        .bind(online)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Opportunistic `last_seen` bump on session activity.
pub async fn touch_last_seen(pool: &PgPool, user_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET last_seen = now() WHERE id = $1")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// No sessions exist at boot, so any `is_online = true` row is a leftover
/// from an unclean shutdown.
pub async fn reset_stale_online(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE users SET is_online = false WHERE is_online = true")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
