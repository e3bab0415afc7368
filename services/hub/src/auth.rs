use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::HubError;
use crate::repo;

/// The authenticated identity behind one connection.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub user_id: Uuid,
    pub session_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id.
    sub: Uuid,
    /// `user_sessions` row id.
    sid: Uuid,
    exp: i64,
}

/// Validate a bearer token: HS256 signature and expiry first, then the
/// `sid` claim against the `user_sessions` table (a revoked or expired
/// session row invalidates an otherwise-valid token).
pub async fn authenticate(
    pool: &PgPool,
    secret: &str,
    token: &str,
) -> Result<Identity, HubError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| HubError::Auth(e.to_string()))?;

    let active = repo::sessions::session_is_active(pool, data.claims.sid, data.claims.sub)
        .await
        .map_err(HubError::Storage)?;
    if !active {
        return Err(HubError::Auth("unknown or revoked session".to_owned()));
    }

    Ok(Identity {
        user_id: data.claims.sub,
        session_id: data.claims.sid,
    })
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

/// Mint a token for a (user, session) pair.  Token issuance belongs to the
/// external token service; this exists for tests and local tooling.
pub fn encode_token(
    secret: &str,
    user_id: Uuid,
    session_id: Uuid,
    ttl_secs: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user_id,
        sid: session_id,
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}
