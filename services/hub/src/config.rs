use std::env;
use std::time::Duration;

/// Process configuration, read once at startup.
///
/// `DATABASE_URL`, `REDIS_URL` and `AUTH_SECRET` are required; everything
/// else has a default.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub bind_addr: String,
    pub auth_secret: String,
    /// Chats with no activity for this many days are archived by the
    /// cleanup worker.
    pub archive_after_days: u32,
    /// Grace period before remaining connections are hard-closed on
    /// shutdown.
    pub shutdown_grace: Duration,
}

#[derive(Debug, thiserror::Error)]
#[error("missing required environment variable {0}")]
pub struct MissingVar(pub &'static str);

fn required(name: &'static str) -> Result<String, MissingVar> {
    env::var(name).map_err(|_| MissingVar(name))
}

impl Config {
    pub fn from_env() -> Result<Self, MissingVar> {
        Ok(Config {
            database_url: required("DATABASE_URL")?,
            redis_url: required("REDIS_URL")?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            auth_secret: required("AUTH_SECRET")?,
            archive_after_days: env::var("ARCHIVE_AFTER_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            shutdown_grace: Duration::from_secs(
                env::var("SHUTDOWN_GRACE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
        })
    }
}
