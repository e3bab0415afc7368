//! Background archival: chats with no activity past the configured
//! threshold are flagged archived.  Runs as a single UPDATE per sweep, so
//! it serializes against in-flight message persists for the same chat.

use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::repo;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub fn spawn_archive_task(
    pool: PgPool,
    archive_after_days: u32,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    match repo::chats::archive_inactive(&pool, archive_after_days).await {
                        Ok(0) => {}
                        Ok(n) => info!(archived = n, "archived inactive chats"),
                        Err(e) => warn!(error = %e, "archival sweep failed"),
                    }
                }
            }
        }
    })
}
