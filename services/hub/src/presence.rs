//! Presence transitions, computed by the hub rather than reported by
//! clients: offline -> online when a user's first session registers,
//! online -> offline when their last one unregisters.

use std::sync::{Arc, RwLock};

use chat_protocol::{Envelope, EventKind, PresencePayload};
use tracing::{info, warn};
use uuid::Uuid;

use crate::hub::{room_fanout, HubDeps, Indices};
use crate::repo;

/// Fire-and-forget announce; the hub loop never blocks on presence I/O.
pub fn spawn_announce(
    deps: HubDeps,
    indices: Arc<RwLock<Indices>>,
    user_id: Uuid,
    is_online: bool,
    chats: Vec<Uuid>,
) {
    tokio::spawn(async move {
        announce(&deps, &indices, user_id, is_online, &chats).await;
    });
}

/// Emit a presence envelope to every chat the user belongs to (skipping the
/// subject's own sessions), publish the same envelopes on the bridge, and
/// refresh the `presence:{user}` cache hint.  The session registry stays
/// authoritative; the cache only lets other instances answer "is X online?"
/// without a round trip.
pub async fn announce(
    deps: &HubDeps,
    indices: &Arc<RwLock<Indices>>,
    user_id: Uuid,
    is_online: bool,
    chats: &[Uuid],
) {
    if let Err(e) = repo::users::set_online(&deps.pool, user_id, is_online).await {
        warn!(error = %e, user_id = %user_id, "presence flag update failed");
    }

    let payload = PresencePayload {
        user_id,
        is_online,
        last_seen: Some(chrono::Utc::now()),
    };
    deps.cache.set_presence(user_id, &payload).await;

    for chat_id in chats {
        let envelope = match Envelope::new(EventKind::Presence, Some(*chat_id), user_id, &payload)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "failed to build presence envelope");
                return;
            }
        };
        room_fanout(deps, indices, *chat_id, Some(user_id), &envelope);
        deps.bridge.publish(&envelope).await;
    }
    info!(user_id = %user_id, is_online, chats = chats.len(), "presence transition");
}
