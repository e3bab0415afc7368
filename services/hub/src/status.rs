//! Status reconciliation: applying delivered/read transitions against the
//! durable store with monotone progress, then notifying the original
//! sender -- locally by scanning their sessions, remotely via the bridge.

use std::sync::{Arc, RwLock};

use chat_protocol::{DeliveryStatus, Envelope, EventKind, StatusPayload};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hub::{user_fanout, HubDeps, Indices};
use crate::repo;
use crate::repo::status::AppliedTransition;

/// Transitions run on their own task: they touch the store and must never
/// stall the hub loop.
pub fn spawn_apply(
    deps: HubDeps,
    indices: Arc<RwLock<Indices>>,
    issuer: Uuid,
    payload: StatusPayload,
    republish: bool,
) {
    tokio::spawn(async move {
        apply(&deps, &indices, issuer, payload, republish).await;
    });
}

/// Apply one transition (or the bulk mark-chat-read form) and notify.  A
/// no-op transition -- the monotone floor discarded it -- produces no
/// notification frame.
pub async fn apply(
    deps: &HubDeps,
    indices: &Arc<RwLock<Indices>>,
    issuer: Uuid,
    payload: StatusPayload,
    republish: bool,
) {
    match payload.message_id {
        Some(message_id) => {
            if payload.status == DeliveryStatus::Sent {
                debug!(issuer = %issuer, "dropping no-op sent transition");
                return;
            }
            match repo::status::apply_transition(&deps.pool, message_id, issuer, payload.status)
                .await
            {
                Ok(Some(applied)) => {
                    deps.cache.invalidate_msg_status(message_id).await;
                    notify_sender(deps, indices, issuer, &applied, payload.status, republish)
                        .await;
                }
                Ok(None) => {
                    debug!(message_id = %message_id, issuer = %issuer, "status transition was a no-op");
                }
                Err(e) => {
                    warn!(error = %e, message_id = %message_id, "status transition failed");
                }
            }
        }
        None => {
            // Bulk form: mark the entire chat read.
            let Some(chat_id) = payload.chat_id else {
                warn!(issuer = %issuer, "status event carries neither message_id nor chat_id");
                return;
            };
            if payload.status != DeliveryStatus::Read {
                warn!(issuer = %issuer, "bulk status form only supports read");
                return;
            }
            match repo::status::mark_chat_read(&deps.pool, chat_id, issuer).await {
                Ok(changed) => {
                    for applied in &changed {
                        deps.cache.invalidate_msg_status(applied.message_id).await;
                        notify_sender(
                            deps,
                            indices,
                            issuer,
                            applied,
                            DeliveryStatus::Read,
                            republish,
                        )
                        .await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, chat_id = %chat_id, "mark chat read failed");
                }
            }
        }
    }
}

/// Remote-replay path: the transition was persisted at the origin, so this
/// instance only forwards the frame to the original sender's sessions.
pub async fn replay_remote(deps: &HubDeps, indices: &Arc<RwLock<Indices>>, envelope: &Envelope) {
    let payload: StatusPayload = match envelope.parse_payload() {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "dropping undecodable remote status payload");
            return;
        }
    };
    let Some(message_id) = payload.message_id else {
        return;
    };
    match repo::messages::fetch_meta(&deps.pool, message_id).await {
        Ok(Some(meta)) => {
            user_fanout(deps, indices, meta.sender_id, envelope);
        }
        Ok(None) => debug!(message_id = %message_id, "remote status for unknown message"),
        Err(e) => warn!(error = %e, "failed to resolve remote status target"),
    }
}

async fn notify_sender(
    deps: &HubDeps,
    indices: &Arc<RwLock<Indices>>,
    issuer: Uuid,
    applied: &AppliedTransition,
    status: DeliveryStatus,
    republish: bool,
) {
    let payload = StatusPayload {
        message_id: Some(applied.message_id),
        status,
        chat_id: Some(applied.chat_id),
    };
    let envelope = match Envelope::new(EventKind::Status, Some(applied.chat_id), issuer, &payload)
    {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "failed to build status envelope");
            return;
        }
    };
    user_fanout(deps, indices, applied.sender_id, &envelope);
    if republish {
        deps.bridge.publish(&envelope).await;
    }
}
