//! Event routing: one dispatch table over the closed kind enumeration.
//!
//! | kind        | local handler                    | remote replay            |
//! |-------------|----------------------------------|--------------------------|
//! | message     | DeliveryEngine (persist+fanout)  | fanout only              |
//! | typing      | room fanout (ephemeral)          | room fanout              |
//! | status      | StatusReconciler                 | narrowed to orig. sender |
//! | presence    | dropped (server-computed)        | room fanout              |
//! | chat_update | room fanout + cache invalidation | room fanout              |
//! | unknown     | log + drop                       | log + drop               |
//!
//! The remote path never persists and never re-publishes: those side
//! effects happened at the origin instance.

use std::sync::{Arc, RwLock};

use chat_protocol::{EventKind, StatusPayload};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::HubError;
use crate::hub::{reply_to_conn, room_fanout, EventOrigin, HubDeps, InboundEvent, Indices};
use crate::{delivery, status};

pub async fn dispatch(deps: &HubDeps, indices: &Arc<RwLock<Indices>>, event: InboundEvent) {
    match event.origin {
        EventOrigin::Local { conn_id } => {
            dispatch_local(deps, indices, event, Some(conn_id)).await;
        }
        EventOrigin::Internal => dispatch_local(deps, indices, event, None).await,
        EventOrigin::Remote => dispatch_remote(deps, indices, event).await,
    }
}

async fn dispatch_local(
    deps: &HubDeps,
    indices: &Arc<RwLock<Indices>>,
    event: InboundEvent,
    origin_conn: Option<Uuid>,
) {
    let envelope = event.envelope;
    match envelope.kind {
        EventKind::Message => delivery::deliver(deps, indices, &envelope, origin_conn).await,
        EventKind::Typing | EventKind::ChatUpdate => {
            let Some(room_id) = envelope.room_id else {
                if let Some(conn_id) = origin_conn {
                    let err = HubError::Validation("room_id is required".to_owned());
                    reply_to_conn(indices, envelope.sender, conn_id, &err.to_envelope());
                }
                return;
            };
            room_fanout(deps, indices, room_id, Some(envelope.sender), &envelope);
            if envelope.kind == EventKind::ChatUpdate {
                // Membership-derived cache entries are stale after a chat
                // update; the durable store is authoritative on re-read.
                deps.cache.invalidate_chat_members(room_id).await;
                deps.cache.invalidate_user_chats(envelope.sender).await;
            }
            deps.bridge.publish(&envelope).await;
        }
        EventKind::Status => {
            let payload: StatusPayload = match envelope.parse_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    if let Some(conn_id) = origin_conn {
                        let err = HubError::Validation(format!("bad status payload: {e}"));
                        reply_to_conn(indices, envelope.sender, conn_id, &err.to_envelope());
                    }
                    return;
                }
            };
            status::spawn_apply(
                deps.clone(),
                Arc::clone(indices),
                envelope.sender,
                payload,
                true,
            );
        }
        EventKind::Presence => {
            // Presence is computed from session transitions, never asserted
            // by a peer.
            debug!(sender = %envelope.sender, "dropping client-sent presence event");
        }
        EventKind::Error => debug!("dropping inbound error envelope"),
        EventKind::Unknown => {
            warn!(sender = %envelope.sender, "dropping envelope of unknown kind");
        }
    }
}

async fn dispatch_remote(deps: &HubDeps, indices: &Arc<RwLock<Indices>>, event: InboundEvent) {
    let envelope = event.envelope;

    // Origin suppression: a local session for the sender means this
    // envelope originated on this instance and already fanned out here.
    let sender_is_local = {
        let idx = indices.read().unwrap();
        idx.user_online(envelope.sender)
    };
    if sender_is_local {
        debug!(sender = %envelope.sender, "suppressing bridge echo of local event");
        return;
    }

    match envelope.kind {
        EventKind::Message => delivery::replay_remote(deps, indices, &envelope).await,
        EventKind::Status => status::replay_remote(deps, indices, &envelope).await,
        EventKind::Typing | EventKind::ChatUpdate | EventKind::Presence => {
            if let Some(room_id) = envelope.room_id {
                room_fanout(deps, indices, room_id, Some(envelope.sender), &envelope);
            }
        }
        EventKind::Error | EventKind::Unknown => {
            debug!("dropping remote envelope of unroutable kind");
        }
    }
}
