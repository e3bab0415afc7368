//! The delivery engine: persist a chat message, compute per-recipient
//! initial status, fan out to local subscribers, and hand the event to the
//! rest of the fleet.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chat_protocol::{
    DeliveryStatus, Envelope, EventKind, MessageEvent, MessagePayload, StatusPayload,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::HubError;
use crate::hub::{reply_to_conn, room_fanout, HubDeps, Indices};
use crate::repo;
use crate::repo::messages::NewMessage;
use crate::status;

/// Handle a locally-originated `message` event end to end:
///
/// 1. authorize the sender against durable membership,
/// 2. persist message + per-recipient statuses in one transaction,
/// 3. classify recipients against the UserIndex snapshot,
/// 4. fan out locally (skipping the sender's own sessions) and kick off
///    async `delivered` transitions for locally-online recipients,
/// 5. publish once on the sync topic,
/// 6. drop the cached message list for the chat.
///
/// Runs inline on the hub loop so messages within a chat fan out in the
/// order they arrived on the Broadcast channel.
pub async fn deliver(
    deps: &HubDeps,
    indices: &Arc<RwLock<Indices>>,
    envelope: &Envelope,
    origin_conn: Option<Uuid>,
) {
    let sender = envelope.sender;

    let payload: MessagePayload = match envelope.parse_payload() {
        Ok(payload) => payload,
        Err(e) => {
            reply_error(
                indices,
                sender,
                origin_conn,
                &HubError::Validation(format!("bad message payload: {e}")),
            );
            return;
        }
    };
    // Empty content is rejected upstream by the control plane; a frame that
    // reaches here with none is a protocol violation.
    if payload.content.is_empty() {
        reply_error(
            indices,
            sender,
            origin_conn,
            &HubError::Validation("empty content".to_owned()),
        );
        return;
    }

    match repo::chats::membership(&deps.pool, payload.chat_id, sender).await {
        Ok(Some(member)) if !member.is_banned => {}
        Ok(_) => {
            reply_error(
                indices,
                sender,
                origin_conn,
                &HubError::NotAMember(payload.chat_id),
            );
            return;
        }
        Err(e) => {
            reply_error(indices, sender, origin_conn, &HubError::Storage(e));
            return;
        }
    }

    let new = NewMessage {
        chat_id: payload.chat_id,
        sender_id: sender,
        content: payload.content.clone(),
        content_type: payload.content_type.clone(),
        reply_to: payload.reply_to,
        forward_from: payload.forward_from,
    };
    let (stored, members) = match repo::messages::insert_with_statuses(&deps.pool, &new).await {
        Ok(result) => result,
        Err(e) => {
            // Nothing was committed; the client may retry.
            reply_error(indices, sender, origin_conn, &HubError::Storage(e));
            return;
        }
    };
    debug!(message_id = %stored.id, chat_id = %stored.chat_id, "message persisted");

    // Members with a local session get delivered-transitions; everyone else
    // may still be online on another instance and is covered by the
    // publish below.
    let locally_online = {
        let idx = indices.read().unwrap();
        idx.filter_online(members.iter())
    };

    let event = MessageEvent {
        message_id: stored.id,
        chat_id: stored.chat_id,
        sender_id: sender,
        content: payload.content,
        content_type: payload.content_type,
        reply_to: payload.reply_to,
        forward_from: payload.forward_from,
        forwarded: payload.forwarded,
        sent_at: stored.sent_at,
    };
    let out = match Envelope::new(EventKind::Message, Some(stored.chat_id), sender, &event) {
        Ok(out) => out,
        Err(e) => {
            warn!(error = %e, "failed to build message envelope");
            return;
        }
    };

    room_fanout(deps, indices, stored.chat_id, Some(sender), &out);

    for recipient in locally_online.into_iter().filter(|u| *u != sender) {
        status::spawn_apply(
            deps.clone(),
            Arc::clone(indices),
            recipient,
            StatusPayload {
                message_id: Some(stored.id),
                status: DeliveryStatus::Delivered,
                chat_id: Some(stored.chat_id),
            },
            true,
        );
    }

    deps.bridge.publish(&out).await;
    deps.cache.invalidate_messages(stored.chat_id).await;
}

/// Bridge-replay path: the message is already durable at its origin, so
/// this instance only fans out to its own subscribers and records delivery
/// for the recipients it hosts (the shared store makes that transition
/// idempotent).
pub async fn replay_remote(deps: &HubDeps, indices: &Arc<RwLock<Indices>>, envelope: &Envelope) {
    let event: MessageEvent = match envelope.parse_payload() {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "dropping undecodable remote message payload");
            return;
        }
    };

    room_fanout(deps, indices, event.chat_id, Some(event.sender_id), envelope);

    let local_recipients: HashSet<Uuid> = {
        let idx = indices.read().unwrap();
        idx.room_snapshot(event.chat_id)
            .iter()
            .map(|s| s.user_id)
            .filter(|u| *u != event.sender_id)
            .collect()
    };
    for recipient in local_recipients {
        status::spawn_apply(
            deps.clone(),
            Arc::clone(indices),
            recipient,
            StatusPayload {
                message_id: Some(event.message_id),
                status: DeliveryStatus::Delivered,
                chat_id: Some(event.chat_id),
            },
            true,
        );
    }
}

fn reply_error(
    indices: &Arc<RwLock<Indices>>,
    user_id: Uuid,
    origin_conn: Option<Uuid>,
    error: &HubError,
) {
    warn!(user_id = %user_id, error = %error, "message event rejected");
    if let Some(conn_id) = origin_conn {
        reply_to_conn(indices, user_id, conn_id, &error.to_envelope());
    }
}
