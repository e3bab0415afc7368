//! Read receipts: monotone per-(message, user) progress, COALESCE
//! timestamps, sender notification, and the bulk mark-chat-read form.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chat_protocol::{
    DeliveryStatus, Envelope, EventKind, MessageEvent, MessagePayload, StatusPayload,
};
use chat_test_utils::MockWsClient;
use hub::bridge::LoopbackBus;
use uuid::Uuid;

fn message_envelope(chat_id: Uuid, sender: Uuid, content: &str) -> Envelope {
    Envelope::new(
        EventKind::Message,
        Some(chat_id),
        sender,
        &MessagePayload {
            chat_id,
            content: content.to_owned(),
            content_type: "text".to_owned(),
            reply_to: None,
            forward_from: None,
            forwarded: false,
        },
    )
    .unwrap()
}

fn status_envelope(chat_id: Uuid, sender: Uuid, payload: &StatusPayload) -> Envelope {
    Envelope::new(EventKind::Status, Some(chat_id), sender, payload).unwrap()
}

async fn status_of(pool: &sqlx::PgPool, message_id: Uuid, user_id: Uuid) -> String {
    let (status,): (String,) =
        sqlx::query_as("SELECT status FROM message_status WHERE message_id = $1 AND user_id = $2")
            .bind(message_id)
            .bind(user_id)
            .fetch_one(pool)
            .await
            .unwrap();
    status
}

#[tokio::test]
async fn read_receipt_is_monotone_and_notifies_the_sender() {
    let (_container, pool) = common::start_postgres().await;
    let hub = common::start_hub(pool.clone(), Arc::new(LoopbackBus::new())).await;

    let alice = common::seed_user(&pool, "alice").await;
    let bob = common::seed_user(&pool, "bob").await;
    let chat = common::seed_chat(&pool, "direct", alice, &[alice, bob]).await;

    let token_a = common::mint_token(&pool, alice).await;
    let token_b = common::mint_token(&pool, bob).await;
    let mut session_a = MockWsClient::connect_with_token(&hub.ws_url(), &token_a)
        .await
        .unwrap();
    let mut session_b = MockWsClient::connect_with_token(&hub.ws_url(), &token_b)
        .await
        .unwrap();
    common::wait_until_online(&pool, alice).await;
    common::wait_until_online(&pool, bob).await;

    session_a
        .send_envelope(&message_envelope(chat, alice, "hi"))
        .await
        .unwrap();
    let received = common::recv_kind(&mut session_b, EventKind::Message, Duration::from_secs(5))
        .await
        .unwrap();
    let event: MessageEvent = received.parse_payload().unwrap();

    // Auto-delivered notification reaches alice first.
    let first = common::recv_kind(&mut session_a, EventKind::Status, Duration::from_secs(5))
        .await
        .unwrap();
    let first: StatusPayload = first.parse_payload().unwrap();
    assert_eq!(first.status, DeliveryStatus::Delivered);

    // Bob reads the message.
    session_b
        .send_envelope(&status_envelope(
            chat,
            bob,
            &StatusPayload {
                message_id: Some(event.message_id),
                status: DeliveryStatus::Read,
                chat_id: Some(chat),
            },
        ))
        .await
        .unwrap();

    let read_frame = common::recv_kind(&mut session_a, EventKind::Status, Duration::from_secs(5))
        .await
        .expect("alice should be notified of the read");
    let read: StatusPayload = read_frame.parse_payload().unwrap();
    assert_eq!(read.status, DeliveryStatus::Read);
    assert_eq!(read.message_id, Some(event.message_id));

    assert_eq!(status_of(&pool, event.message_id, bob).await, "read");
    let (read_at,): (Option<chrono::DateTime<chrono::Utc>>,) =
        sqlx::query_as("SELECT read_at FROM messages WHERE id = $1")
            .bind(event.message_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(read_at.is_some());
    let (last_read_at,): (Option<chrono::DateTime<chrono::Utc>>,) = sqlx::query_as(
        "SELECT last_read_at FROM chat_members WHERE chat_id = $1 AND user_id = $2",
    )
    .bind(chat)
    .bind(bob)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(last_read_at.is_some());

    // A late-arriving delivered must not regress the row and produces no
    // new notification frame.
    session_b
        .send_envelope(&status_envelope(
            chat,
            bob,
            &StatusPayload {
                message_id: Some(event.message_id),
                status: DeliveryStatus::Delivered,
                chat_id: Some(chat),
            },
        ))
        .await
        .unwrap();
    assert!(
        common::recv_kind(&mut session_a, EventKind::Status, Duration::from_secs(2))
            .await
            .is_none(),
        "re-applied transition is a no-op"
    );
    assert_eq!(status_of(&pool, event.message_id, bob).await, "read");
}

#[tokio::test]
async fn mark_chat_read_upgrades_every_unread_message() {
    let (_container, pool) = common::start_postgres().await;
    let hub = common::start_hub(pool.clone(), Arc::new(LoopbackBus::new())).await;

    let alice = common::seed_user(&pool, "alice").await;
    let bob = common::seed_user(&pool, "bob").await;
    let chat = common::seed_chat(&pool, "direct", alice, &[alice, bob]).await;

    let token_a = common::mint_token(&pool, alice).await;
    let token_b = common::mint_token(&pool, bob).await;
    let mut session_a = MockWsClient::connect_with_token(&hub.ws_url(), &token_a)
        .await
        .unwrap();
    let mut session_b = MockWsClient::connect_with_token(&hub.ws_url(), &token_b)
        .await
        .unwrap();
    common::wait_until_online(&pool, alice).await;
    common::wait_until_online(&pool, bob).await;

    for text in ["one", "two"] {
        session_a
            .send_envelope(&message_envelope(chat, alice, text))
            .await
            .unwrap();
        common::recv_kind(&mut session_b, EventKind::Message, Duration::from_secs(5))
            .await
            .expect("bob receives each message");
    }

    // Bulk form: no message_id, just the chat.
    session_b
        .send_envelope(&status_envelope(
            chat,
            bob,
            &StatusPayload {
                message_id: None,
                status: DeliveryStatus::Read,
                chat_id: Some(chat),
            },
        ))
        .await
        .unwrap();

    // Both messages end up read for bob, whatever order the delivered
    // transitions landed in.
    for _ in 0..100 {
        let (unread,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM message_status ms
               JOIN messages m ON m.id = ms.message_id
               WHERE m.chat_id = $1 AND ms.user_id = $2 AND ms.status <> 'read'"#,
        )
        .bind(chat)
        .bind(bob)
        .fetch_one(&pool)
        .await
        .unwrap();
        if unread == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("mark chat read never converged");
}
