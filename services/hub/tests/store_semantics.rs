//! Store-level contracts: transactional insert shape, monotone status
//! floor, creator-leave rule, and archival.

mod common;

use chat_protocol::DeliveryStatus;
use hub::repo;
use hub::repo::messages::NewMessage;
use uuid::Uuid;

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

fn new_message(chat_id: Uuid, sender_id: Uuid, content: &str) -> NewMessage {
    NewMessage {
        chat_id,
        sender_id,
        content: content.to_owned(),
        content_type: "text".to_owned(),
        reply_to: None,
        forward_from: None,
    }
}

#[tokio::test]
async fn insert_creates_status_rows_for_every_member() {
    let (_container, pool) = common::start_postgres().await;
    let alice = common::seed_user(&pool, "alice").await;
    let bob = common::seed_user(&pool, "bob").await;
    let carol = common::seed_user(&pool, "carol").await;
    let chat = common::seed_chat(&pool, "group", alice, &[alice, bob, carol]).await;

    let (stored, members) =
        repo::messages::insert_with_statuses(&pool, &new_message(chat, alice, "hello group"))
            .await
            .unwrap();
    assert_eq!(members.len(), 3);

    assert_eq!(status_of(&pool, stored.id, alice).await, "delivered");
    assert_eq!(status_of(&pool, stored.id, bob).await, "sent");
    assert_eq!(status_of(&pool, stored.id, carol).await, "sent");

    let (delivered_at,): (Option<chrono::DateTime<chrono::Utc>>,) =
        sqlx::query_as("SELECT delivered_at FROM messages WHERE id = $1")
            .bind(stored.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(delivered_at.is_some(), "sender's copy counts as delivery");
}

#[tokio::test]
async fn dangling_reply_to_still_inserts() {
    let (_container, pool) = common::start_postgres().await;
    let alice = common::seed_user(&pool, "alice").await;
    let chat = common::seed_chat(&pool, "direct", alice, &[alice]).await;

    let mut message = new_message(chat, alice, "re: nothing");
    message.reply_to = Some(Uuid::new_v4());
    let result = repo::messages::insert_with_statuses(&pool, &message).await;
    assert!(result.is_ok(), "dangling reply_to must not fail the insert");
}

#[tokio::test]
async fn status_floor_never_regresses() {
    let (_container, pool) = common::start_postgres().await;
    let alice = common::seed_user(&pool, "alice").await;
    let bob = common::seed_user(&pool, "bob").await;
    let chat = common::seed_chat(&pool, "direct", alice, &[alice, bob]).await;
    let (stored, _) = repo::messages::insert_with_statuses(&pool, &new_message(chat, alice, "hi"))
        .await
        .unwrap();

    // sent -> delivered applies.
    let applied =
        repo::status::apply_transition(&pool, stored.id, bob, DeliveryStatus::Delivered)
            .await
            .unwrap();
    assert!(applied.is_some());
    assert_eq!(status_of(&pool, stored.id, bob).await, "delivered");

    // delivered -> delivered is a no-op.
    let replayed =
        repo::status::apply_transition(&pool, stored.id, bob, DeliveryStatus::Delivered)
            .await
            .unwrap();
    assert!(replayed.is_none());

    // delivered -> read applies; read -> delivered is discarded.
    let read = repo::status::apply_transition(&pool, stored.id, bob, DeliveryStatus::Read)
        .await
        .unwrap();
    assert!(read.is_some());
    let late = repo::status::apply_transition(&pool, stored.id, bob, DeliveryStatus::Delivered)
        .await
        .unwrap();
    assert!(late.is_none());
    assert_eq!(status_of(&pool, stored.id, bob).await, "read");
}

#[tokio::test]
async fn transition_for_unknown_message_is_dropped() {
    let (_container, pool) = common::start_postgres().await;
    let bob = common::seed_user(&pool, "bob").await;
    let applied =
        repo::status::apply_transition(&pool, Uuid::new_v4(), bob, DeliveryStatus::Delivered)
            .await
            .unwrap();
    assert!(applied.is_none());
}

#[tokio::test]
async fn mark_chat_read_skips_own_messages_and_reports_changes() {
    let (_container, pool) = common::start_postgres().await;
    let alice = common::seed_user(&pool, "alice").await;
    let bob = common::seed_user(&pool, "bob").await;
    let chat = common::seed_chat(&pool, "direct", alice, &[alice, bob]).await;

    let (from_alice, _) =
        repo::messages::insert_with_statuses(&pool, &new_message(chat, alice, "one"))
            .await
            .unwrap();
    let (from_bob, _) =
        repo::messages::insert_with_statuses(&pool, &new_message(chat, bob, "two"))
            .await
            .unwrap();

    let changed = repo::status::mark_chat_read(&pool, chat, bob).await.unwrap();
    assert_eq!(changed.len(), 1, "only alice's message transitions for bob");
    assert_eq!(changed[0].message_id, from_alice.id);
    assert_eq!(changed[0].sender_id, alice);

    assert_eq!(status_of(&pool, from_alice.id, bob).await, "read");
    assert_eq!(
        status_of(&pool, from_bob.id, bob).await,
        "delivered",
        "bob's own message is untouched"
    );

    // Idempotent: a second sweep changes nothing.
    let again = repo::status::mark_chat_read(&pool, chat, bob).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn group_creator_cannot_leave() {
    let (_container, pool) = common::start_postgres().await;
    let creator = common::seed_user(&pool, "creator").await;
    let member = common::seed_user(&pool, "member").await;
    let chat = common::seed_chat(&pool, "group", creator, &[creator, member]).await;

    let refused = repo::chats::leave_chat(&pool, chat, creator).await;
    assert!(matches!(
        refused,
        Err(repo::chats::LeaveError::CreatorCannotLeave)
    ));
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM chat_members WHERE chat_id = $1")
            .bind(chat)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 2, "membership unchanged");

    repo::chats::leave_chat(&pool, chat, member).await.unwrap();
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM chat_members WHERE chat_id = $1")
            .bind(chat)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1, "non-creator may leave");
}

#[tokio::test]
async fn archival_targets_only_stale_chats() {
    let (_container, pool) = common::start_postgres().await;
    let alice = common::seed_user(&pool, "alice").await;
    let stale = common::seed_chat(&pool, "direct", alice, &[alice]).await;
    let fresh = common::seed_chat(&pool, "direct", alice, &[alice]).await;

    sqlx::query("UPDATE chats SET last_activity = now() - interval '40 days' WHERE id = $1")
        .bind(stale)
        .execute(&pool)
        .await
        .unwrap();

    let archived = repo::chats::archive_inactive(&pool, 30).await.unwrap();
    assert_eq!(archived, 1);

    let (stale_flag,): (bool,) = sqlx::query_as("SELECT is_archived FROM chats WHERE id = $1")
        .bind(stale)
        .fetch_one(&pool)
        .await
        .unwrap();
    let (fresh_flag,): (bool,) = sqlx::query_as("SELECT is_archived FROM chats WHERE id = $1")
        .bind(fresh)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(stale_flag);
    assert!(!fresh_flag);
}
