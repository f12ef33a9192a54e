use super::*;

async fn send(store: &MemoryStore, room_id: Uuid, from: Uuid, to: Uuid, text: &str) -> Chat {
    store
        .create_chat(NewChat {
            room_id,
            sender_id: from,
            receiver_id: to,
            message: text.to_string(),
            images: Vec::new(),
        })
        .await
        .expect("chat insert should succeed")
}

fn profile(id: Uuid, email: &str) -> UserProfile {
    UserProfile {
        id,
        email: email.to_string(),
        full_name: Some("Test User".to_string()),
        profile_image: None,
        role: "USER".to_string(),
        is_complete_profile: true,
    }
}

// =============================================================================
// ROOMS
// =============================================================================

#[tokio::test]
async fn room_lookup_is_symmetric() {
    let store = MemoryStore::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    let room = store.create_room(a, b).await.expect("create room");
    let found = store
        .find_room(b, a)
        .await
        .expect("lookup should succeed")
        .expect("room should be found from either side");
    assert_eq!(found.id, room.id);
}

#[tokio::test]
async fn create_room_returns_existing_for_known_pair() {
    let store = MemoryStore::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    let first = store.create_room(a, b).await.expect("first create");
    let second = store.create_room(b, a).await.expect("reversed create");
    assert_eq!(first.id, second.id);

    let rooms = store.rooms_for(a).await.expect("rooms for a");
    assert_eq!(rooms.len(), 1);
}

#[tokio::test]
async fn rooms_for_lists_rooms_on_either_side() {
    let store = MemoryStore::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let c = Uuid::new_v4();

    store.create_room(a, b).await.expect("room a-b");
    store.create_room(c, a).await.expect("room c-a");
    store.create_room(b, c).await.expect("room b-c");

    let rooms = store.rooms_for(a).await.expect("rooms for a");
    assert_eq!(rooms.len(), 2);
    assert!(
        rooms
            .iter()
            .all(|r| r.sender_id == a || r.receiver_id == a)
    );
}

// =============================================================================
// CHATS
// =============================================================================

#[tokio::test]
async fn chats_come_back_oldest_first() {
    let store = MemoryStore::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let room = store.create_room(a, b).await.expect("create room");

    send(&store, room.id, a, b, "one").await;
    send(&store, room.id, b, a, "two").await;
    send(&store, room.id, a, b, "three").await;

    let chats = store.find_chats(room.id).await.expect("history");
    let messages: Vec<&str> = chats.iter().map(|c| c.message.as_str()).collect();
    assert_eq!(messages, ["one", "two", "three"]);
    assert!(
        chats
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at)
    );
}

#[tokio::test]
async fn new_chats_start_unread() {
    let store = MemoryStore::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let room = store.create_room(a, b).await.expect("create room");

    let chat = send(&store, room.id, a, b, "hello").await;
    assert!(!chat.is_read);
    assert!(chat.created_at > 0);
}

#[tokio::test]
async fn unread_filters_by_receiver_and_read_state() {
    let store = MemoryStore::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let room = store.create_room(a, b).await.expect("create room");

    send(&store, room.id, a, b, "for b").await;
    send(&store, room.id, b, a, "for a").await;

    let unread_b = store.unread_chats(room.id, b).await.expect("unread for b");
    assert_eq!(unread_b.len(), 1);
    assert_eq!(unread_b[0].message, "for b");

    let touched = store.mark_read(room.id, b).await.expect("mark read");
    assert_eq!(touched, 1);

    assert!(
        store
            .unread_chats(room.id, b)
            .await
            .expect("unread after mark")
            .is_empty()
    );
    // The other direction is untouched.
    assert_eq!(
        store
            .unread_chats(room.id, a)
            .await
            .expect("unread for a")
            .len(),
        1
    );
}

#[tokio::test]
async fn mark_read_is_an_unconditional_bulk_update() {
    let store = MemoryStore::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let room = store.create_room(a, b).await.expect("create room");

    send(&store, room.id, a, b, "one").await;
    send(&store, room.id, a, b, "two").await;

    assert_eq!(store.mark_read(room.id, b).await.expect("first mark"), 2);
    // Already-read rows still match the update.
    assert_eq!(store.mark_read(room.id, b).await.expect("second mark"), 2);
}

#[tokio::test]
async fn latest_chat_returns_most_recent() {
    let store = MemoryStore::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let room = store.create_room(a, b).await.expect("create room");

    assert!(
        store
            .latest_chat(room.id)
            .await
            .expect("empty room lookup")
            .is_none()
    );

    send(&store, room.id, a, b, "one").await;
    send(&store, room.id, b, a, "two").await;
    send(&store, room.id, a, b, "three").await;

    let latest = store
        .latest_chat(room.id)
        .await
        .expect("lookup should succeed")
        .expect("room has chats");
    assert_eq!(latest.message, "three");
}

// =============================================================================
// USERS
// =============================================================================

#[tokio::test]
async fn find_users_ignores_unknown_ids() {
    let store = MemoryStore::new();
    let known = Uuid::new_v4();
    store.seed_user(profile(known, "known@example.com"));

    let found = store
        .find_users(&[known, Uuid::new_v4()])
        .await
        .expect("lookup should succeed");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, known);

    let none = store.find_users(&[]).await.expect("empty lookup");
    assert!(none.is_empty());
}

#[tokio::test]
async fn seed_user_replaces_existing_profile() {
    let store = MemoryStore::new();
    let id = Uuid::new_v4();
    store.seed_user(profile(id, "old@example.com"));
    store.seed_user(profile(id, "new@example.com"));

    let found = store.find_users(&[id]).await.expect("lookup");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].email, "new@example.com");
}
