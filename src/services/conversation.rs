//! Conversation persistence for rooms, chats, and profile lookups.
//!
//! DESIGN
//! ======
//! All storage sits behind the `ConversationStore` trait so the websocket
//! router can run against Postgres in production and an in-memory store in
//! tests and storage-less deployments. `PgStore` is the sqlx
//! implementation.
//!
//! Rooms are unique per unordered participant pair. `create_room` upserts
//! against the pair index so concurrent first messages between the same two
//! users converge on one row. Chats order by `created_at` (epoch millis)
//! within a room; there is no cross-room ordering guarantee.
//!
//! The `users` table is owned by the account system. This module only reads
//! profile rows and never assumes a row exists for a given id.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

// =============================================================================
// MODELS
// =============================================================================

/// Durable record of a conversation between two participants. The pair is
/// stored in first-contact order but always queried symmetrically.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
}

/// One persisted message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub message: String,
    pub images: Vec<String>,
    pub is_read: bool,
    /// Milliseconds since the Unix epoch. Orders chats within a room.
    pub created_at: i64,
}

/// Profile row owned by the account system. Read-only here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub profile_image: Option<String>,
    pub role: String,
    pub is_complete_profile: bool,
}

/// Fields for a chat insert. `id`, `is_read`, and `created_at` are assigned
/// by the store.
#[derive(Debug, Clone)]
pub struct NewChat {
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub message: String,
    pub images: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("room for pair {0}/{1} missing after upsert")]
    RoomUpsert(Uuid, Uuid),
}

/// Current time as milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// STORE TRAIT
// =============================================================================

/// Persistence seam between the websocket router and storage.
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    /// Find the room for an unordered participant pair.
    async fn find_room(&self, user_a: Uuid, user_b: Uuid) -> Result<Option<Room>, StoreError>;

    /// Create the room for a pair, or return the existing one when a
    /// concurrent create won the race.
    async fn create_room(&self, sender_id: Uuid, receiver_id: Uuid) -> Result<Room, StoreError>;

    /// Insert a chat. Starts unread with a store-assigned timestamp.
    async fn create_chat(&self, new: NewChat) -> Result<Chat, StoreError>;

    /// All chats in a room, oldest first.
    async fn find_chats(&self, room_id: Uuid) -> Result<Vec<Chat>, StoreError>;

    /// Unread chats in a room addressed to `receiver_id`, in stored order.
    async fn unread_chats(
        &self,
        room_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Vec<Chat>, StoreError>;

    /// Mark every chat in the room addressed to `receiver_id` as read.
    /// Returns the number of rows touched.
    async fn mark_read(&self, room_id: Uuid, receiver_id: Uuid) -> Result<u64, StoreError>;

    /// Profile rows for the given users. Ids without a row are absent from
    /// the result; an empty input yields an empty result.
    async fn find_users(&self, ids: &[Uuid]) -> Result<Vec<UserProfile>, StoreError>;

    /// Every room the user participates in, on either side of the pair.
    async fn rooms_for(&self, user_id: Uuid) -> Result<Vec<Room>, StoreError>;

    /// Most recent chat in a room, if any.
    async fn latest_chat(&self, room_id: Uuid) -> Result<Option<Chat>, StoreError>;
}

// =============================================================================
// POSTGRES STORE
// =============================================================================

type ChatRow = (Uuid, Uuid, Uuid, Uuid, String, Vec<String>, bool, i64);

fn chat_from_row(row: ChatRow) -> Chat {
    let (id, room_id, sender_id, receiver_id, message, images, is_read, created_at) = row;
    Chat {
        id,
        room_id,
        sender_id,
        receiver_id,
        message,
        images,
        is_read,
        created_at,
    }
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationStore for PgStore {
    async fn find_room(&self, user_a: Uuid, user_b: Uuid) -> Result<Option<Room>, StoreError> {
        let row = sqlx::query_as::<_, (Uuid, Uuid, Uuid)>(
            "SELECT id, sender_id, receiver_id
             FROM rooms
             WHERE (sender_id = $1 AND receiver_id = $2)
                OR (sender_id = $2 AND receiver_id = $1)",
        )
        .bind(user_a)
        .bind(user_b)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, sender_id, receiver_id)| Room {
            id,
            sender_id,
            receiver_id,
        }))
    }

    async fn create_room(&self, sender_id: Uuid, receiver_id: Uuid) -> Result<Room, StoreError> {
        let id = Uuid::new_v4();
        let result = sqlx::query(
            "INSERT INTO rooms (id, sender_id, receiver_id)
             VALUES ($1, $2, $3)
             ON CONFLICT ((LEAST(sender_id, receiver_id)), (GREATEST(sender_id, receiver_id)))
             DO NOTHING",
        )
        .bind(id)
        .bind(sender_id)
        .bind(receiver_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(Room {
                id,
                sender_id,
                receiver_id,
            });
        }

        // Lost the creation race; the winner's row is the room for this pair.
        self.find_room(sender_id, receiver_id)
            .await?
            .ok_or(StoreError::RoomUpsert(sender_id, receiver_id))
    }

    async fn create_chat(&self, new: NewChat) -> Result<Chat, StoreError> {
        let id = Uuid::new_v4();
        let created_at = now_ms();
        sqlx::query(
            "INSERT INTO chats (id, room_id, sender_id, receiver_id, message, images, is_read, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)",
        )
        .bind(id)
        .bind(new.room_id)
        .bind(new.sender_id)
        .bind(new.receiver_id)
        .bind(&new.message)
        .bind(&new.images)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(Chat {
            id,
            room_id: new.room_id,
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            message: new.message,
            images: new.images,
            is_read: false,
            created_at,
        })
    }

    async fn find_chats(&self, room_id: Uuid) -> Result<Vec<Chat>, StoreError> {
        let rows = sqlx::query_as::<_, ChatRow>(
            "SELECT id, room_id, sender_id, receiver_id, message, images, is_read, created_at
             FROM chats
             WHERE room_id = $1
             ORDER BY created_at ASC",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(chat_from_row).collect())
    }

    async fn unread_chats(
        &self,
        room_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Vec<Chat>, StoreError> {
        let rows = sqlx::query_as::<_, ChatRow>(
            "SELECT id, room_id, sender_id, receiver_id, message, images, is_read, created_at
             FROM chats
             WHERE room_id = $1 AND receiver_id = $2 AND NOT is_read",
        )
        .bind(room_id)
        .bind(receiver_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(chat_from_row).collect())
    }

    async fn mark_read(&self, room_id: Uuid, receiver_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE chats
             SET is_read = TRUE
             WHERE room_id = $1 AND receiver_id = $2",
        )
        .bind(room_id)
        .bind(receiver_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn find_users(&self, ids: &[Uuid]) -> Result<Vec<UserProfile>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::new(
            "SELECT id, email, full_name, profile_image, role, is_complete_profile
             FROM users
             WHERE id IN (",
        );
        {
            let mut separated = builder.separated(", ");
            for id in ids {
                separated.push_bind(id);
            }
        }
        builder.push(")");

        let rows = builder
            .build_query_as::<(Uuid, String, Option<String>, Option<String>, String, bool)>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, email, full_name, profile_image, role, is_complete_profile)| UserProfile {
                    id,
                    email,
                    full_name,
                    profile_image,
                    role,
                    is_complete_profile,
                },
            )
            .collect())
    }

    async fn rooms_for(&self, user_id: Uuid) -> Result<Vec<Room>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, Uuid)>(
            "SELECT id, sender_id, receiver_id
             FROM rooms
             WHERE sender_id = $1 OR receiver_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, sender_id, receiver_id)| Room {
                id,
                sender_id,
                receiver_id,
            })
            .collect())
    }

    async fn latest_chat(&self, room_id: Uuid) -> Result<Option<Chat>, StoreError> {
        let row = sqlx::query_as::<_, ChatRow>(
            "SELECT id, room_id, sender_id, receiver_id, message, images, is_read, created_at
             FROM chats
             WHERE room_id = $1
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(chat_from_row))
    }
}

#[cfg(test)]
#[path = "conversation_test.rs"]
mod tests;
