//! In-memory conversation store.
//!
//! DESIGN
//! ======
//! Backs the store trait with plain vectors behind a mutex. Selected at
//! startup when `DATABASE_URL` is unset, and used throughout the test suite
//! so router behavior can be exercised without Postgres. The only thing
//! lost relative to `PgStore` is durability across restarts.

use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

use super::conversation::{
    Chat, ConversationStore, NewChat, Room, StoreError, UserProfile, now_ms,
};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    rooms: Vec<Room>,
    chats: Vec<Chat>,
    users: Vec<UserProfile>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a profile row. Stands in for the account system
    /// that owns the users table.
    pub fn seed_user(&self, user: UserProfile) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.users.retain(|u| u.id != user.id);
        inner.users.push(user);
    }
}

fn pair_matches(room: &Room, user_a: Uuid, user_b: Uuid) -> bool {
    (room.sender_id == user_a && room.receiver_id == user_b)
        || (room.sender_id == user_b && room.receiver_id == user_a)
}

#[async_trait::async_trait]
impl ConversationStore for MemoryStore {
    async fn find_room(&self, user_a: Uuid, user_b: Uuid) -> Result<Option<Room>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .rooms
            .iter()
            .find(|r| pair_matches(r, user_a, user_b))
            .cloned())
    }

    async fn create_room(&self, sender_id: Uuid, receiver_id: Uuid) -> Result<Room, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // Check-then-insert under one lock, same contract as the unique
        // pair index in Postgres.
        if let Some(existing) = inner
            .rooms
            .iter()
            .find(|r| pair_matches(r, sender_id, receiver_id))
        {
            return Ok(existing.clone());
        }
        let room = Room {
            id: Uuid::new_v4(),
            sender_id,
            receiver_id,
        };
        inner.rooms.push(room.clone());
        Ok(room)
    }

    async fn create_chat(&self, new: NewChat) -> Result<Chat, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let chat = Chat {
            id: Uuid::new_v4(),
            room_id: new.room_id,
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            message: new.message,
            images: new.images,
            is_read: false,
            created_at: now_ms(),
        };
        inner.chats.push(chat.clone());
        Ok(chat)
    }

    async fn find_chats(&self, room_id: Uuid) -> Result<Vec<Chat>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut chats: Vec<Chat> = inner
            .chats
            .iter()
            .filter(|c| c.room_id == room_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for same-millisecond chats.
        chats.sort_by_key(|c| c.created_at);
        Ok(chats)
    }

    async fn unread_chats(
        &self,
        room_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Vec<Chat>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .chats
            .iter()
            .filter(|c| c.room_id == room_id && c.receiver_id == receiver_id && !c.is_read)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, room_id: Uuid, receiver_id: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut touched = 0;
        for chat in inner
            .chats
            .iter_mut()
            .filter(|c| c.room_id == room_id && c.receiver_id == receiver_id)
        {
            chat.is_read = true;
            touched += 1;
        }
        Ok(touched)
    }

    async fn find_users(&self, ids: &[Uuid]) -> Result<Vec<UserProfile>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .users
            .iter()
            .filter(|u| ids.contains(&u.id))
            .cloned()
            .collect())
    }

    async fn rooms_for(&self, user_id: Uuid) -> Result<Vec<Room>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .rooms
            .iter()
            .filter(|r| r.sender_id == user_id || r.receiver_id == user_id)
            .cloned()
            .collect())
    }

    async fn latest_chat(&self, room_id: Uuid) -> Result<Option<Chat>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // max_by_key keeps the last of equal maxima, so same-millisecond
        // chats resolve to the most recently inserted.
        Ok(inner
            .chats
            .iter()
            .filter(|c| c.room_id == room_id)
            .max_by_key(|c| c.created_at)
            .cloned())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
