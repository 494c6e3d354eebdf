//! In-memory per-room queues of not-yet-archived messages.
//!
//! Every room accumulates messages into a buffer; when a buffer fills a
//! complete block it is detached in one step and handed to the archival
//! path. The outer lock guards only the room → buffer mapping — each room
//! carries its own lock, so appends and flushes for different rooms never
//! contend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A chat message in archival form. The room is implicit — buffers and
/// archived conversation blocks are keyed by room id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub username: String,
    pub text: String,
}

/// Per-room queues of pending messages, flushed in fixed-size blocks.
pub struct RoomBufferTable {
    rooms: Mutex<HashMap<String, Arc<Mutex<Vec<StoredMessage>>>>>,
    block_size: usize,
}

impl RoomBufferTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            block_size: block_size.max(1),
        }
    }

    fn room(&self, room_id: &str) -> Arc<Mutex<Vec<StoredMessage>>> {
        let mut rooms = self.rooms.lock();
        Arc::clone(rooms.entry(room_id.to_string()).or_default())
    }

    /// Create an empty buffer for a room if one does not exist yet.
    pub fn seed(&self, room_id: &str) {
        self.room(room_id);
    }

    /// Append a message to a room's buffer, creating the buffer if absent.
    ///
    /// When the append fills a complete block, the block is detached and
    /// returned and the room's buffer is reset to empty. Detach happens under
    /// the same lock acquisition as the append, so no concurrent append for
    /// the same room can ever observe a full buffer.
    pub fn append(&self, room_id: &str, message: StoredMessage) -> Option<Vec<StoredMessage>> {
        let room = self.room(room_id);
        let mut pending = room.lock();
        pending.push(message);
        if pending.len() >= self.block_size {
            Some(std::mem::take(&mut *pending))
        } else {
            None
        }
    }

    /// Snapshot of a room's pending messages. Empty if the room is unknown.
    pub fn pending(&self, room_id: &str) -> Vec<StoredMessage> {
        let room = self.rooms.lock().get(room_id).map(Arc::clone);
        room.map(|r| r.lock().clone()).unwrap_or_default()
    }

    /// Detach a room's pending messages unconditionally, leaving it empty.
    pub fn take(&self, room_id: &str) -> Vec<StoredMessage> {
        let room = self.room(room_id);
        let mut pending = room.lock();
        std::mem::take(&mut *pending)
    }
}
