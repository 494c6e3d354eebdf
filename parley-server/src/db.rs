//! SQLite persistence layer.
//!
//! Stores chatrooms, archived conversation blocks, and user credentials.
//! Uses WAL mode for concurrent reads during writes. Conversation blocks are
//! append-only: the relay writes them and never updates or deletes them.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use serde::{Deserialize, Serialize};

use crate::buffer::StoredMessage;

/// A chatroom. `id` serializes as `_id` to match the wire format the browser
/// client expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// An archived block of messages for one room. Immutable once persisted.
/// `timestamp` is the flush time in epoch milliseconds, not any individual
/// message's time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub room_id: String,
    pub timestamp: u64,
    pub messages: Vec<StoredMessage>,
}

/// A registered user. `password` holds the salted hash, never plaintext.
#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub password: String,
}

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS rooms (
                id    TEXT PRIMARY KEY,
                name  TEXT NOT NULL,
                image TEXT
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id       TEXT NOT NULL,
                timestamp     INTEGER NOT NULL,
                messages_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_room_ts
                ON conversations(room_id, timestamp DESC);

            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                password TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Rooms ──────────────────────────────────────────────────────────

    pub fn list_rooms(&self) -> SqlResult<Vec<Room>> {
        let mut stmt = self.conn.prepare("SELECT id, name, image FROM rooms")?;
        let rows = stmt.query_map([], |row| {
            Ok(Room {
                id: row.get(0)?,
                name: row.get(1)?,
                image: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    /// Ids of every known room — used once at startup to pre-seed buffers.
    pub fn room_ids(&self) -> SqlResult<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT id FROM rooms")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect()
    }

    pub fn get_room(&self, room_id: &str) -> SqlResult<Option<Room>> {
        self.conn
            .query_row(
                "SELECT id, name, image FROM rooms WHERE id = ?1",
                params![room_id],
                |row| {
                    Ok(Room {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        image: row.get(2)?,
                    })
                },
            )
            .optional()
    }

    pub fn add_room(&self, room: &Room) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO rooms (id, name, image) VALUES (?1, ?2, ?3)",
            params![room.id, room.name, room.image],
        )?;
        Ok(())
    }

    // ── Conversations ──────────────────────────────────────────────────

    /// Append an archived conversation block.
    pub fn add_conversation(&self, conversation: &Conversation) -> SqlResult<()> {
        let messages_json =
            serde_json::to_string(&conversation.messages).unwrap_or_else(|_| "[]".to_string());
        self.conn.execute(
            "INSERT INTO conversations (room_id, timestamp, messages_json) VALUES (?1, ?2, ?3)",
            params![conversation.room_id, conversation.timestamp as i64, messages_json],
        )?;
        Ok(())
    }

    /// The most recent conversation for a room with `timestamp < before`.
    pub fn latest_conversation_before(
        &self,
        room_id: &str,
        before: u64,
    ) -> SqlResult<Option<Conversation>> {
        // SQLite integers are signed; clamp so an oversized cursor cannot
        // wrap negative and match nothing.
        let before = before.min(i64::MAX as u64) as i64;
        self.conn
            .query_row(
                "SELECT room_id, timestamp, messages_json FROM conversations
                 WHERE room_id = ?1 AND timestamp < ?2
                 ORDER BY timestamp DESC, id DESC LIMIT 1",
                params![room_id, before],
                |row| {
                    let room_id: String = row.get(0)?;
                    let timestamp: i64 = row.get(1)?;
                    let messages_json: String = row.get(2)?;
                    let messages: Vec<StoredMessage> =
                        serde_json::from_str(&messages_json).unwrap_or_default();
                    Ok(Conversation {
                        room_id,
                        timestamp: timestamp as u64,
                        messages,
                    })
                },
            )
            .optional()
    }

    // ── Users ──────────────────────────────────────────────────────────

    pub fn get_user(&self, username: &str) -> SqlResult<Option<User>> {
        self.conn
            .query_row(
                "SELECT username, password FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(User {
                        username: row.get(0)?,
                        password: row.get(1)?,
                    })
                },
            )
            .optional()
    }

    /// Register a user with an already-salted password hash.
    pub fn add_user(&self, username: &str, password_hash: &str) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO users (username, password) VALUES (?1, ?2)",
            params![username, password_hash],
        )?;
        Ok(())
    }
}
