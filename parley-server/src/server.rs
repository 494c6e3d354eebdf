//! Shared server state and startup.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::buffer::RoomBufferTable;
use crate::config::ServerConfig;
use crate::db::Db;
use crate::session::SessionStore;

/// Shared state accessible by all connection and request handlers.
pub struct SharedState {
    /// connection id → sender for that client's outbound frames.
    pub connections: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    /// Per-room pending (not-yet-archived) messages.
    pub buffers: RoomBufferTable,
    /// Cookie-session store.
    pub sessions: SessionStore,
    /// Database handle for rooms, users, and archived conversations.
    pub db: Mutex<Db>,
    pub config: ServerConfig,
}

impl SharedState {
    /// Run a closure with the database. Logs errors but does not propagate
    /// them — persistence failures should not break the relay.
    pub fn with_db<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&Db) -> rusqlite::Result<R>,
    {
        let db = self.db.lock();
        match f(&db) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::error!("Database error: {e}");
                None
            }
        }
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Build SharedState, opening the database and pre-seeding an empty
    /// buffer for every room it already knows about.
    fn build_state(&self) -> Result<Arc<SharedState>> {
        let db = Db::open(&self.config.db_path)
            .map_err(|e| anyhow::anyhow!("Failed to open database {}: {e}", self.config.db_path))?;

        let buffers = RoomBufferTable::new(self.config.message_block_size);
        let room_ids = db
            .room_ids()
            .map_err(|e| anyhow::anyhow!("Failed to list rooms: {e}"))?;
        for id in &room_ids {
            buffers.seed(id);
        }
        tracing::info!("Seeded buffers for {} rooms", room_ids.len());

        Ok(Arc::new(SharedState {
            connections: Mutex::new(HashMap::new()),
            buffers,
            sessions: SessionStore::new(),
            db: Mutex::new(db),
            config: self.config.clone(),
        }))
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;

        // Periodically evict expired sessions.
        let sweep_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            interval.tick().await; // skip the immediate first tick
            loop {
                interval.tick().await;
                let evicted = sweep_state.sessions.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, "Swept expired sessions");
                }
            }
        });

        let router = crate::web::router(Arc::clone(&state));
        let listener = TcpListener::bind(&state.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", state.config.listen_addr))?;
        tracing::info!("Listening on {}", state.config.listen_addr);
        axum::serve(listener, router).await?;
        Ok(())
    }
}
