//! Server configuration via command-line flags and environment variables.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "parley-server", about = "Browser group-chat relay server")]
pub struct ServerConfig {
    /// Address for the HTTP/WebSocket listener.
    #[arg(long, env = "PARLEY_LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    pub listen_addr: String,

    /// Path to the SQLite database file.
    #[arg(long, env = "PARLEY_DB_PATH", default_value = "parley.db")]
    pub db_path: String,

    /// Directory of static client files to serve.
    #[arg(long, env = "PARLEY_STATIC_DIR")]
    pub static_dir: Option<String>,

    /// Messages accumulated per room before a conversation block is archived.
    #[arg(long, env = "PARLEY_BLOCK_SIZE", default_value_t = 10)]
    pub message_block_size: usize,

    /// Session lifetime in milliseconds.
    #[arg(long, env = "PARLEY_SESSION_TTL_MS", default_value_t = 600_000)]
    pub session_ttl_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            db_path: "parley.db".to_string(),
            static_dir: None,
            message_block_size: 10,
            session_ttl_ms: 600_000,
        }
    }
}
