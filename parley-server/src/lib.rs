//! Browser group-chat relay server.
//!
//! An HTTP surface serves chatroom metadata and the login flow, while a
//! WebSocket relay fans live messages out between authenticated clients and
//! archives them per room in fixed-size conversation blocks.

pub mod buffer;
pub mod config;
pub mod db;
pub mod relay;
pub mod server;
pub mod session;
pub mod web;
