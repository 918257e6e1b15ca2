//! `shooter_server`
//!
//! Server-side systems:
//! - Object arena and server entities (`objects`)
//! - Fixed timestep simulation (`game`)
//! - Per-viewer delta replication (`replication`)
//! - Connection handling and the tick loop (`server`)
//!
//! Networking model:
//! - TCP, length-prefixed frames, one reader and one writer task per client
//! - Every frame holds one or more bit-packed packets

pub mod game;
pub mod objects;
pub mod replication;
pub mod server;

pub use game::Game;
pub use server::GameServer;
