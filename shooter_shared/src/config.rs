//! Configuration system.
//!
//! Loads server and client configuration from JSON strings (file IO is left
//! to the binaries). Every field has a default so a partial file works.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bitstream::MAX_POSITION;
use crate::object::{snapshot_sizes, ObjectKind};

/// Configuration problems found by `validate`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    InvalidTickRate(u32),
    InvalidWorldSize { width: f32, height: f32 },
    InvalidCellSize(f32),
    InvalidViewRadius(f32),
    NoPlayers,
    OutgoingBufferTooSmall(usize),
    PayloadTooSmall { kind: ObjectKind, full: bool, configured: usize, needed: usize },
    EmptyPlayerName,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidTickRate(hz) => write!(f, "tick rate must be positive, got {hz}"),
            ConfigError::InvalidWorldSize { width, height } => write!(
                f,
                "world size {width}x{height} must be positive and at most {MAX_POSITION}"
            ),
            ConfigError::InvalidCellSize(size) => {
                write!(f, "grid cell size must be positive, got {size}")
            }
            ConfigError::InvalidViewRadius(r) => {
                write!(f, "view radius must be positive, got {r}")
            }
            ConfigError::NoPlayers => write!(f, "max_players must be at least 1"),
            ConfigError::OutgoingBufferTooSmall(n) => {
                write!(f, "outgoing buffer of {n} bytes cannot hold an update")
            }
            ConfigError::PayloadTooSmall {
                kind,
                full,
                configured,
                needed,
            } => write!(
                f,
                "{} payload size for {kind:?} is {configured} bytes, needs {needed}",
                if *full { "full" } else { "partial" }
            ),
            ConfigError::EmptyPlayerName => write!(f, "player name must not be empty"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Pre-allocated snapshot sizes per object kind, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSizes {
    pub player_partial: usize,
    pub player_full: usize,
    pub obstacle_partial: usize,
    pub obstacle_full: usize,
    pub loot_partial: usize,
    pub loot_full: usize,
}

impl Default for PayloadSizes {
    fn default() -> Self {
        let (player_partial, player_full) = snapshot_sizes(ObjectKind::Player);
        let (obstacle_partial, obstacle_full) = snapshot_sizes(ObjectKind::Obstacle);
        let (loot_partial, loot_full) = snapshot_sizes(ObjectKind::Loot);
        Self {
            player_partial,
            player_full,
            obstacle_partial,
            obstacle_full,
            loot_partial,
            loot_full,
        }
    }
}

impl PayloadSizes {
    pub fn partial(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::Player => self.player_partial,
            ObjectKind::Obstacle => self.obstacle_partial,
            ObjectKind::Loot => self.loot_partial,
        }
    }

    pub fn full(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::Player => self.player_full,
            ObjectKind::Obstacle => self.obstacle_full,
            ObjectKind::Loot => self.loot_full,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in ObjectKind::ALL {
            let (partial, full) = snapshot_sizes(kind);
            for (is_full, configured, needed) in
                [(false, self.partial(kind), partial), (true, self.full(kind), full)]
            {
                if configured < needed {
                    return Err(ConfigError::PayloadTooSmall {
                        kind,
                        full: is_full,
                        configured,
                        needed,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:40000`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    #[serde(default = "default_world_size")]
    pub world_width: f32,
    #[serde(default = "default_world_size")]
    pub world_height: f32,
    #[serde(default = "default_grid_cell_size")]
    pub grid_cell_size: f32,
    /// Half extent of the square each player can see.
    #[serde(default = "default_view_radius")]
    pub view_radius: f32,
    #[serde(default = "default_max_players")]
    pub max_players: usize,
    /// Size of each viewer's outgoing update buffer.
    #[serde(default = "default_outgoing_buffer_bytes")]
    pub outgoing_buffer_bytes: usize,
    #[serde(default)]
    pub payload_sizes: PayloadSizes,
    /// Obstacles scattered at startup.
    #[serde(default = "default_obstacle_count")]
    pub obstacle_count: usize,
    /// Loot scattered at startup.
    #[serde(default = "default_loot_count")]
    pub loot_count: usize,
    /// Player speed in world units per second.
    #[serde(default = "default_player_speed")]
    pub player_speed: f32,
    /// Seed for map generation and spawn points.
    #[serde(default)]
    pub seed: u64,
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_tick_hz() -> u32 {
    30
}

fn default_world_size() -> f32 {
    512.0
}

fn default_grid_cell_size() -> f32 {
    32.0
}

fn default_view_radius() -> f32 {
    64.0
}

fn default_max_players() -> usize {
    32
}

fn default_outgoing_buffer_bytes() -> usize {
    16 * 1024
}

fn default_obstacle_count() -> usize {
    120
}

fn default_loot_count() -> usize {
    20
}

fn default_player_speed() -> f32 {
    24.0
}

/// Smallest buffer that fits a tag, flags and a couple of entries.
const MIN_OUTGOING_BUFFER_BYTES: usize = 64;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
            world_width: default_world_size(),
            world_height: default_world_size(),
            grid_cell_size: default_grid_cell_size(),
            view_radius: default_view_radius(),
            max_players: default_max_players(),
            outgoing_buffer_bytes: default_outgoing_buffer_bytes(),
            payload_sizes: PayloadSizes::default(),
            obstacle_count: default_obstacle_count(),
            loot_count: default_loot_count(),
            player_speed: default_player_speed(),
            seed: 0,
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_hz == 0 {
            return Err(ConfigError::InvalidTickRate(self.tick_hz));
        }
        let world_ok = |v: f32| v > 0.0 && v <= MAX_POSITION;
        if !world_ok(self.world_width) || !world_ok(self.world_height) {
            return Err(ConfigError::InvalidWorldSize {
                width: self.world_width,
                height: self.world_height,
            });
        }
        if !(self.grid_cell_size > 0.0) {
            return Err(ConfigError::InvalidCellSize(self.grid_cell_size));
        }
        if !(self.view_radius > 0.0) {
            return Err(ConfigError::InvalidViewRadius(self.view_radius));
        }
        if self.max_players == 0 {
            return Err(ConfigError::NoPlayers);
        }
        if self.outgoing_buffer_bytes < MIN_OUTGOING_BUFFER_BYTES {
            return Err(ConfigError::OutgoingBufferTooSmall(self.outgoing_buffer_bytes));
        }
        self.payload_sizes.validate()
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// Input send rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
}

fn default_player_name() -> String {
    "Player".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            player_name: default_player_name(),
            tick_hz: default_tick_hz(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_hz == 0 {
            return Err(ConfigError::InvalidTickRate(self.tick_hz));
        }
        if self.player_name.trim().is_empty() {
            return Err(ConfigError::EmptyPlayerName);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let cfg = ServerConfig::from_json_str(r#"{ "tick_hz": 20, "world_width": 256.0 }"#).unwrap();
        assert_eq!(cfg.tick_hz, 20);
        assert_eq!(cfg.world_width, 256.0);
        assert_eq!(cfg.world_height, 512.0);
        assert_eq!(cfg.payload_sizes, PayloadSizes::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn world_larger_than_position_range_is_rejected() {
        let cfg = ServerConfig {
            world_width: MAX_POSITION + 1.0,
            ..ServerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidWorldSize { .. })));
    }

    #[test]
    fn undersized_payload_is_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.payload_sizes.player_full = 2;
        match cfg.validate() {
            Err(ConfigError::PayloadTooSmall { kind, full, .. }) => {
                assert_eq!(kind, ObjectKind::Player);
                assert!(full);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn client_requires_a_name() {
        let cfg = ClientConfig::from_json_str(r#"{ "player_name": "  " }"#).unwrap();
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyPlayerName));
    }
}
