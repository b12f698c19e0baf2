//! Replay domain types shared between decoders and the session layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Header metadata read once at the start of a replay.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayHeader {
    pub filestamp: String,
    pub protocol: i32,
    pub network_protocol: i32,
    pub server_name: String,
    pub client_name: String,
    pub map_name: String,
    pub game_directory: String,
    pub playback_time_secs: f64,
    pub playback_ticks: i64,
    pub playback_frames: i64,
    pub signon_length: i64,
}

impl ReplayHeader {
    /// Frames per second of recording. Zero when the playback time is zero.
    pub fn frame_rate(&self) -> f64 {
        if self.playback_time_secs <= 0.0 {
            return 0.0;
        }
        self.playback_frames as f64 / self.playback_time_secs
    }

    /// Ticks per second of recording. Zero when the playback time is zero.
    pub fn tick_rate(&self) -> f64 {
        if self.playback_time_secs <= 0.0 {
            return 0.0;
        }
        self.playback_ticks as f64 / self.playback_time_secs
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vector2 {
    pub x: f32,
    pub y: f32,
}

/// A piece of equipment (weapon, grenade, ...) identified by display name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub name: String,
}

impl Equipment {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Equipment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Reference to a participant from inside an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRef {
    pub user_id: i32,
}

/// State of one actively playing participant at the current position.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Participant {
    pub user_id: i32,
    pub flash_duration: f32,
    pub steam_id64: u64,
    pub name: String,
    pub last_alive_position: Vector3,
    pub velocity: Vector3,
    pub active_weapon: Option<Equipment>,
    pub view_direction: Vector2,
    pub is_ducking: bool,
    pub health: i32,
}

/// Event types a session may subscribe to.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    PlayerHurt,
    WeaponFire,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::PlayerHurt, EventKind::WeaponFire];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlayerHurt => "PlayerHurt",
            Self::WeaponFire => "WeaponFire",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// A typed in-stream event raised by a decoder while advancing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GameEvent {
    PlayerHurt {
        #[serde(default)]
        attacker: Option<PlayerRef>,
        #[serde(default)]
        player: Option<PlayerRef>,
        #[serde(default)]
        weapon: Option<Equipment>,
    },
    WeaponFire {
        #[serde(default)]
        shooter: Option<PlayerRef>,
        #[serde(default)]
        weapon: Option<Equipment>,
    },
}

impl GameEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PlayerHurt { .. } => EventKind::PlayerHurt,
            Self::WeaponFire { .. } => EventKind::WeaponFire,
        }
    }
}
