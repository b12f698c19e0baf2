pub mod decoder;
pub mod errors;
pub mod ids;
pub mod replay;

pub use decoder::{DecoderFactory, EventListener, ReplayDecoder};
pub use errors::DecodeError;
pub use ids::{ConnectionId, HandlerId, SessionKey};
pub use replay::{Equipment, EventKind, GameEvent, Participant, PlayerRef, ReplayHeader, Vector2, Vector3};
