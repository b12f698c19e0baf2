//! Capability boundary to the replay decoding engine.
//!
//! The session layer never looks inside a replay. It drives a
//! `ReplayDecoder` through these calls and receives in-stream events through
//! listeners the decoder invokes synchronously from inside its own advance
//! calls, between one unit and the next.

use std::sync::Arc;

use crate::errors::DecodeError;
use crate::ids::{HandlerId, SessionKey};
use crate::replay::{EventKind, GameEvent, Participant, ReplayHeader};

/// Listener invoked for every event of a subscribed kind.
/// Receives the event and the decoder's position at the time it fired.
pub type EventListener = Arc<dyn Fn(&GameEvent, i64) + Send + Sync>;

/// A stateful decoder over one replay stream.
pub trait ReplayDecoder: Send {
    /// Parse the header. The first advance parses it implicitly when needed.
    fn parse_header(&mut self) -> Result<ReplayHeader, DecodeError>;

    /// Advance by exactly one unit. Returns `true` while more units remain.
    fn parse_next_frame(&mut self) -> Result<bool, DecodeError>;

    /// Number of units parsed so far.
    fn current_frame(&self) -> i64;

    /// Tick rate derived from the stream.
    fn tick_rate(&self) -> f64;

    /// Current in-stream tick counter.
    fn ingame_tick(&self) -> i64;

    /// Participants actively playing at the current position.
    fn playing(&self) -> Vec<Participant>;

    /// Register a listener for one event kind.
    fn subscribe(&mut self, kind: EventKind, listener: EventListener) -> HandlerId;

    /// Remove a listener. Returns `false` if the id was not registered.
    fn unsubscribe(&mut self, id: HandlerId) -> bool;

    /// Release the underlying stream.
    fn close(&mut self) -> Result<(), DecodeError>;
}

/// Opens decoders for session keys.
pub trait DecoderFactory: Send + Sync {
    fn open(&self, key: &SessionKey) -> Result<Box<dyn ReplayDecoder>, DecodeError>;
}
