//! Deterministic decoder, factory and sink for tests without replay files.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use demorelay_core::{
    DecodeError, DecoderFactory, EventKind, EventListener, GameEvent, HandlerId, Participant,
    ReplayDecoder, ReplayHeader, SessionKey,
};
use parking_lot::Mutex;

use crate::sink::{ReplySink, SendError};

/// One pre-programmed stream unit.
#[derive(Clone, Debug, Default)]
pub struct ScriptedFrame {
    pub tick: i64,
    /// Replaces the playing set when present.
    pub players: Option<Vec<Participant>>,
    pub events: Vec<GameEvent>,
}

impl ScriptedFrame {
    pub fn new(tick: i64) -> Self {
        Self {
            tick,
            ..Default::default()
        }
    }

    pub fn with_players(mut self, players: Vec<Participant>) -> Self {
        self.players = Some(players);
        self
    }

    pub fn with_events(mut self, events: Vec<GameEvent>) -> Self {
        self.events = events;
        self
    }
}

/// Failure injected when the decoder reaches a given frame index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Report a truncated stream.
    Truncated,
    /// Report corrupt data.
    Malformed,
}

/// Decoder that replays an in-memory list of frames.
///
/// Position starts at 0 and each advance increments it; an advance returns
/// `true` while frames remain after the one it consumed.
pub struct ScriptedDecoder {
    header: ReplayHeader,
    tick_rate: f64,
    frames: Vec<ScriptedFrame>,
    next: usize,
    current_frame: Arc<AtomicI64>,
    ingame_tick: i64,
    players: Vec<Participant>,
    frame_delay: Option<Duration>,
    listeners: Vec<(HandlerId, EventKind, EventListener)>,
    next_handler: i64,
    header_parsed: bool,
    closed: Arc<AtomicBool>,
    fault: Option<(usize, Fault)>,
}

impl ScriptedDecoder {
    pub fn new(frames: Vec<ScriptedFrame>) -> Self {
        Self {
            header: ReplayHeader::default(),
            tick_rate: 64.0,
            frames,
            next: 0,
            current_frame: Arc::new(AtomicI64::new(0)),
            ingame_tick: 0,
            players: Vec::new(),
            frame_delay: None,
            listeners: Vec::new(),
            next_handler: 1,
            header_parsed: false,
            closed: Arc::new(AtomicBool::new(false)),
            fault: None,
        }
    }

    /// `count` empty frames with ticks `1..=count`.
    pub fn with_frame_count(count: usize) -> Self {
        Self::new((1..=count as i64).map(ScriptedFrame::new).collect())
    }

    pub fn with_header(mut self, header: ReplayHeader) -> Self {
        self.header = header;
        self
    }

    pub fn with_tick_rate(mut self, tick_rate: f64) -> Self {
        self.tick_rate = tick_rate;
        self
    }

    /// Fail when about to consume the frame at `index`.
    pub fn fail_at(mut self, index: usize, fault: Fault) -> Self {
        self.fault = Some((index, fault));
        self
    }

    /// Sleep this long inside every advance, to hold the session lock.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    /// Shared view of the position, readable after the session is evicted.
    pub fn position(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.current_frame)
    }

    /// Shared flag flipped by `close`.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn ensure_open(&self) -> Result<(), DecodeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DecodeError::Closed);
        }
        Ok(())
    }
}

impl ReplayDecoder for ScriptedDecoder {
    fn parse_header(&mut self) -> Result<ReplayHeader, DecodeError> {
        self.ensure_open()?;
        self.header_parsed = true;
        Ok(self.header.clone())
    }

    fn parse_next_frame(&mut self) -> Result<bool, DecodeError> {
        self.ensure_open()?;
        self.header_parsed = true;

        if let Some((at, fault)) = self.fault {
            if at == self.next {
                return Err(match fault {
                    Fault::Truncated => DecodeError::UnexpectedEnd,
                    Fault::Malformed => DecodeError::Malformed {
                        what: "frame",
                        line: at + 2,
                        detail: "scripted fault".into(),
                    },
                });
            }
        }

        let Some(frame) = self.frames.get(self.next).cloned() else {
            return Ok(false);
        };
        if let Some(delay) = self.frame_delay {
            std::thread::sleep(delay);
        }
        self.next += 1;
        let position = self.current_frame.fetch_add(1, Ordering::SeqCst) + 1;
        self.ingame_tick = frame.tick;
        if let Some(players) = frame.players {
            self.players = players;
        }
        for event in &frame.events {
            for (_, kind, listener) in &self.listeners {
                if *kind == event.kind() {
                    listener(event, position);
                }
            }
        }
        Ok(self.next < self.frames.len())
    }

    fn current_frame(&self) -> i64 {
        self.current_frame.load(Ordering::SeqCst)
    }

    fn tick_rate(&self) -> f64 {
        self.tick_rate
    }

    fn ingame_tick(&self) -> i64 {
        self.ingame_tick
    }

    fn playing(&self) -> Vec<Participant> {
        self.players.clone()
    }

    fn subscribe(&mut self, kind: EventKind, listener: EventListener) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        self.listeners.push((id, kind, listener));
        id
    }

    fn unsubscribe(&mut self, id: HandlerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _, _)| *existing != id);
        self.listeners.len() != before
    }

    fn close(&mut self) -> Result<(), DecodeError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

type ScriptBuilder = Box<dyn Fn() -> ScriptedDecoder + Send + Sync>;

/// Factory handing out scripted decoders per session key.
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: HashMap<SessionKey, ScriptBuilder>,
    opened: Mutex<Vec<(SessionKey, Arc<AtomicBool>)>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(
        mut self,
        key: &str,
        build: impl Fn() -> ScriptedDecoder + Send + Sync + 'static,
    ) -> Self {
        self.scripts.insert(SessionKey::from_raw(key), Box::new(build));
        self
    }

    pub fn open_count(&self, key: &str) -> usize {
        self.opened
            .lock()
            .iter()
            .filter(|(k, _)| k.as_str() == key)
            .count()
    }

    pub fn closed_count(&self, key: &str) -> usize {
        self.opened
            .lock()
            .iter()
            .filter(|(k, closed)| k.as_str() == key && closed.load(Ordering::SeqCst))
            .count()
    }
}

impl DecoderFactory for ScriptedFactory {
    fn open(&self, key: &SessionKey) -> Result<Box<dyn ReplayDecoder>, DecodeError> {
        let Some(build) = self.scripts.get(key) else {
            return Err(DecodeError::Open {
                path: key.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no script"),
            });
        };
        let decoder = build();
        self.opened.lock().push((key.clone(), decoder.closed_flag()));
        Ok(Box::new(decoder))
    }
}

/// Sink that records every payload in order.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(SessionKey, String)>>,
    unbound: Mutex<HashSet<SessionKey>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends for `key` fail as if no connection were bound.
    pub fn unbind(&self, key: &SessionKey) {
        self.unbound.lock().insert(key.clone());
    }

    pub fn payloads(&self, key: &SessionKey) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl ReplySink for RecordingSink {
    fn send(&self, key: &SessionKey, payload: &str) -> Result<(), SendError> {
        if self.unbound.lock().contains(key) {
            return Err(SendError::Unbound(key.clone()));
        }
        self.sent.lock().push((key.clone(), payload.to_string()));
        Ok(())
    }
}
