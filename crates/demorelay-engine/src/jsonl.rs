//! Decoder for line-delimited JSON recordings.
//!
//! The first non-blank line is the header object. Every following line is
//! one frame: `{"tick": N, "players": [...], "events": [...]}`. `players`
//! replaces the playing set when present; `events` fire in order once the
//! frame has been applied.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use demorelay_core::{
    DecodeError, DecoderFactory, EventKind, EventListener, GameEvent, HandlerId, Participant,
    ReplayDecoder, ReplayHeader, SessionKey,
};
use serde::Deserialize;

#[derive(Deserialize)]
struct RecordingHeader {
    #[serde(flatten)]
    header: ReplayHeader,
    #[serde(default)]
    tick_rate: Option<f64>,
}

#[derive(Deserialize)]
struct FrameRecord {
    #[serde(default)]
    tick: i64,
    #[serde(default)]
    players: Option<Vec<Participant>>,
    #[serde(default)]
    events: Vec<GameEvent>,
}

pub struct JsonlDecoder<R> {
    reader: Option<R>,
    line: usize,
    header: Option<ReplayHeader>,
    tick_rate: f64,
    pending: Option<FrameRecord>,
    exhausted: bool,
    current_frame: i64,
    ingame_tick: i64,
    players: Vec<Participant>,
    listeners: Vec<(HandlerId, EventKind, EventListener)>,
    next_handler: i64,
}

impl<R: BufRead + Send> JsonlDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            line: 0,
            header: None,
            tick_rate: 0.0,
            pending: None,
            exhausted: false,
            current_frame: 0,
            ingame_tick: 0,
            players: Vec::new(),
            listeners: Vec::new(),
            next_handler: 1,
        }
    }

    /// Next non-blank line, and whether it ended with a newline.
    fn read_line(&mut self) -> Result<Option<(String, bool)>, DecodeError> {
        let reader = self.reader.as_mut().ok_or(DecodeError::Closed)?;
        loop {
            let mut buf = String::new();
            if reader.read_line(&mut buf)? == 0 {
                return Ok(None);
            }
            self.line += 1;
            let terminated = buf.ends_with('\n');
            let text = buf.trim();
            if !text.is_empty() {
                return Ok(Some((text.to_string(), terminated)));
            }
            if !terminated {
                return Ok(None);
            }
        }
    }

    fn read_frame(&mut self) -> Result<Option<FrameRecord>, DecodeError> {
        let Some((text, terminated)) = self.read_line()? else {
            self.exhausted = true;
            return Ok(None);
        };
        match serde_json::from_str(&text) {
            Ok(frame) => Ok(Some(frame)),
            // an unterminated last line that does not parse was cut off mid-write
            Err(_) if !terminated => Err(DecodeError::UnexpectedEnd),
            Err(e) => Err(DecodeError::Malformed {
                what: "frame",
                line: self.line,
                detail: e.to_string(),
            }),
        }
    }

    fn apply(&mut self, frame: FrameRecord) {
        self.current_frame += 1;
        self.ingame_tick = frame.tick;
        if let Some(players) = frame.players {
            self.players = players;
        }
        for event in &frame.events {
            for (_, kind, listener) in &self.listeners {
                if *kind == event.kind() {
                    listener(event, self.current_frame);
                }
            }
        }
    }
}

impl<R: BufRead + Send> ReplayDecoder for JsonlDecoder<R> {
    fn parse_header(&mut self) -> Result<ReplayHeader, DecodeError> {
        if self.reader.is_none() {
            return Err(DecodeError::Closed);
        }
        if let Some(header) = &self.header {
            return Ok(header.clone());
        }
        let Some((text, terminated)) = self.read_line()? else {
            return Err(DecodeError::UnexpectedEnd);
        };
        let recording: RecordingHeader = match serde_json::from_str(&text) {
            Ok(recording) => recording,
            Err(_) if !terminated => return Err(DecodeError::UnexpectedEnd),
            Err(e) => {
                return Err(DecodeError::Malformed {
                    what: "header",
                    line: self.line,
                    detail: e.to_string(),
                })
            }
        };
        let header = recording.header;
        self.tick_rate = recording.tick_rate.unwrap_or_else(|| header.tick_rate());
        self.header = Some(header.clone());
        Ok(header)
    }

    fn parse_next_frame(&mut self) -> Result<bool, DecodeError> {
        if self.reader.is_none() {
            return Err(DecodeError::Closed);
        }
        if self.header.is_none() {
            self.parse_header()?;
        }

        let frame = match self.pending.take() {
            Some(frame) => frame,
            None if self.exhausted => return Ok(false),
            None => match self.read_frame()? {
                Some(frame) => frame,
                None => return Ok(false),
            },
        };
        self.apply(frame);
        self.pending = self.read_frame()?;
        Ok(self.pending.is_some())
    }

    fn current_frame(&self) -> i64 {
        self.current_frame
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
        self.reader = None;
        self.pending = None;
        self.listeners.clear();
        Ok(())
    }
}

/// Opens recordings from disk. Relative keys resolve against `root`.
#[derive(Clone, Debug, Default)]
pub struct JsonlDecoderFactory {
    root: Option<PathBuf>,
}

impl JsonlDecoderFactory {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    pub fn resolve(&self, key: &SessionKey) -> PathBuf {
        let path = Path::new(key.as_str());
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl DecoderFactory for JsonlDecoderFactory {
    fn open(&self, key: &SessionKey) -> Result<Box<dyn ReplayDecoder>, DecodeError> {
        let path = self.resolve(key);
        let file = File::open(&path).map_err(|source| DecodeError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Box::new(JsonlDecoder::new(BufReader::new(file))))
    }
}
