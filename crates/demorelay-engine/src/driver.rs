//! Session driver: the operations that create, advance and query sessions.
//!
//! Every method returns the reply payload for the caller or a `DriverError`.
//! Fatal errors evict the session before returning; caller errors leave all
//! state untouched. A truncated replay is logged and treated as completion.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use demorelay_core::{DecodeError, DecoderFactory, EventKind, HandlerId, SessionKey};
use demorelay_telemetry::{CounterName, Counters};

use crate::error::DriverError;
use crate::format;
use crate::sink::{ReplySink, OK};
use crate::store::{Session, SessionStore};
use crate::subscriptions::Registration;

pub struct SessionDriver {
    store: Arc<SessionStore>,
    factory: Arc<dyn DecoderFactory>,
    sink: Arc<dyn ReplySink>,
    counters: Arc<Counters>,
}

impl SessionDriver {
    pub fn new(
        factory: Arc<dyn DecoderFactory>,
        sink: Arc<dyn ReplySink>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            store: Arc::new(SessionStore::new()),
            factory,
            sink,
            counters,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn has_session(&self, key: &SessionKey) -> bool {
        self.store.contains(key)
    }

    /// Run `op` with the key's session locked. Evicts the session if `op`
    /// fails fatally.
    fn with_session<T>(
        &self,
        key: &SessionKey,
        op: impl FnOnce(&mut Session) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let handle = self
            .store
            .get(key)
            .ok_or_else(|| DriverError::SessionNotFound(key.clone()))?;
        let mut session = handle.lock();
        if session.is_closed() {
            return Err(DriverError::SessionNotFound(key.clone()));
        }

        let result = op(&mut *session);
        if let Err(ref e) = result {
            if e.is_fatal() {
                tracing::error!(
                    session_key = %key,
                    error = %e,
                    kind = e.error_kind(),
                    "Session failed, evicting"
                );
                if let Err(close_err) = session.shutdown() {
                    tracing::warn!(session_key = %key, error = %close_err, "Decoder close failed");
                }
                drop(session);
                self.store.remove_if_same(key, &handle);
            }
        }
        result
    }

    pub fn new_parser(&self, key: &SessionKey) -> Result<String, DriverError> {
        tracing::info!(session_key = %key, "New parser");
        let decoder = self.factory.open(key)?;
        if let Some(previous) = self.store.insert(Session::new(key.clone(), decoder)) {
            tracing::warn!(session_key = %key, "Replacing existing session");
            if let Err(e) = previous.lock().shutdown() {
                tracing::warn!(session_key = %key, error = %e, "Closing replaced decoder failed");
            }
        }
        Ok(OK.into())
    }

    pub fn parse_header(&self, key: &SessionKey) -> Result<String, DriverError> {
        self.with_session(key, |session| {
            if let Some(header) = tolerate_end(key, session.decoder.parse_header().map(Some), None)? {
                tracing::debug!(
                    session_key = %key,
                    map = %header.map_name,
                    frames = header.playback_frames,
                    "Parsed header"
                );
                session.header = Some(header);
            }
            Ok(OK.into())
        })
    }

    /// Advance one unit. Replies `true` while more units remain.
    pub fn parse_next_frame(&self, key: &SessionKey) -> Result<String, DriverError> {
        self.with_session(key, |session| {
            let more = tolerate_end(key, session.decoder.parse_next_frame(), false)?;
            check_pushes(session)?;
            Ok(more.to_string())
        })
    }

    /// Advance until the stream is exhausted. Stops at the first unit whose
    /// event pushes could not be delivered.
    pub fn parse_to_end(&self, key: &SessionKey) -> Result<String, DriverError> {
        self.with_session(key, |session| {
            let started = Instant::now();
            while tolerate_end(key, session.decoder.parse_next_frame(), false)? {
                check_pushes(session)?;
            }
            check_pushes(session)?;
            tracing::info!(
                session_key = %key,
                elapsed_ms = started.elapsed().as_millis() as u64,
                frames = session.decoder.current_frame(),
                "Parsed to end"
            );
            Ok(OK.into())
        })
    }

    /// Walk the rest of the stream one unit at a time, writing a snapshot
    /// line for every marked position as it is reached.
    ///
    /// The position is checked before the first advance and after each
    /// advance that reports more data. Each marked position is written at
    /// most once per pass, and the session's marked set is left intact.
    pub fn parse_to_end_with_marked_frames(&self, key: &SessionKey) -> Result<String, DriverError> {
        self.with_session(key, |session| {
            let started = Instant::now();
            let mut pending = session.marked_frames.clone();
            let mut emitted = 0u64;
            let mut more = true;

            while more {
                let frame = session.decoder.current_frame();
                if pending.remove(&frame) {
                    let line = format::marked_frame(frame, &session.decoder.playing());
                    self.sink.send(key, &line)?;
                    emitted += 1;
                }
                more = tolerate_end(key, session.decoder.parse_next_frame(), false)?;
                check_pushes(session)?;
            }

            self.counters.add(CounterName::Snapshots, emitted);
            tracing::info!(
                session_key = %key,
                elapsed_ms = started.elapsed().as_millis() as u64,
                emitted,
                missed = pending.len(),
                "Marked pass done"
            );
            Ok(OK.into())
        })
    }

    pub fn current_frame(&self, key: &SessionKey) -> Result<String, DriverError> {
        self.with_session(key, |session| Ok(session.decoder.current_frame().to_string()))
    }

    pub fn frame_rate(&self, key: &SessionKey) -> Result<String, DriverError> {
        self.with_session(key, |session| {
            let header = session
                .header
                .as_ref()
                .ok_or_else(|| DriverError::HeaderNotParsed(key.clone()))?;
            Ok(header.frame_rate().to_string())
        })
    }

    pub fn tick_rate(&self, key: &SessionKey) -> Result<String, DriverError> {
        self.with_session(key, |session| Ok(session.decoder.tick_rate().to_string()))
    }

    pub fn in_game_tick(&self, key: &SessionKey) -> Result<String, DriverError> {
        self.with_session(key, |session| Ok(session.decoder.ingame_tick().to_string()))
    }

    /// Snapshot of the participants at the current position.
    pub fn playing(&self, key: &SessionKey) -> Result<String, DriverError> {
        self.with_session(key, |session| Ok(format::snapshot(&session.decoder.playing())))
    }

    /// Live subscriptions as `<EventType>:<id>` lines.
    pub fn event_handlers(&self, key: &SessionKey) -> Result<String, DriverError> {
        self.with_session(key, |session| {
            Ok(session
                .subscriptions
                .handlers()
                .iter()
                .map(|(kind, id)| format!("{kind}:{id}"))
                .collect::<Vec<_>>()
                .join("\n"))
        })
    }

    /// Replace the marked set wholesale.
    pub fn mark_frames(&self, key: &SessionKey, frames: BTreeSet<i64>) -> Result<String, DriverError> {
        self.with_session(key, |session| {
            tracing::info!(session_key = %key, count = frames.len(), "Marked frames");
            session.marked_frames = frames;
            Ok(OK.into())
        })
    }

    pub fn register_event_handler(&self, key: &SessionKey, kind: EventKind) -> Result<String, DriverError> {
        self.with_session(key, |session| {
            let registration = session.subscriptions.register(
                &mut *session.decoder,
                kind,
                key,
                Arc::clone(&self.sink),
                Arc::clone(&self.counters),
            );
            if let Registration::Existing(id) = registration {
                tracing::debug!(session_key = %key, event = %kind, handler_id = %id, "Already registered");
            }
            Ok(OK.into())
        })
    }

    pub fn unregister_event_handler(&self, key: &SessionKey, id: HandlerId) -> Result<String, DriverError> {
        self.with_session(key, |session| {
            if !session.subscriptions.unregister(&mut *session.decoder, id) {
                tracing::debug!(session_key = %key, handler_id = %id, "Unknown handler id");
            }
            Ok(OK.into())
        })
    }

    /// Reply `Ok`, then close the decoder and evict the session.
    ///
    /// The reply is written here so it reaches the client before teardown;
    /// callers must not send another reply on success.
    pub fn close(&self, key: &SessionKey) -> Result<(), DriverError> {
        let handle = self
            .store
            .get(key)
            .ok_or_else(|| DriverError::SessionNotFound(key.clone()))?;
        let mut session = handle.lock();
        if session.is_closed() {
            return Err(DriverError::SessionNotFound(key.clone()));
        }

        if let Err(e) = self.sink.send(key, OK) {
            tracing::warn!(session_key = %key, error = %e, "Close acknowledgement not delivered");
        }
        let handlers = session.subscriptions.count();
        if let Err(e) = session.shutdown() {
            tracing::warn!(session_key = %key, error = %e, "Decoder close failed");
        }
        drop(session);
        self.store.remove_if_same(key, &handle);
        tracing::info!(session_key = %key, handlers, "Done");
        Ok(())
    }
}

/// Map the benign end-of-data error to `fallback`.
fn tolerate_end<T>(key: &SessionKey, result: Result<T, DecodeError>, fallback: T) -> Result<T, DecodeError> {
    match result {
        Err(e) if e.is_benign() => {
            tracing::warn!(session_key = %key, "Unexpected end of replay, treating as complete");
            Ok(fallback)
        }
        other => other,
    }
}

fn check_pushes(session: &Session) -> Result<(), DriverError> {
    match session.subscriptions.take_failure() {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
