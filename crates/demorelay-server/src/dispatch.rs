//! Routes one inbound command to the session driver and answers it.
//!
//! Dispatch blocks: decoding is synchronous and replies are queued with
//! `blocking_send`. Run it on the blocking pool.

use std::sync::Arc;

use demorelay_core::{DecoderFactory, SessionKey};
use demorelay_engine::sink::{ERROR, OK, TEST};
use demorelay_engine::{DriverError, ReplySink, SessionDriver};
use demorelay_telemetry::{CounterName, Counters};

use crate::bindings::{ConnectionBindings, Framer, Outbound};
use crate::command::Command;

/// What the connection loop should do after a dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Continue,
    Shutdown,
}

pub struct Dispatcher {
    driver: SessionDriver,
    bindings: Arc<ConnectionBindings>,
    framer: Arc<Framer>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub fn new(
        factory: Arc<dyn DecoderFactory>,
        bindings: Arc<ConnectionBindings>,
        counters: Arc<Counters>,
    ) -> Self {
        let framer = Arc::new(Framer::new(Arc::clone(&bindings)));
        let driver = SessionDriver::new(factory, framer.clone(), Arc::clone(&counters));
        Self {
            driver,
            bindings,
            framer,
            counters,
        }
    }

    pub fn driver(&self) -> &SessionDriver {
        &self.driver
    }

    /// Parse and run `task` for `key`. The key must already be bound to the
    /// caller's connection.
    pub fn dispatch(&self, key: &SessionKey, task: &str) -> DispatchOutcome {
        self.counters.incr(CounterName::Commands);

        let command = match task.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(session_key = %key, task, error = %e, "Rejected task");
                self.counters.incr(CounterName::CallerErrors);
                self.reply(key, ERROR);
                return DispatchOutcome::Continue;
            }
        };
        tracing::debug!(session_key = %key, task = command.name(), "Dispatching");

        let outcome = match command {
            Command::Shutdown => DispatchOutcome::Shutdown,
            _ => DispatchOutcome::Continue,
        };

        match self.run(key, command) {
            Ok(Some(payload)) => self.reply(key, &payload),
            Ok(None) => {}
            Err(e) if !e.is_fatal() => {
                tracing::warn!(session_key = %key, task, error = %e, "Command failed");
                self.counters.incr(CounterName::CallerErrors);
                self.reply(key, ERROR);
            }
            Err(e) => {
                tracing::error!(
                    session_key = %key,
                    task,
                    error = %e,
                    kind = e.error_kind(),
                    "Session failed"
                );
                self.counters.incr(CounterName::FatalErrors);
                self.reply(key, ERROR);
                self.disconnect(key);
            }
        }
        outcome
    }

    /// `Ok(None)` means the reply was already written.
    fn run(&self, key: &SessionKey, command: Command) -> Result<Option<String>, DriverError> {
        let driver = &self.driver;
        let payload = match command {
            Command::Test => TEST.to_string(),
            Command::NewParser => driver.new_parser(key)?,
            Command::ParseHeader => driver.parse_header(key)?,
            Command::ParseNextFrame => driver.parse_next_frame(key)?,
            Command::ParseToEnd => driver.parse_to_end(key)?,
            Command::ParseToEndWithMarkedFrames => driver.parse_to_end_with_marked_frames(key)?,
            Command::CurrentFrame => driver.current_frame(key)?,
            Command::FrameRate => driver.frame_rate(key)?,
            Command::InGameTick => driver.in_game_tick(key)?,
            Command::TickRate => driver.tick_rate(key)?,
            Command::Playing => driver.playing(key)?,
            Command::EventHandlers => driver.event_handlers(key)?,
            Command::MarkFrames(frames) => driver.mark_frames(key, frames)?,
            Command::RegisterEventHandler(kind) => driver.register_event_handler(key, kind)?,
            Command::UnregisterEventHandler(id) => driver.unregister_event_handler(key, id)?,
            Command::Close => {
                driver.close(key)?;
                self.disconnect(key);
                return Ok(None);
            }
            Command::Shutdown => {
                tracing::info!(session_key = %key, "Shutdown requested");
                OK.to_string()
            }
        };
        Ok(Some(payload))
    }

    fn reply(&self, key: &SessionKey, payload: &str) {
        if let Err(e) = self.framer.send(key, payload) {
            tracing::warn!(session_key = %key, error = %e, "Reply not delivered");
        }
    }

    /// Drop the key's binding and close the connection it pointed at.
    fn disconnect(&self, key: &SessionKey) {
        if let Some(binding) = self.bindings.unbind(key) {
            tracing::info!(
                session_key = %key,
                connection_id = %binding.connection_id,
                "Closing connection"
            );
            let _ = binding.tx.blocking_send(Outbound::Close);
        }
    }
}
