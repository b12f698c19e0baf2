//! Per-session event subscriptions.
//!
//! Tracks which handler ids are live for each event kind and builds the
//! listeners handed to the decoder. A listener formats the event and writes
//! it to whatever connection is bound to the session key when it fires.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use demorelay_core::{EventKind, EventListener, GameEvent, HandlerId, ReplayDecoder, SessionKey};
use demorelay_telemetry::{CounterName, Counters};
use parking_lot::Mutex;

use crate::format;
use crate::sink::{ReplySink, SendError};

/// Outcome of a registration request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// A new listener was attached to the decoder.
    Added(HandlerId),
    /// A listener for this kind was already live; nothing changed.
    Existing(HandlerId),
}

impl Registration {
    pub fn id(&self) -> HandlerId {
        match self {
            Self::Added(id) | Self::Existing(id) => *id,
        }
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    by_kind: BTreeMap<EventKind, BTreeSet<HandlerId>>,
    failure: Arc<Mutex<Option<SendError>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `kind` on the decoder unless a subscription for it is live.
    pub fn register(
        &mut self,
        decoder: &mut dyn ReplayDecoder,
        kind: EventKind,
        key: &SessionKey,
        sink: Arc<dyn ReplySink>,
        counters: Arc<Counters>,
    ) -> Registration {
        if let Some(id) = self.by_kind.get(&kind).and_then(|ids| ids.first()) {
            return Registration::Existing(*id);
        }

        let listener = push_listener(key.clone(), sink, counters, Arc::clone(&self.failure));
        let id = decoder.subscribe(kind, listener);
        self.by_kind.entry(kind).or_default().insert(id);
        tracing::info!(session_key = %key, event = %kind, handler_id = %id, "Registered event handler");
        Registration::Added(id)
    }

    /// Remove a subscription by id. Returns `false` if the id was unknown.
    pub fn unregister(&mut self, decoder: &mut dyn ReplayDecoder, id: HandlerId) -> bool {
        let removed_from_decoder = decoder.unsubscribe(id);
        let mut removed_here = false;
        self.by_kind.retain(|_, ids| {
            removed_here |= ids.remove(&id);
            !ids.is_empty()
        });
        removed_from_decoder || removed_here
    }

    /// Live subscriptions ordered by handler id.
    pub fn handlers(&self) -> Vec<(EventKind, HandlerId)> {
        let mut all: Vec<(EventKind, HandlerId)> = self
            .by_kind
            .iter()
            .flat_map(|(kind, ids)| ids.iter().map(move |id| (*kind, *id)))
            .collect();
        all.sort_by_key(|(_, id)| *id);
        all
    }

    pub fn count(&self) -> usize {
        self.by_kind.values().map(BTreeSet::len).sum()
    }

    /// First push failure since the last call, if any.
    pub fn take_failure(&self) -> Option<SendError> {
        self.failure.lock().take()
    }
}

fn push_listener(
    key: SessionKey,
    sink: Arc<dyn ReplySink>,
    counters: Arc<Counters>,
    failure: Arc<Mutex<Option<SendError>>>,
) -> EventListener {
    Arc::new(move |event: &GameEvent, frame: i64| {
        if failure.lock().is_some() {
            return;
        }
        let record = format::event_record(event, frame);
        match sink.send(&key, &record) {
            Ok(()) => counters.incr(CounterName::Pushes),
            Err(e) => {
                tracing::warn!(session_key = %key, error = %e, "Event push failed");
                *failure.lock() = Some(e);
            }
        }
    })
}
