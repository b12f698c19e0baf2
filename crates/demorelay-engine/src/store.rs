//! Process-wide table of replay sessions.
//!
//! Each entry sits behind its own mutex. Every operation on a key holds that
//! mutex for its whole duration, so commands on one key are serialized while
//! different keys proceed independently.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use demorelay_core::{DecodeError, ReplayDecoder, ReplayHeader, SessionKey};
use parking_lot::Mutex;

use crate::subscriptions::SubscriptionRegistry;

/// State of one parsing session.
pub struct Session {
    key: SessionKey,
    pub(crate) decoder: Box<dyn ReplayDecoder>,
    pub(crate) header: Option<ReplayHeader>,
    pub(crate) marked_frames: BTreeSet<i64>,
    pub(crate) subscriptions: SubscriptionRegistry,
    closed: bool,
}

impl Session {
    pub fn new(key: SessionKey, decoder: Box<dyn ReplayDecoder>) -> Self {
        Self {
            key,
            decoder,
            header: None,
            marked_frames: BTreeSet::new(),
            subscriptions: SubscriptionRegistry::new(),
            closed: false,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn header(&self) -> Option<&ReplayHeader> {
        self.header.as_ref()
    }

    pub fn marked_frames(&self) -> &BTreeSet<i64> {
        &self.marked_frames
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the decoder and drop cached state. Idempotent.
    pub fn shutdown(&mut self) -> Result<(), DecodeError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.header = None;
        self.marked_frames.clear();
        self.subscriptions = SubscriptionRegistry::new();
        self.decoder.close()
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<SessionKey, SessionHandle>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, returning the one it replaced.
    pub fn insert(&self, session: Session) -> Option<SessionHandle> {
        let key = session.key().clone();
        self.sessions.insert(key, Arc::new(Mutex::new(session)))
    }

    /// Handle for a key. The map guard is released before returning, so the
    /// caller may block on the session mutex without holding a shard lock.
    pub fn get(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.sessions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `key` only if it still maps to `handle`.
    pub fn remove_if_same(&self, key: &SessionKey, handle: &SessionHandle) -> bool {
        self.sessions
            .remove_if(key, |_, current| Arc::ptr_eq(current, handle))
            .is_some()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
