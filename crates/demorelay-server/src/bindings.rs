//! Session key → connection bindings and the framer that writes through them.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use demorelay_core::{ConnectionId, SessionKey};
use demorelay_engine::{ReplySink, SendError};
use tokio::sync::mpsc;

/// WebSocket message type of an inbound frame, echoed on replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// Work item for a connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    /// Send a close frame and stop writing.
    Close,
}

impl Outbound {
    pub fn framed(kind: FrameKind, payload: &str) -> Self {
        match kind {
            FrameKind::Text => Self::Text(payload.to_string()),
            FrameKind::Binary => Self::Binary(Bytes::copy_from_slice(payload.as_bytes())),
        }
    }
}

/// Where output for a session key currently goes.
#[derive(Clone, Debug)]
pub struct Binding {
    pub connection_id: ConnectionId,
    pub tx: mpsc::Sender<Outbound>,
    pub kind: FrameKind,
}

/// Last writer wins: every inbound message repoints its key.
#[derive(Default)]
pub struct ConnectionBindings {
    bindings: DashMap<SessionKey, Binding>,
}

impl ConnectionBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `key` at a connection, returning the previous binding.
    pub fn bind(&self, key: SessionKey, binding: Binding) -> Option<Binding> {
        self.bindings.insert(key, binding)
    }

    pub fn get(&self, key: &SessionKey) -> Option<Binding> {
        self.bindings.get(key).map(|b| b.value().clone())
    }

    pub fn unbind(&self, key: &SessionKey) -> Option<Binding> {
        self.bindings.remove(key).map(|(_, b)| b)
    }

    /// Drop every binding still pointing at `connection_id`.
    pub fn release(&self, connection_id: &ConnectionId) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, b| &b.connection_id != connection_id);
        before - self.bindings.len()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Writes payloads to whatever connection is bound to a key, using the
/// message type of that key's most recent inbound message.
pub struct Framer {
    bindings: Arc<ConnectionBindings>,
}

impl Framer {
    pub fn new(bindings: Arc<ConnectionBindings>) -> Self {
        Self { bindings }
    }
}

impl ReplySink for Framer {
    fn send(&self, key: &SessionKey, payload: &str) -> Result<(), SendError> {
        let binding = self
            .bindings
            .get(key)
            .ok_or_else(|| SendError::Unbound(key.clone()))?;
        binding
            .tx
            .blocking_send(Outbound::framed(binding.kind, payload))
            .map_err(|_| SendError::Closed(key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(kind: FrameKind) -> (Binding, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Binding {
                connection_id: ConnectionId::new(),
                tx,
                kind,
            },
            rx,
        )
    }

    #[test]
    fn last_writer_wins() {
        let bindings = ConnectionBindings::new();
        let key = SessionKey::from_raw("m");
        let (first, _rx1) = binding(FrameKind::Text);
        let (second, _rx2) = binding(FrameKind::Binary);
        let second_id = second.connection_id.clone();

        assert!(bindings.bind(key.clone(), first).is_none());
        assert!(bindings.bind(key.clone(), second).is_some());
        assert_eq!(bindings.get(&key).unwrap().connection_id, second_id);
        assert_eq!(bindings.len(), 1);
    }

    #[test]
    fn release_only_drops_own_bindings() {
        let bindings = ConnectionBindings::new();
        let (a, _rx_a) = binding(FrameKind::Text);
        let (b, _rx_b) = binding(FrameKind::Text);
        let a_id = a.connection_id.clone();
        bindings.bind(SessionKey::from_raw("x"), a.clone());
        bindings.bind(SessionKey::from_raw("y"), a);
        bindings.bind(SessionKey::from_raw("z"), b);

        assert_eq!(bindings.release(&a_id), 2);
        assert_eq!(bindings.len(), 1);
        assert!(bindings.get(&SessionKey::from_raw("z")).is_some());
    }

    #[test]
    fn framer_echoes_message_type() {
        let bindings = Arc::new(ConnectionBindings::new());
        let framer = Framer::new(Arc::clone(&bindings));
        let key = SessionKey::from_raw("m");

        let (text, mut text_rx) = binding(FrameKind::Text);
        bindings.bind(key.clone(), text);
        framer.send(&key, "Ok").unwrap();
        assert_eq!(text_rx.try_recv().unwrap(), Outbound::Text("Ok".into()));

        let (binary, mut binary_rx) = binding(FrameKind::Binary);
        bindings.bind(key.clone(), binary);
        framer.send(&key, "Ok").unwrap();
        assert_eq!(
            binary_rx.try_recv().unwrap(),
            Outbound::Binary(Bytes::from_static(b"Ok"))
        );
    }

    #[test]
    fn framer_fails_without_binding() {
        let framer = Framer::new(Arc::new(ConnectionBindings::new()));
        let key = SessionKey::from_raw("m");
        assert_eq!(framer.send(&key, "Ok"), Err(SendError::Unbound(key)));
    }

    #[test]
    fn framer_fails_on_closed_connection() {
        let bindings = Arc::new(ConnectionBindings::new());
        let framer = Framer::new(Arc::clone(&bindings));
        let key = SessionKey::from_raw("m");
        let (b, rx) = binding(FrameKind::Text);
        bindings.bind(key.clone(), b);
        drop(rx);
        assert_eq!(framer.send(&key, "Ok"), Err(SendError::Closed(key)));
    }
}
