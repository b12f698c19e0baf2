use demorelay_core::SessionKey;

/// Generic success reply.
pub const OK: &str = "Ok";
/// Generic failure reply.
pub const ERROR: &str = "Error";
/// Reply to the `test` task.
pub const TEST: &str = "Test";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no connection bound to {0}")]
    Unbound(SessionKey),

    #[error("connection for {0} is closed")]
    Closed(SessionKey),
}

/// Where replies, snapshots and pushes for a session key are written.
///
/// Implementations block until the payload is queued on the connection, so
/// callers must run on a thread that is allowed to block.
pub trait ReplySink: Send + Sync {
    fn send(&self, key: &SessionKey, payload: &str) -> Result<(), SendError>;
}
