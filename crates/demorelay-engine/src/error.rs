use demorelay_core::{DecodeError, SessionKey};

use crate::sink::SendError;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("no session for {0}")]
    SessionNotFound(SessionKey),

    #[error("header not parsed for {0}")]
    HeaderNotParsed(SessionKey),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("send error: {0}")]
    Send(#[from] SendError),
}

impl DriverError {
    /// Errors caused by the caller's request rather than the session.
    /// These are answered with `Error` and change nothing.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::SessionNotFound(_) | Self::HeaderNotParsed(_))
    }

    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Decode(e) if e.is_benign())
    }

    /// Errors that tear down the session they occurred in.
    pub fn is_fatal(&self) -> bool {
        !self.is_caller_error() && !self.is_benign()
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::HeaderNotParsed(_) => "header_not_parsed",
            Self::Decode(e) => e.error_kind(),
            Self::Send(_) => "send",
        }
    }
}
