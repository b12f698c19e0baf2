/// Errors raised by a replay decoder.
///
/// `UnexpectedEnd` is the one benign variant: a truncated recording still
/// counts as a completed walk. Everything else is fatal to the session that
/// owns the decoder.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of replay")]
    UnexpectedEnd,

    #[error("failed to open replay {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed {what} at line {line}: {detail}")]
    Malformed {
        what: &'static str,
        line: usize,
        detail: String,
    },

    #[error("decoder is closed")]
    Closed,
}

impl DecodeError {
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::UnexpectedEnd)
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnexpectedEnd => "unexpected_end",
            Self::Open { .. } => "open",
            Self::Io(_) => "io",
            Self::Malformed { .. } => "malformed",
            Self::Closed => "closed",
        }
    }
}
