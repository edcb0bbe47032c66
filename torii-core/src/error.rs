use std::{error, fmt, io};

/// Failures produced by the buffer pool and connection machinery.
#[derive(Debug, Clone)]
pub enum CoreError {
    /// An I/O operation failed and was recovered to a connection reset.
    Io(io::ErrorKind, Option<String>),

    /// A buffer asked for more committed space than its backing block
    /// reserves.
    BufferExhausted {
        requested: usize,
        reserved: usize,
    },

    /// The block pool reservation ran out of recyclable slices.
    PoolExhausted,

    /// The connection was already closed; the operation was dropped.
    ConnectionClosed,
}

impl CoreError {
    /// Returns true when the failure maps to the peer resetting the
    /// transport, which callers turn into an active close.
    #[must_use]
    pub fn is_connection_reset(&self) -> bool {
        matches!(
            self,
            Self::Io(io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe, _)
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(kind, Some(msg)) => write!(f, "i/o failure: {msg} ({kind:?})"),
            Self::Io(kind, None) => write!(f, "i/o failure: {}", io::Error::from(*kind)),
            Self::BufferExhausted {
                requested,
                reserved,
            } => write!(
                f,
                "buffer exhausted: requested {requested} bytes beyond the {reserved} byte block extent"
            ),
            Self::PoolExhausted => f.write_str("block pool exhausted"),
            Self::ConnectionClosed => f.write_str("connection already closed"),
        }
    }
}

impl error::Error for CoreError {}

impl From<io::Error> for CoreError {
    fn from(src: io::Error) -> Self {
        Self::Io(src.kind(), src.get_ref().map(|inner| inner.to_string()))
    }
}

impl From<CoreError> for io::Error {
    fn from(src: CoreError) -> Self {
        match src {
            CoreError::Io(kind, Some(msg)) => Self::new(kind, msg),
            CoreError::Io(kind, None) => kind.into(),
            other => Self::other(other.to_string()),
        }
    }
}
