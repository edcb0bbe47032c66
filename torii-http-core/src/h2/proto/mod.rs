//! The HTTP/2 connection driver.

mod connection;
mod streams;

pub use self::connection::{
    Http2Connection, PeerMessage, RequestHead, ResponseHead, CONNECTION_PREFACE,
};

use std::{fmt, io};

use bytes::Bytes;

use crate::h2::frame::{self, Reason, StreamId};

/// Either an H2 reason or an I/O error.
#[derive(Clone, Debug)]
pub enum Error {
    /// A stream-level failure: emit RST_STREAM, keep the connection.
    Reset(StreamId, Reason, Initiator),
    /// A connection-level failure: emit GOAWAY, close actively.
    GoAway(Bytes, Reason, Initiator),
    /// The transport failed underneath the codec.
    Io(io::ErrorKind, Option<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Initiator {
    Library,
    Remote,
}

impl Error {
    pub(crate) fn library_reset(reason: Reason) -> Self {
        Self::Reset(StreamId::zero(), reason, Initiator::Library)
    }

    pub(crate) fn stream_reset(stream_id: StreamId, reason: Reason) -> Self {
        Self::Reset(stream_id, reason, Initiator::Library)
    }

    pub(crate) fn library_go_away(reason: Reason) -> Self {
        Self::GoAway(Bytes::new(), reason, Initiator::Library)
    }

    pub(crate) fn library_go_away_data(reason: Reason, debug_data: impl Into<Bytes>) -> Self {
        Self::GoAway(debug_data.into(), reason, Initiator::Library)
    }

    /// True when this error tears the whole connection down.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::GoAway(..) | Self::Io(..))
    }

    #[must_use]
    pub fn reason(&self) -> Option<Reason> {
        match self {
            Self::Reset(_, reason, _) | Self::GoAway(_, reason, _) => Some(*reason),
            Self::Io(..) => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset(stream_id, reason, initiator) => write!(
                f,
                "stream {} reset by {initiator:?}: {reason}",
                u32::from(*stream_id)
            ),
            Self::GoAway(_, reason, initiator) => {
                write!(f, "connection error by {initiator:?}: {reason}")
            }
            Self::Io(kind, Some(msg)) => write!(f, "io error: {msg} ({kind:?})"),
            Self::Io(kind, None) => write!(f, "io error: {}", io::Error::from(*kind)),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(src: io::Error) -> Self {
        Self::Io(src.kind(), src.get_ref().map(|inner| inner.to_string()))
    }
}

impl From<torii_core::CoreError> for Error {
    fn from(src: torii_core::CoreError) -> Self {
        io::Error::from(src).into()
    }
}

impl From<frame::Error> for Error {
    fn from(src: frame::Error) -> Self {
        Self::library_go_away(src.reason())
    }
}
