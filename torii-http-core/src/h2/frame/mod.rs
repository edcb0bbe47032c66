use std::fmt;

use crate::h2::hpack::DecoderError;

mod data;
mod go_away;
mod head;
mod headers;
mod ping;
mod priority;
mod push_promise;
mod reason;
mod reset;
mod settings;
mod stream_id;
mod util;
mod window_update;

pub use self::data::Data;
pub use self::go_away::GoAway;
pub use self::head::{Head, Kind};
pub use self::headers::{Headers, Pseudo};
pub use self::ping::Ping;
pub use self::priority::{Priority, StreamDependency};
pub use self::push_promise::PushPromise;
pub use self::reason::Reason;
pub use self::reset::Reset;
pub use self::settings::Settings;
pub use self::stream_id::{StreamId, StreamIdOverflow};
pub use self::window_update::WindowUpdate;

pub use self::settings::{
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, DEFAULT_SETTINGS_HEADER_TABLE_SIZE,
    MAX_MAX_FRAME_SIZE,
};

pub type FrameSize = u32;

pub const HEADER_LEN: usize = 9;

#[derive(Debug, Eq, PartialEq)]
pub enum Frame {
    Data(Data),
    Headers(Headers),
    Priority(Priority),
    PushPromise(PushPromise),
    Settings(Settings),
    Ping(Ping),
    GoAway(GoAway),
    WindowUpdate(WindowUpdate),
    Reset(Reset),
}

impl Frame {
    /// The stream the frame belongs to; zero for connection frames.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::Data(frame) => frame.stream_id(),
            Self::Headers(frame) => frame.stream_id(),
            Self::Priority(frame) => frame.stream_id,
            Self::PushPromise(frame) => frame.stream_id(),
            Self::Settings(..) | Self::GoAway(..) | Self::Ping(..) => StreamId::zero(),
            Self::WindowUpdate(frame) => frame.stream_id,
            Self::Reset(frame) => frame.stream_id(),
        }
    }
}

/// Errors raised while parsing a single HTTP/2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The payload length is not valid for the frame type.
    BadFrameSize,

    /// The padding length exceeds the frame payload.
    TooMuchPadding,

    /// An invalid setting value was provided.
    InvalidSettingValue,

    /// A zero WINDOW_UPDATE increment.
    InvalidWindowUpdateValue,

    /// The payload length does not match the frame-type contract.
    InvalidPayloadLength,

    /// A SETTINGS ACK carried a payload.
    InvalidPayloadAckSettings,

    /// A SETTINGS or PING frame carried a non-zero stream identifier,
    /// or a stream frame carried stream zero.
    InvalidStreamId,

    /// A HEADERS or PRIORITY frame depends on its own stream.
    InvalidDependencyId,

    /// A request or response is malformed.
    MalformedMessage,

    /// Failed to perform HPACK decoding.
    Hpack(DecoderError),
}

impl Error {
    /// The error code reported to the peer for this parse failure.
    #[must_use]
    pub fn reason(&self) -> Reason {
        match self {
            Self::BadFrameSize | Self::InvalidPayloadLength | Self::InvalidPayloadAckSettings => {
                Reason::FRAME_SIZE_ERROR
            }
            Self::Hpack(_) => Reason::COMPRESSION_ERROR,
            Self::InvalidWindowUpdateValue => Reason::FLOW_CONTROL_ERROR,
            _ => Reason::PROTOCOL_ERROR,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadFrameSize => f.write_str("bad frame size"),
            Self::TooMuchPadding => f.write_str("more padding than payload"),
            Self::InvalidSettingValue => f.write_str("invalid setting value"),
            Self::InvalidWindowUpdateValue => f.write_str("zero window update increment"),
            Self::InvalidPayloadLength => f.write_str("invalid payload length"),
            Self::InvalidPayloadAckSettings => f.write_str("SETTINGS ack with payload"),
            Self::InvalidStreamId => f.write_str("invalid stream identifier"),
            Self::InvalidDependencyId => f.write_str("stream depends on itself"),
            Self::MalformedMessage => f.write_str("malformed message"),
            Self::Hpack(err) => write!(f, "hpack: {err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<DecoderError> for Error {
    fn from(src: DecoderError) -> Self {
        Self::Hpack(src)
    }
}
