use bytes::BufMut;

use super::StreamId;

/// The fixed 9-byte prefix of every HTTP/2 frame: 24-bit payload
/// length, 8-bit type, 8-bit flags, 31-bit stream id (high bit
/// reserved).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Head {
    kind: Kind,
    flag: u8,
    stream_id: StreamId,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Kind {
    Data = 0,
    Headers = 1,
    Priority = 2,
    Reset = 3,
    Settings = 4,
    PushPromise = 5,
    Ping = 6,
    GoAway = 7,
    WindowUpdate = 8,
    Continuation = 9,
    Unknown,
}

// ===== impl Head =====

impl Head {
    #[must_use]
    pub fn new(kind: Kind, flag: u8, stream_id: StreamId) -> Self {
        Self {
            kind,
            flag,
            stream_id,
        }
    }

    /// Parse an HTTP/2 frame header; `header` holds the 5 bytes after
    /// the length field.
    #[must_use]
    pub fn parse(header: &[u8]) -> Self {
        let (stream_id, _) = StreamId::parse(&header[2..]);

        Self {
            kind: Kind::new(header[0]),
            flag: header[1],
            stream_id,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn flag(&self) -> u8 {
        self.flag
    }

    pub fn encode<T: BufMut>(&self, payload_len: usize, dst: &mut T) {
        debug_assert!(super::HEADER_LEN <= dst.remaining_mut());

        dst.put_uint(payload_len as u64, 3);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.flag);
        dst.put_u32(self.stream_id.into());
    }

    /// Encode into a fixed 9-byte array, for back-filling a reserved
    /// span in a send buffer.
    #[must_use]
    pub fn encode_array(&self, payload_len: usize) -> [u8; super::HEADER_LEN] {
        let mut bytes = [0u8; super::HEADER_LEN];
        let mut dst = &mut bytes[..];
        self.encode(payload_len, &mut dst);
        bytes
    }
}

// ===== impl Kind =====

impl Kind {
    #[must_use]
    pub fn new(byte: u8) -> Self {
        match byte {
            0 => Self::Data,
            1 => Self::Headers,
            2 => Self::Priority,
            3 => Self::Reset,
            4 => Self::Settings,
            5 => Self::PushPromise,
            6 => Self::Ping,
            7 => Self::GoAway,
            8 => Self::WindowUpdate,
            9 => Self::Continuation,
            _ => Self::Unknown,
        }
    }
}
