use bytes::BufMut;

use super::{Error, Frame, Head, Kind, StreamId, util};

const SIZE_INCREMENT_MASK: u32 = 1 << 31;

/// A WINDOW_UPDATE frame refills a stream's send window.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WindowUpdate {
    pub stream_id: StreamId,
    pub size_increment: u32,
}

impl WindowUpdate {
    #[must_use]
    pub fn new(stream_id: StreamId, size_increment: u32) -> Self {
        Self {
            stream_id,
            size_increment,
        }
    }

    /// Builds a `WindowUpdate` frame from a raw frame.
    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::WindowUpdate);
        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }

        // Clear the reserved most significant bit.
        let size_increment = util::unpack_octets_as_u32(payload, 0) & !SIZE_INCREMENT_MASK;

        if size_increment == 0 {
            return Err(Error::InvalidWindowUpdateValue);
        }

        Ok(Self {
            stream_id: head.stream_id(),
            size_increment,
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        tracing::trace!(id = u32::from(self.stream_id), "encoding WINDOW_UPDATE");
        let head = Head::new(Kind::WindowUpdate, 0, self.stream_id);
        head.encode(4, dst);
        dst.put_u32(self.size_increment);
    }
}

impl From<WindowUpdate> for Frame {
    fn from(src: WindowUpdate) -> Self {
        Self::WindowUpdate(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2::frame::HEADER_LEN;

    #[test]
    fn window_update_round_trip() {
        let frame = WindowUpdate::new(StreamId::from(1), 16_384);
        let mut buf = Vec::new();
        frame.encode(&mut buf);

        let head = Head::parse(&buf[3..]);
        let parsed = WindowUpdate::load(head, &buf[HEADER_LEN..]).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn zero_increment_is_rejected() {
        let head = Head::new(Kind::WindowUpdate, 0, StreamId::from(1));
        assert_eq!(
            WindowUpdate::load(head, &[0, 0, 0, 0]),
            Err(Error::InvalidWindowUpdateValue)
        );
    }
}
