use bytes::BufMut;

use super::{Error, Frame, Head, Kind, Reason, StreamId, util};

/// A RST_STREAM frame terminates one stream with an error code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Reset {
    stream_id: StreamId,
    error_code: Reason,
}

impl Reset {
    #[must_use]
    pub fn new(stream_id: StreamId, error: Reason) -> Self {
        Self {
            stream_id,
            error_code: error,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn reason(&self) -> Reason {
        self.error_code
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        if payload.len() != 4 {
            return Err(Error::InvalidPayloadLength);
        }
        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        let error_code = util::unpack_octets_as_u32(payload, 0);

        Ok(Self {
            stream_id: head.stream_id(),
            error_code: error_code.into(),
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        tracing::trace!(
            id = u32::from(self.stream_id),
            code = ?self.error_code,
            "encoding RESET",
        );
        let head = Head::new(Kind::Reset, 0, self.stream_id);
        head.encode(4, dst);
        dst.put_u32(self.error_code.into());
    }
}

impl From<Reset> for Frame {
    fn from(src: Reset) -> Self {
        Self::Reset(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2::frame::HEADER_LEN;

    #[test]
    fn reset_round_trip() {
        let reset = Reset::new(StreamId::from(5), Reason::CANCEL);
        let mut buf = Vec::new();
        reset.encode(&mut buf);

        let head = Head::parse(&buf[3..]);
        let parsed = Reset::load(head, &buf[HEADER_LEN..]).unwrap();
        assert_eq!(parsed, reset);
    }
}
