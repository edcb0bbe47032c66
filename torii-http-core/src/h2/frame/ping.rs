use bytes::BufMut;

use super::{Error, Frame, Head, Kind, StreamId};

const ACK: u8 = 0x1;

/// A PING frame carries eight opaque bytes the receiver echoes back.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Ping {
    ack: bool,
    payload: [u8; 8],
}

impl Ping {
    #[must_use]
    pub fn new(payload: [u8; 8]) -> Self {
        Self {
            ack: false,
            payload,
        }
    }

    /// The ACK answering `ping`, opaque data echoed.
    #[must_use]
    pub fn pong(ping: &Self) -> Self {
        Self {
            ack: true,
            payload: ping.payload,
        }
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.ack
    }

    #[must_use]
    pub fn payload(&self) -> &[u8; 8] {
        &self.payload
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Ping);

        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() != 8 {
            return Err(Error::BadFrameSize);
        }

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(payload);
        Ok(Self {
            ack: head.flag() & ACK == ACK,
            payload: bytes,
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        let flags = if self.ack { ACK } else { 0 };
        tracing::trace!(ack = self.ack, "encoding PING");
        let head = Head::new(Kind::Ping, flags, StreamId::zero());
        head.encode(8, dst);
        dst.put_slice(&self.payload);
    }
}

impl From<Ping> for Frame {
    fn from(src: Ping) -> Self {
        Self::Ping(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2::frame::HEADER_LEN;

    #[test]
    fn ping_round_trip_and_pong_echo() {
        let ping = Ping::new(*b"toriiws!");
        let mut buf = Vec::new();
        ping.encode(&mut buf);

        let head = Head::parse(&buf[3..]);
        let parsed = Ping::load(head, &buf[HEADER_LEN..]).unwrap();
        assert_eq!(parsed, ping);

        let pong = Ping::pong(&parsed);
        assert!(pong.is_ack());
        assert_eq!(pong.payload(), ping.payload());
    }

    #[test]
    fn short_payload_is_rejected() {
        let head = Head::new(Kind::Ping, 0, StreamId::zero());
        assert_eq!(Ping::load(head, &[0; 7]), Err(Error::BadFrameSize));
    }
}
