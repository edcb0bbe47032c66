use std::fmt;

use crate::h2::hpack;

use super::{Error, Frame, Head, Headers, Kind, Pseudo, StreamId, util};

const END_HEADERS: u8 = 0x4;
const PADDED: u8 = 0x8;

/// A PUSH_PROMISE frame declares a server-initiated stream and carries
/// the request-shaped headers the promised response will answer.
///
/// This server only constructs the wire form; nothing resolves promised
/// paths into content.
#[derive(Clone, PartialEq, Eq)]
pub struct PushPromise {
    stream_id: StreamId,
    promised_id: StreamId,
    flags: u8,
    pseudo: Pseudo,
    fields: Vec<hpack::Header>,
}

impl PushPromise {
    #[must_use]
    pub fn new(
        stream_id: StreamId,
        promised_id: StreamId,
        pseudo: Pseudo,
        fields: Vec<hpack::Header>,
    ) -> Self {
        Self {
            stream_id,
            promised_id,
            flags: END_HEADERS,
            pseudo,
            fields,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn promised_id(&self) -> StreamId {
        self.promised_id
    }

    #[must_use]
    pub fn pseudo(&self) -> &Pseudo {
        &self.pseudo
    }

    #[must_use]
    pub fn fields(&self) -> &[hpack::Header] {
        &self.fields
    }

    pub fn load(
        head: Head,
        payload: &[u8],
        decoder: &mut hpack::Decoder,
    ) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::PushPromise);

        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        let fragment = if head.flag() & PADDED == PADDED {
            util::strip_padding(payload)?
        } else {
            payload
        };
        if fragment.len() < 4 {
            return Err(Error::InvalidPayloadLength);
        }

        let (promised_id, _) = StreamId::parse(&fragment[..4]);
        if promised_id.is_zero() || !promised_id.is_server_initiated() {
            return Err(Error::InvalidStreamId);
        }

        // Reuse the HEADERS field discipline for the promised request.
        let mut headers = Headers::new(head.stream_id(), Pseudo::default(), Vec::new());
        headers.decode_fields(&fragment[4..], decoder)?;
        let (pseudo, fields) = headers.into_parts();

        Ok(Self {
            stream_id: head.stream_id(),
            promised_id,
            flags: head.flag() & (END_HEADERS | PADDED),
            pseudo,
            fields,
        })
    }

    pub fn encode(&self, encoder: &mut hpack::Encoder, dst: &mut Vec<u8>) {
        let headers = Headers::new(self.stream_id, self.pseudo.clone(), self.fields.clone());
        let mut fragment = Vec::new();
        // Borrow the HEADERS encoder for the fragment, then re-frame it.
        headers.encode(encoder, &mut fragment);
        let fragment = &fragment[super::HEADER_LEN..];

        let head = Head::new(Kind::PushPromise, END_HEADERS, self.stream_id);
        head.encode(4 + fragment.len(), dst);
        dst.extend_from_slice(&u32::from(self.promised_id).to_be_bytes());
        dst.extend_from_slice(fragment);
    }
}

impl From<PushPromise> for Frame {
    fn from(src: PushPromise) -> Self {
        Self::PushPromise(src)
    }
}

impl fmt::Debug for PushPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushPromise")
            .field("stream_id", &self.stream_id)
            .field("promised_id", &self.promised_id)
            .field("pseudo", &self.pseudo)
            .finish()
    }
}
