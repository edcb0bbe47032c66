use std::fmt;

use crate::h2::hpack;

use super::{Error, Frame, Head, Kind, StreamDependency, StreamId, util};

const END_STREAM: u8 = 0x1;
const END_HEADERS: u8 = 0x4;
const PADDED: u8 = 0x8;
const PRIORITY: u8 = 0x20;

/// A HEADERS frame: optional priority, then an HPACK header block.
#[derive(Clone, PartialEq, Eq)]
pub struct Headers {
    stream_id: StreamId,
    flags: HeadersFlag,
    priority: Option<StreamDependency>,
    pseudo: Pseudo,
    fields: Vec<hpack::Header>,
}

#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub(crate) struct HeadersFlag(u8);

/// The pseudo-header fields a message may open with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pseudo {
    pub method: Option<String>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    pub status: Option<String>,
}

impl Pseudo {
    #[must_use]
    pub fn request(method: &str, path: &str) -> Self {
        Self {
            method: Some(method.into()),
            path: Some(path.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn response(status: u16) -> Self {
        Self {
            status: Some(status.to_string()),
            ..Self::default()
        }
    }

    fn set(&mut self, name: &str, value: String) -> Result<(), Error> {
        let slot = match name {
            ":method" => &mut self.method,
            ":scheme" => &mut self.scheme,
            ":authority" => &mut self.authority,
            ":path" => &mut self.path,
            ":status" => &mut self.status,
            _ => return Err(Error::MalformedMessage),
        };
        if slot.is_some() {
            return Err(Error::MalformedMessage);
        }
        *slot = Some(value);
        Ok(())
    }

    fn for_each<F: FnMut(&str, &str)>(&self, mut f: F) {
        if let Some(v) = &self.method {
            f(":method", v);
        }
        if let Some(v) = &self.scheme {
            f(":scheme", v);
        }
        if let Some(v) = &self.authority {
            f(":authority", v);
        }
        if let Some(v) = &self.path {
            f(":path", v);
        }
        if let Some(v) = &self.status {
            f(":status", v);
        }
    }
}

impl Headers {
    #[must_use]
    pub fn new(stream_id: StreamId, pseudo: Pseudo, fields: Vec<hpack::Header>) -> Self {
        Self {
            stream_id,
            flags: HeadersFlag(END_HEADERS),
            priority: None,
            pseudo,
            fields,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn is_end_stream(&self) -> bool {
        self.flags.0 & END_STREAM == END_STREAM
    }

    pub fn set_end_stream(&mut self) {
        self.flags.0 |= END_STREAM;
    }

    #[must_use]
    pub fn is_end_headers(&self) -> bool {
        self.flags.0 & END_HEADERS == END_HEADERS
    }

    #[must_use]
    pub fn priority(&self) -> Option<&StreamDependency> {
        self.priority.as_ref()
    }

    pub fn set_priority(&mut self, dependency: StreamDependency) {
        self.flags.0 |= PRIORITY;
        self.priority = Some(dependency);
    }

    #[must_use]
    pub fn pseudo(&self) -> &Pseudo {
        &self.pseudo
    }

    #[must_use]
    pub fn fields(&self) -> &[hpack::Header] {
        &self.fields
    }

    pub fn into_parts(self) -> (Pseudo, Vec<hpack::Header>) {
        (self.pseudo, self.fields)
    }

    /// Splits the payload ahead of HPACK decoding: padding and priority
    /// are stripped here, the returned slice is the header fragment.
    pub fn load<'a>(head: Head, payload: &'a [u8]) -> Result<(Self, &'a [u8]), Error> {
        debug_assert_eq!(head.kind(), Kind::Headers);

        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        let flags = HeadersFlag(head.flag());
        let mut fragment = if flags.0 & PADDED == PADDED {
            util::strip_padding(payload)?
        } else {
            payload
        };

        let priority = if flags.0 & PRIORITY == PRIORITY {
            if fragment.len() < 5 {
                return Err(Error::InvalidPayloadLength);
            }
            let dependency = StreamDependency::load(&fragment[..5])?;
            if dependency.dependency_id == head.stream_id() {
                return Err(Error::InvalidDependencyId);
            }
            fragment = &fragment[5..];
            Some(dependency)
        } else {
            None
        };

        Ok((
            Self {
                stream_id: head.stream_id(),
                flags,
                priority,
                pseudo: Pseudo::default(),
                fields: Vec::new(),
            },
            fragment,
        ))
    }

    /// Decodes the accumulated header fragment into pseudo and regular
    /// fields. Pseudo fields must precede regular ones.
    pub fn decode_fields(
        &mut self,
        fragment: &[u8],
        decoder: &mut hpack::Decoder,
    ) -> Result<(), Error> {
        let mut seen_regular = false;
        for header in decoder.decode(fragment)? {
            if header.name.starts_with(':') {
                if seen_regular {
                    return Err(Error::MalformedMessage);
                }
                self.pseudo.set(&header.name, header.value)?;
            } else {
                seen_regular = true;
                self.fields.push(header);
            }
        }
        Ok(())
    }

    /// Encodes the frame, HPACK fragment included, into `dst`.
    pub fn encode(&self, encoder: &mut hpack::Encoder, dst: &mut Vec<u8>) {
        let mut fragment = Vec::new();
        self.pseudo
            .for_each(|name, value| encoder.encode_field(name, value, &mut fragment));
        for field in &self.fields {
            encoder.encode_field(&field.name, &field.value, &mut fragment);
        }

        let priority_len = if self.priority.is_some() { 5 } else { 0 };
        let head = Head::new(Kind::Headers, self.flags.0 | END_HEADERS, self.stream_id);
        head.encode(fragment.len() + priority_len, dst);
        if let Some(dependency) = &self.priority {
            dependency.encode(dst);
        }
        dst.extend_from_slice(&fragment);
    }
}

impl From<Headers> for Frame {
    fn from(src: Headers) -> Self {
        Self::Headers(src)
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Headers")
            .field("stream_id", &self.stream_id)
            .field("flags", &self.flags)
            .field("pseudo", &self.pseudo)
            .field("field_count", &self.fields.len())
            .finish()
    }
}

impl fmt::Debug for HeadersFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        util::debug_flags(f, self.0)
            .flag_if(self.0 & END_STREAM == END_STREAM, "END_STREAM")
            .flag_if(self.0 & END_HEADERS == END_HEADERS, "END_HEADERS")
            .flag_if(self.0 & PADDED == PADDED, "PADDED")
            .flag_if(self.0 & PRIORITY == PRIORITY, "PRIORITY")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2::frame::HEADER_LEN;
    use crate::h2::hpack::Header;

    fn round_trip(frame: &Headers) -> Headers {
        let mut encoder = hpack::Encoder::new();
        let mut buf = Vec::new();
        frame.encode(&mut encoder, &mut buf);

        let head = Head::parse(&buf[3..]);
        let (mut parsed, fragment) = Headers::load(head, &buf[HEADER_LEN..]).unwrap();
        let mut decoder = hpack::Decoder::new();
        parsed.decode_fields(fragment, &mut decoder).unwrap();
        parsed
    }

    #[test]
    fn request_headers_round_trip() {
        let mut frame = Headers::new(
            StreamId::from(1),
            Pseudo::request("GET", "/x"),
            vec![Header::new("accept-encoding", "gzip")],
        );
        frame.set_end_stream();

        let parsed = round_trip(&frame);
        assert_eq!(parsed, frame);
        assert!(parsed.is_end_stream());
        assert!(parsed.is_end_headers());
        assert_eq!(parsed.pseudo().method.as_deref(), Some("GET"));
    }

    #[test]
    fn priority_flag_carries_a_dependency() {
        let mut frame = Headers::new(StreamId::from(3), Pseudo::request("GET", "/"), vec![]);
        frame.set_priority(StreamDependency::new(StreamId::zero(), 15, false));

        let parsed = round_trip(&frame);
        assert_eq!(
            parsed.priority(),
            Some(&StreamDependency::new(StreamId::zero(), 15, false))
        );
    }

    #[test]
    fn pseudo_after_regular_field_is_malformed() {
        let mut block = Vec::new();
        let mut encoder = hpack::Encoder::new();
        encoder.encode_field("accept", "*/*", &mut block);
        encoder.encode_field(":method", "GET", &mut block);

        let head = Head::new(Kind::Headers, END_HEADERS, StreamId::from(1));
        let (mut frame, _) = Headers::load(head, &[]).unwrap();
        let mut decoder = hpack::Decoder::new();
        assert_eq!(
            frame.decode_fields(&block, &mut decoder),
            Err(Error::MalformedMessage)
        );
    }

    #[test]
    fn duplicate_pseudo_is_malformed() {
        let mut block = Vec::new();
        let mut encoder = hpack::Encoder::new();
        encoder.encode_field(":method", "GET", &mut block);
        encoder.encode_field(":method", "POST", &mut block);

        let head = Head::new(Kind::Headers, END_HEADERS, StreamId::from(1));
        let (mut frame, _) = Headers::load(head, &[]).unwrap();
        let mut decoder = hpack::Decoder::new();
        assert_eq!(
            frame.decode_fields(&block, &mut decoder),
            Err(Error::MalformedMessage)
        );
    }

    #[test]
    fn headers_on_stream_zero_are_rejected() {
        let head = Head::new(Kind::Headers, END_HEADERS, StreamId::zero());
        assert!(matches!(
            Headers::load(head, &[]),
            Err(Error::InvalidStreamId)
        ));
    }
}
