use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use torii_core::IoBuffer;

use crate::body::BodySource;
use crate::h2::frame::{
    self, Data, GoAway, Head, Headers, Kind, Ping, Priority, Pseudo, PushPromise, Reason, Reset,
    Settings, StreamId, WindowUpdate, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE,
    HEADER_LEN,
};
use crate::h2::hpack;

use super::streams::{SendQueue, Store};
use super::Error;

/// The 24-byte client connection preface (RFC 7540 §3.5).
pub const CONNECTION_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const DATA_END_STREAM: u8 = 0x1;
const HEADERS_END_HEADERS: u8 = 0x4;

/// Reader progression: preface once, then frame head / payload pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    ConnectionPreface,
    FrameHead,
    ReadPayload { head: Head, len: usize },
}

/// A parsed message surfaced to the server glue.
#[derive(Debug)]
pub enum PeerMessage {
    /// A complete request header block (END_HEADERS seen).
    Request(RequestHead),
    /// One DATA chunk of a request body.
    Body {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// The peer is going away; no new streams will be accepted.
    GoAway {
        last_stream_id: StreamId,
        reason: Reason,
        debug_data: Bytes,
    },
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub stream_id: StreamId,
    pub pseudo: Pseudo,
    pub fields: Vec<hpack::Header>,
    pub end_stream: bool,
}

impl RequestHead {
    /// Converts into the shared request representation used by the
    /// response pipeline.
    pub fn into_http(self) -> Result<http::Request<()>, Error> {
        let malformed = || Error::stream_reset(self.stream_id, Reason::PROTOCOL_ERROR);

        let method = self
            .pseudo
            .method
            .as_deref()
            .and_then(|m| http::Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(malformed)?;
        let path = self.pseudo.path.as_deref().unwrap_or("/");
        let uri: http::Uri = path.parse().map_err(|_| malformed())?;

        let mut builder = http::Request::builder()
            .method(method)
            .uri(uri)
            .version(http::Version::HTTP_2);
        for field in &self.fields {
            builder = builder.header(field.name.as_str(), field.value.as_str());
        }
        builder.body(()).map_err(|_| malformed())
    }
}

/// The response head queued against a stream.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub fields: Vec<hpack::Header>,
}

struct ResponseEntry {
    head: ResponseHead,
    body: Box<dyn BodySource>,
    head_sent: bool,
}

/// A header block split across HEADERS + CONTINUATION frames.
struct PartialHeaders {
    frame: Headers,
    fragment: Vec<u8>,
}

/// One HTTP/2 connection: reader state machine, both HPACK directions,
/// the stream registry, and the weighted response scheduler.
pub struct Http2Connection {
    read_state: ReadState,
    decoder: hpack::Decoder,
    encoder: hpack::Encoder,
    streams: Store,
    queue: SendQueue,
    responses: HashMap<usize, ResponseEntry>,
    continuation: Option<PartialHeaders>,

    /// Largest payload we accept before `FRAME_SIZE_ERROR`.
    max_recv_frame_size: usize,
    /// Ceiling for outgoing DATA payloads, lowered by peer SETTINGS.
    max_send_frame_size: usize,
    /// Starting (and refill) credit for stream send windows.
    initial_window: u32,
    /// Upper bound for one DATA chunk, from the configured buffer width.
    chunk_size: usize,

    /// Highest client stream we opened a request on.
    last_recv_stream_id: StreamId,
    /// Next id for server-initiated (promised) streams.
    next_push_id: StreamId,
    peer_going_away: bool,
    local_going_away: bool,
}

impl Http2Connection {
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self {
            read_state: ReadState::ConnectionPreface,
            decoder: hpack::Decoder::new(),
            encoder: hpack::Encoder::new(),
            streams: Store::default(),
            queue: SendQueue::default(),
            responses: HashMap::new(),
            continuation: None,
            max_recv_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
            max_send_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
            initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
            chunk_size: chunk_size.max(1),
            last_recv_stream_id: StreamId::zero(),
            next_push_id: StreamId::zero(),
            peer_going_away: false,
            local_going_away: false,
        }
    }

    /// Writes the server's own SETTINGS frame; the first bytes on any
    /// h2 connection after the client preface is consumed.
    pub fn write_settings(&mut self, out: &mut IoBuffer) -> Result<(), Error> {
        write_frame(out, |dst| Settings::default().encode(dst))
    }

    /// Applies the base64url `HTTP2-Settings` payload exchanged during
    /// an h2c upgrade, before any frame arrives.
    pub fn apply_h2c_settings(&mut self, payload: &[u8]) -> Result<(), Error> {
        let head = Head::new(Kind::Settings, 0, StreamId::zero());
        let settings = Settings::load(head, payload).map_err(Error::from)?;
        self.apply_remote_settings(&settings);
        Ok(())
    }

    /// Registers the request that rode the h2c upgrade as stream 1 in
    /// half-closed (remote) state, per RFC 7540 §3.2.
    pub fn upgrade_request(&mut self) -> Result<StreamId, Error> {
        let stream_id = StreamId::from(1);
        let key = self.streams.get_or_create(stream_id);
        self.streams.get_mut(key).state.recv_open(true)?;
        self.last_recv_stream_id = stream_id;
        Ok(stream_id)
    }

    #[must_use]
    pub fn is_going_away(&self) -> bool {
        self.peer_going_away || self.local_going_away
    }

    #[must_use]
    pub fn has_pending_responses(&self) -> bool {
        !self.queue.is_empty()
    }

    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Consumes whatever complete frames sit in `buf`, answering
    /// control frames into `out` and surfacing request progress.
    pub fn recv(
        &mut self,
        buf: &mut IoBuffer,
        out: &mut IoBuffer,
    ) -> Result<Vec<PeerMessage>, Error> {
        let mut messages = Vec::new();

        loop {
            match self.read_state {
                ReadState::ConnectionPreface => {
                    if buf.readable() < CONNECTION_PREFACE.len() {
                        return Ok(messages);
                    }
                    if &buf.peek()[..CONNECTION_PREFACE.len()] != CONNECTION_PREFACE {
                        tracing::warn!("connection preface mismatch");
                        return Err(Error::library_go_away_data(
                            Reason::PROTOCOL_ERROR,
                            "invalid connection preface",
                        ));
                    }
                    buf.retrieve(CONNECTION_PREFACE.len());
                    tracing::trace!("connection preface accepted");
                    self.read_state = ReadState::FrameHead;
                }
                ReadState::FrameHead => {
                    if buf.readable() < HEADER_LEN {
                        return Ok(messages);
                    }
                    let bytes = buf.peek();
                    let len = ((bytes[0] as usize) << 16)
                        | ((bytes[1] as usize) << 8)
                        | bytes[2] as usize;
                    let head = Head::parse(&bytes[3..HEADER_LEN]);
                    if len > self.max_recv_frame_size {
                        return Err(Error::library_go_away(Reason::FRAME_SIZE_ERROR));
                    }
                    buf.retrieve(HEADER_LEN);
                    self.read_state = ReadState::ReadPayload { head, len };
                }
                ReadState::ReadPayload { head, len } => {
                    if buf.readable() < len {
                        return Ok(messages);
                    }
                    let payload = buf.peek()[..len].to_vec();
                    buf.retrieve(len);
                    self.read_state = ReadState::FrameHead;
                    self.dispatch(head, &payload, out, &mut messages)?;
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        head: Head,
        payload: &[u8],
        out: &mut IoBuffer,
        messages: &mut Vec<PeerMessage>,
    ) -> Result<(), Error> {
        // A header block in flight permits nothing but its
        // CONTINUATION frames.
        if self.continuation.is_some() && head.kind() != Kind::Continuation {
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        }

        match head.kind() {
            Kind::Settings => self.recv_settings(head, payload, out),
            Kind::Ping => self.recv_ping(head, payload, out),
            Kind::Headers => self.recv_headers(head, payload, out, messages),
            Kind::Continuation => self.recv_continuation(head, payload, out, messages),
            Kind::Data => self.recv_data(head, payload, out, messages),
            Kind::Priority => self.recv_priority(head, payload),
            Kind::Reset => self.recv_reset(head, payload),
            Kind::WindowUpdate => self.recv_window_update(head, payload),
            Kind::GoAway => {
                let frame = GoAway::load(payload).map_err(Error::from)?;
                tracing::info!(
                    last_stream_id = u32::from(frame.last_stream_id()),
                    reason = %frame.reason(),
                    debug = %String::from_utf8_lossy(frame.debug_data()),
                    "received GOAWAY"
                );
                self.peer_going_away = true;
                messages.push(PeerMessage::GoAway {
                    last_stream_id: frame.last_stream_id(),
                    reason: frame.reason(),
                    debug_data: frame.debug_data().clone(),
                });
                Ok(())
            }
            Kind::PushPromise => {
                // Clients cannot push.
                Err(Error::library_go_away(Reason::PROTOCOL_ERROR))
            }
            Kind::Unknown => {
                tracing::trace!(flag = head.flag(), "ignoring unknown frame type");
                Ok(())
            }
        }
    }

    fn recv_settings(
        &mut self,
        head: Head,
        payload: &[u8],
        out: &mut IoBuffer,
    ) -> Result<(), Error> {
        let settings = Settings::load(head, payload).map_err(Error::from)?;
        if settings.is_ack() {
            // Our settings carry no values, so repeated ACKs have
            // nothing further to apply.
            tracing::trace!("received SETTINGS ack");
            return Ok(());
        }

        self.apply_remote_settings(&settings);
        write_frame(out, |dst| Settings::ack().encode(dst))
    }

    fn apply_remote_settings(&mut self, settings: &Settings) {
        tracing::debug!(?settings, "applying remote settings");
        if let Some(size) = settings.header_table_size {
            self.encoder.set_max_table_size(size as usize);
        }
        if let Some(size) = settings.max_frame_size {
            self.max_send_frame_size = size as usize;
        }
        if let Some(window) = settings.initial_window_size {
            self.initial_window = window;
        }
    }

    fn recv_ping(&mut self, head: Head, payload: &[u8], out: &mut IoBuffer) -> Result<(), Error> {
        let ping = Ping::load(head, payload).map_err(Error::from)?;
        if ping.is_ack() {
            tracing::trace!("received PING ack");
            return Ok(());
        }
        write_frame(out, |dst| Ping::pong(&ping).encode(dst))
    }

    fn recv_headers(
        &mut self,
        head: Head,
        payload: &[u8],
        out: &mut IoBuffer,
        messages: &mut Vec<PeerMessage>,
    ) -> Result<(), Error> {
        if !head.stream_id().is_client_initiated() {
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        }

        let (frame, fragment) = Headers::load(head, payload).map_err(Error::from)?;

        if self.local_going_away && head.stream_id() > self.last_recv_stream_id {
            // Told the peer to stop; late streams are refused.
            return self.send_reset(out, head.stream_id(), Reason::REFUSED_STREAM);
        }

        let partial = PartialHeaders {
            frame,
            fragment: fragment.to_vec(),
        };
        if head.flag() & HEADERS_END_HEADERS == HEADERS_END_HEADERS {
            self.finish_headers(partial, out, messages)
        } else {
            self.continuation = Some(partial);
            Ok(())
        }
    }

    fn recv_continuation(
        &mut self,
        head: Head,
        payload: &[u8],
        out: &mut IoBuffer,
        messages: &mut Vec<PeerMessage>,
    ) -> Result<(), Error> {
        let Some(mut partial) = self.continuation.take() else {
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        };
        if head.stream_id() != partial.frame.stream_id() {
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        }

        partial.fragment.extend_from_slice(payload);
        if head.flag() & HEADERS_END_HEADERS == HEADERS_END_HEADERS {
            self.finish_headers(partial, out, messages)
        } else {
            self.continuation = Some(partial);
            Ok(())
        }
    }

    fn finish_headers(
        &mut self,
        mut partial: PartialHeaders,
        out: &mut IoBuffer,
        messages: &mut Vec<PeerMessage>,
    ) -> Result<(), Error> {
        let stream_id = partial.frame.stream_id();
        let key = self.streams.get_or_create(stream_id);

        if self.streams.get(key).state.is_closed() {
            return self.send_reset(out, stream_id, Reason::STREAM_CLOSED);
        }
        if !self.streams.get(key).state.is_recv_headers() {
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        }

        partial
            .frame
            .decode_fields(&partial.fragment, &mut self.decoder)
            .map_err(Error::from)?;

        let end_stream = partial.frame.is_end_stream();
        self.streams.get_mut(key).state.recv_open(end_stream)?;
        self.streams.get_mut(key).window = self.initial_window;

        if let Some(dependency) = partial.frame.priority() {
            let dependency = dependency.clone();
            self.streams.set_priority(key, &dependency);
            self.queue.update_weight(key, dependency.weight);
        }

        if stream_id > self.last_recv_stream_id {
            self.last_recv_stream_id = stream_id;
        }

        let (pseudo, fields) = partial.frame.into_parts();
        tracing::debug!(
            stream_id = u32::from(stream_id),
            method = pseudo.method.as_deref().unwrap_or("-"),
            path = pseudo.path.as_deref().unwrap_or("-"),
            end_stream,
            "request headers complete"
        );
        messages.push(PeerMessage::Request(RequestHead {
            stream_id,
            pseudo,
            fields,
            end_stream,
        }));
        Ok(())
    }

    fn recv_data(
        &mut self,
        head: Head,
        payload: &[u8],
        out: &mut IoBuffer,
        messages: &mut Vec<PeerMessage>,
    ) -> Result<(), Error> {
        let frame = Data::load(head, payload).map_err(Error::from)?;
        let stream_id = frame.stream_id();

        let Some(key) = self.streams.key_of(stream_id) else {
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        };
        if self.streams.get(key).state.is_closed() {
            return self.send_reset(out, stream_id, Reason::STREAM_CLOSED);
        }
        if !self.streams.get(key).state.is_recv_streaming() {
            return self.send_reset(out, stream_id, Reason::STREAM_CLOSED);
        }

        let end_stream = frame.is_end_stream();
        if end_stream {
            self.streams.get_mut(key).state.recv_close()?;
        }
        messages.push(PeerMessage::Body {
            stream_id,
            data: frame.into_payload(),
            end_stream,
        });
        Ok(())
    }

    fn recv_priority(&mut self, head: Head, payload: &[u8]) -> Result<(), Error> {
        let frame = Priority::load(head, payload).map_err(Error::from)?;
        // PRIORITY is valid in any stream state, including closed and
        // idle; first mention registers the stream.
        let key = self.streams.get_or_create(frame.stream_id);
        self.streams.set_priority(key, &frame.dependency);
        self.queue.update_weight(key, frame.dependency.weight);
        Ok(())
    }

    fn recv_reset(&mut self, head: Head, payload: &[u8]) -> Result<(), Error> {
        let frame = Reset::load(head, payload).map_err(Error::from)?;
        let Some(key) = self.streams.key_of(frame.stream_id()) else {
            return Ok(());
        };
        tracing::debug!(
            stream_id = u32::from(frame.stream_id()),
            reason = %frame.reason(),
            "stream reset by peer"
        );
        self.streams.get_mut(key).state.recv_reset(frame.reason());
        self.queue.remove(key);
        self.responses.remove(&key);
        self.streams.remove(key);
        Ok(())
    }

    fn recv_window_update(&mut self, head: Head, payload: &[u8]) -> Result<(), Error> {
        let frame = WindowUpdate::load(head, payload).map_err(Error::from)?;
        if frame.stream_id.is_zero() {
            // Connection-level flow control is not tracked; stream
            // windows alone gate DATA framing.
            return Ok(());
        }
        if let Some(stream) = self.streams.by_id_mut(frame.stream_id) {
            stream.window = frame.size_increment;
            tracing::trace!(
                stream_id = u32::from(frame.stream_id),
                window = stream.window,
                "window update"
            );
        }
        Ok(())
    }

    /// Emits RST_STREAM and forgets any response queued on the stream;
    /// the connection itself stays open.
    pub fn send_reset(
        &mut self,
        out: &mut IoBuffer,
        stream_id: StreamId,
        reason: Reason,
    ) -> Result<(), Error> {
        tracing::debug!(stream_id = u32::from(stream_id), %reason, "sending RST_STREAM");
        if let Some(key) = self.streams.key_of(stream_id) {
            self.streams.get_mut(key).state.set_reset(reason);
            self.queue.remove(key);
            self.responses.remove(&key);
        }
        write_frame(out, |dst| Reset::new(stream_id, reason).encode(dst))
    }

    /// Emits GOAWAY with the highest processed stream id and flags the
    /// connection for active close.
    pub fn go_away(&mut self, out: &mut IoBuffer, reason: Reason) -> Result<(), Error> {
        self.local_going_away = true;
        let frame = GoAway::new(self.last_recv_stream_id, reason);
        write_frame(out, |dst| frame.encode(dst))
    }

    /// Queues a response for `stream_id`; it is serialized by
    /// [`serialize_pass`](Self::serialize_pass) in weight order.
    pub fn queue_response(
        &mut self,
        stream_id: StreamId,
        head: ResponseHead,
        body: Box<dyn BodySource>,
    ) -> Result<(), Error> {
        let Some(key) = self.streams.key_of(stream_id) else {
            return Err(Error::stream_reset(stream_id, Reason::STREAM_CLOSED));
        };
        if self.streams.get(key).state.is_closed() {
            return Err(Error::stream_reset(stream_id, Reason::STREAM_CLOSED));
        }

        let weight = self.streams.get(key).weight;
        self.responses.insert(
            key,
            ResponseEntry {
                head,
                body,
                head_sent: false,
            },
        );
        self.queue.push(key, weight);
        Ok(())
    }

    /// One scheduler pass: pops the heaviest stream and serializes its
    /// HEADERS plus at most one DATA frame sized to
    /// `min(window, chunk)`. Returns true while queued work remains.
    pub fn serialize_pass(&mut self, out: &mut IoBuffer) -> Result<bool, Error> {
        let Some(key) = self.queue.pop() else {
            return Ok(false);
        };
        let Some(mut entry) = self.responses.remove(&key) else {
            return Ok(!self.queue.is_empty());
        };

        let stream_id = self.streams.get(key).id;
        tracing::trace!(
            stream_id = u32::from(stream_id),
            weight = self.streams.get(key).weight,
            "serializing stream"
        );

        if !entry.head_sent {
            let eos = entry.body.is_empty();
            self.streams.get_mut(key).state.send_open(eos)?;

            let mut headers = Headers::new(
                stream_id,
                Pseudo::response(entry.head.status),
                entry.head.fields.clone(),
            );
            if eos {
                headers.set_end_stream();
            }
            let mut dst = Vec::with_capacity(128);
            headers.encode(&mut self.encoder, &mut dst);
            out.append(&dst).map_err(Error::from)?;
            entry.head_sent = true;

            if eos {
                self.finish_stream(key);
                return Ok(!self.queue.is_empty());
            }
        }

        // One DATA frame, bounded by the stream window and buffer
        // width. The head is back-filled once the payload length is
        // known.
        let window = self.streams.get(key).window;
        let max = (window as usize).min(self.chunk_size).min(self.max_send_frame_size);
        let mark = out.reserve(HEADER_LEN).map_err(Error::from)?;
        let (written, eof) = entry.body.read_chunk(out, max).map_err(Error::from)?;

        let flags = if eof { DATA_END_STREAM } else { 0 };
        let head = Head::new(Kind::Data, flags, stream_id);
        out.patch(mark, &head.encode_array(written));

        let stream = self.streams.get_mut(key);
        debug_assert!(written as u32 <= stream.window);
        stream.window -= written as u32;
        tracing::trace!(
            stream_id = u32::from(stream_id),
            written,
            window = stream.window,
            eof,
            "DATA frame"
        );

        if eof {
            self.streams.get_mut(key).state.send_close();
            self.finish_stream(key);
        } else {
            if self.streams.get(key).window == 0 {
                // Self-refilling stream window: grant the peer a fresh
                // default-sized credit and keep going.
                let refill = self.initial_window.max(DEFAULT_INITIAL_WINDOW_SIZE);
                write_frame(out, |dst| {
                    WindowUpdate::new(stream_id, refill).encode(dst)
                })?;
                self.streams.get_mut(key).window = refill;
            }
            let weight = self.streams.get(key).weight;
            self.responses.insert(key, entry);
            self.queue.push(key, weight);
        }

        Ok(!self.queue.is_empty())
    }

    fn finish_stream(&mut self, key: usize) {
        if self.streams.get(key).state.is_closed() {
            self.streams.remove(key);
        }
    }

    /// Constructs a PUSH_PROMISE on `stream_id`, reserving the promised
    /// even stream locally. Wire construction only; the caller decides
    /// whether anything is ever sent on the promised stream.
    pub fn push_promise(
        &mut self,
        out: &mut IoBuffer,
        stream_id: StreamId,
        pseudo: Pseudo,
        fields: Vec<hpack::Header>,
    ) -> Result<StreamId, Error> {
        let promised = self
            .next_push_id
            .next_id()
            .map_err(|_| Error::library_go_away(Reason::INTERNAL_ERROR))?;
        self.next_push_id = promised;

        let key = self.streams.get_or_create(promised);
        self.streams.get_mut(key).state.reserve_local()?;

        let frame = PushPromise::new(stream_id, promised, pseudo, fields);
        let mut dst = Vec::with_capacity(64);
        frame.encode(&mut self.encoder, &mut dst);
        out.append(&dst).map_err(Error::from)?;
        Ok(promised)
    }
}

fn write_frame<F: FnOnce(&mut Vec<u8>)>(out: &mut IoBuffer, encode: F) -> Result<(), Error> {
    let mut scratch = Vec::with_capacity(64);
    encode(&mut scratch);
    out.append(&scratch).map_err(Error::from)
}

impl fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Connection")
            .field("read_state", &self.read_state)
            .field("streams", &self.streams.len())
            .field("queued", &self.queue.len())
            .field("going_away", &self.is_going_away())
            .finish()
    }
}
