//! The WebSocket frame codec (RFC 6455 §5).
//!
//! The reader walks `ParseFin -> ParseExpectedSize -> ReadData -> Done`
//! against the connection's receive buffer, insisting on client
//! masking and unmasking payloads in place. The writer emits unmasked
//! server frames. A [`MessageAssembler`] stitches fragments back into
//! messages while letting control frames through immediately.

use std::fmt;

use torii_core::{CoreError, IoBuffer};

/// Control frames may not carry more than this many payload bytes.
const MAX_CONTROL_PAYLOAD: u64 = 125;

const FIN: u8 = 0x80;
const RSV_MASK: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0F;
const MASKED: u8 = 0x80;
const LEN7_MASK: u8 = 0x7F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    fn from_bits(bits: u8) -> Result<Self, WsError> {
        match bits {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => {
                tracing::debug!(opcode = other, "unknown websocket opcode");
                Err(WsError::MalformedFrame("unknown opcode"))
            }
        }
    }

    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// A malformed frame from the peer; the connection closes on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsError {
    MalformedFrame(&'static str),
    /// Fragment sequencing violated (stray CONT, interleaved data).
    FragmentProtocol(&'static str),
    /// A completed text message was not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedFrame(what) => write!(f, "malformed websocket frame: {what}"),
            Self::FragmentProtocol(what) => write!(f, "websocket fragment error: {what}"),
            Self::InvalidUtf8 => f.write_str("websocket text message is not valid utf-8"),
        }
    }
}

impl std::error::Error for WsError {}

/// One parsed frame, payload unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

/// A complete message after fragment reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<(u16, String)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    ParseFin,
    ParseExpectedSize,
    ReadData,
}

/// Incremental frame reader over the receive buffer.
#[derive(Debug)]
pub struct FrameReader {
    state: ParseState,
    fin: bool,
    opcode: OpCode,
    /// Extended-length byte count still expected (0, 2 or 8).
    length_width: usize,
    expected_len: u64,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ParseState::ParseFin,
            fin: false,
            opcode: OpCode::Close,
            length_width: 0,
            expected_len: 0,
        }
    }

    /// Consumes one frame from `buf` if fully buffered.
    ///
    /// `Ok(None)` means more bytes are needed; the buffer is only
    /// consumed as states complete.
    pub fn read_frame(&mut self, buf: &mut IoBuffer) -> Result<Option<Frame>, WsError> {
        loop {
            match self.state {
                ParseState::ParseFin => {
                    if buf.readable() < 2 {
                        return Ok(None);
                    }
                    let bytes = buf.peek();
                    if bytes[0] & RSV_MASK != 0 {
                        return Err(WsError::MalformedFrame("reserved bits set"));
                    }
                    self.fin = bytes[0] & FIN == FIN;
                    self.opcode = OpCode::from_bits(bytes[0] & OPCODE_MASK)?;

                    // Clients MUST mask every frame.
                    if bytes[1] & MASKED != MASKED {
                        return Err(WsError::MalformedFrame("unmasked client frame"));
                    }

                    let len7 = bytes[1] & LEN7_MASK;
                    self.length_width = match len7 {
                        126 => 2,
                        127 => 8,
                        n => {
                            self.expected_len = n as u64;
                            0
                        }
                    };
                    buf.retrieve(2);
                    self.state = ParseState::ParseExpectedSize;
                }
                ParseState::ParseExpectedSize => {
                    // Extended length (if any) plus the 4-byte mask.
                    if buf.readable() < self.length_width + 4 {
                        return Ok(None);
                    }
                    let bytes = buf.peek();
                    match self.length_width {
                        2 => {
                            self.expected_len = u16::from_be_bytes([bytes[0], bytes[1]]) as u64;
                        }
                        8 => {
                            let mut raw = [0u8; 8];
                            raw.copy_from_slice(&bytes[..8]);
                            self.expected_len = u64::from_be_bytes(raw);
                        }
                        _ => {}
                    }

                    if self.opcode.is_control() {
                        if !self.fin {
                            return Err(WsError::MalformedFrame("fragmented control frame"));
                        }
                        if self.expected_len > MAX_CONTROL_PAYLOAD {
                            return Err(WsError::MalformedFrame("oversized control frame"));
                        }
                    }
                    self.state = ParseState::ReadData;
                }
                ParseState::ReadData => {
                    let header = self.length_width + 4;
                    let total = header + self.expected_len as usize;
                    if buf.readable() < total {
                        return Ok(None);
                    }

                    let bytes = buf.peek();
                    let mut mask = [0u8; 4];
                    mask.copy_from_slice(&bytes[self.length_width..self.length_width + 4]);

                    // Unmask in place while copying out.
                    let mut payload = bytes[header..total].to_vec();
                    for (i, byte) in payload.iter_mut().enumerate() {
                        *byte ^= mask[i % 4];
                    }
                    buf.retrieve(total);

                    let frame = Frame {
                        fin: self.fin,
                        opcode: self.opcode,
                        payload,
                    };
                    tracing::trace!(
                        opcode = ?frame.opcode,
                        fin = frame.fin,
                        len = frame.payload.len(),
                        "websocket frame"
                    );
                    self.state = ParseState::ParseFin;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

/// Writes one unmasked server frame.
pub fn write_frame(
    buf: &mut IoBuffer,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
) -> Result<(), CoreError> {
    let first = if fin { FIN } else { 0 } | opcode as u8;
    buf.append_byte(first)?;

    let len = payload.len() as u64;
    if len <= MAX_CONTROL_PAYLOAD {
        buf.append_byte(len as u8)?;
    } else if len <= u16::MAX as u64 {
        buf.append_byte(126)?;
        buf.append(&(len as u16).to_be_bytes())?;
    } else {
        buf.append_byte(127)?;
        buf.append(&len.to_be_bytes())?;
    }
    buf.append(payload)
}

/// Writes a complete message as a single frame.
pub fn write_message(buf: &mut IoBuffer, message: &Message) -> Result<(), CoreError> {
    match message {
        Message::Text(text) => write_frame(buf, OpCode::Text, text.as_bytes(), true),
        Message::Binary(bytes) => write_frame(buf, OpCode::Binary, bytes, true),
        Message::Ping(bytes) => write_frame(buf, OpCode::Ping, bytes, true),
        Message::Pong(bytes) => write_frame(buf, OpCode::Pong, bytes, true),
        Message::Close(reason) => {
            let mut payload = Vec::new();
            if let Some((code, text)) = reason {
                payload.extend_from_slice(&code.to_be_bytes());
                payload.extend_from_slice(text.as_bytes());
            }
            write_frame(buf, OpCode::Close, &payload, true)
        }
    }
}

/// Reassembles fragmented messages; control frames pass straight
/// through even when they interleave a fragment sequence.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    partial: Option<(OpCode, Vec<u8>)>,
}

impl MessageAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, WsError> {
        if frame.opcode.is_control() {
            return Ok(Some(match frame.opcode {
                OpCode::Ping => Message::Ping(frame.payload),
                OpCode::Pong => Message::Pong(frame.payload),
                _ => Message::Close(parse_close_payload(&frame.payload)?),
            }));
        }

        match (frame.opcode, self.partial.take()) {
            (OpCode::Continuation, Some((opcode, mut collected))) => {
                collected.extend_from_slice(&frame.payload);
                if frame.fin {
                    complete(opcode, collected).map(Some)
                } else {
                    self.partial = Some((opcode, collected));
                    Ok(None)
                }
            }
            (OpCode::Continuation, None) => {
                Err(WsError::FragmentProtocol("continuation without a start"))
            }
            (opcode, None) => {
                if frame.fin {
                    complete(opcode, frame.payload).map(Some)
                } else {
                    self.partial = Some((opcode, frame.payload));
                    Ok(None)
                }
            }
            (_, Some(_)) => Err(WsError::FragmentProtocol(
                "new data frame inside a fragment sequence",
            )),
        }
    }
}

fn complete(opcode: OpCode, payload: Vec<u8>) -> Result<Message, WsError> {
    match opcode {
        OpCode::Text => String::from_utf8(payload)
            .map(Message::Text)
            .map_err(|_| WsError::InvalidUtf8),
        _ => Ok(Message::Binary(payload)),
    }
}

fn parse_close_payload(payload: &[u8]) -> Result<Option<(u16, String)>, WsError> {
    match payload {
        [] => Ok(None),
        [_] => Err(WsError::MalformedFrame("one-byte close payload")),
        [hi, lo, rest @ ..] => {
            let code = u16::from_be_bytes([*hi, *lo]);
            let text = String::from_utf8(rest.to_vec()).map_err(|_| WsError::InvalidUtf8)?;
            Ok(Some((code, text)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use torii_core::BlockFactory;

    fn io_buffer() -> IoBuffer {
        let factory = BlockFactory::new(512 * 1024, 1).unwrap();
        IoBuffer::new(&factory, 16).unwrap()
    }

    /// Builds a masked client frame.
    fn client_frame(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
        const MASK: [u8; 4] = [0x37, 0xFA, 0x21, 0x3D];
        let mut out = vec![if fin { FIN } else { 0 } | opcode];
        let len = payload.len() as u64;
        if len <= 125 {
            out.push(MASKED | len as u8);
        } else if len <= u16::MAX as u64 {
            out.push(MASKED | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(MASKED | 127);
            out.extend_from_slice(&len.to_be_bytes());
        }
        out.extend_from_slice(&MASK);
        out.extend(
            payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ MASK[i % 4]),
        );
        out
    }

    #[test]
    fn rfc6455_masked_hello() {
        // The masked "Hello" example from RFC 6455 §5.7.
        let mut buf = io_buffer();
        buf.append(&[0x81, 0x85, 0x37, 0xFA, 0x21, 0x3D, 0x7F, 0x9F, 0x4D, 0x51, 0x58])
            .unwrap();

        let frame = FrameReader::new().read_frame(&mut buf).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn unmasked_client_frames_are_rejected() {
        let mut buf = io_buffer();
        buf.append(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']).unwrap();
        assert_eq!(
            FrameReader::new().read_frame(&mut buf),
            Err(WsError::MalformedFrame("unmasked client frame"))
        );
    }

    #[test]
    fn incremental_parse_across_partial_reads() {
        let wire = client_frame(0x2, true, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut buf = io_buffer();
        let mut reader = FrameReader::new();

        for chunk in wire.chunks(3) {
            buf.append(chunk).unwrap();
        }
        // Feed byte-by-byte through a fresh buffer to exercise
        // need-more at every state.
        let mut buf2 = io_buffer();
        let mut reader2 = FrameReader::new();
        let mut parsed = None;
        for &byte in &wire {
            buf2.append(&[byte]).unwrap();
            if let Some(frame) = reader2.read_frame(&mut buf2).unwrap() {
                parsed = Some(frame);
            }
        }
        assert_eq!(parsed.unwrap().payload, &[1, 2, 3, 4, 5, 6, 7, 8]);

        let frame = reader.read_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Binary);
    }

    #[test]
    fn extended_length_boundaries() {
        for len in [125usize, 126, 127, 65_535, 65_536] {
            let payload = vec![0xAB; len];
            let wire = client_frame(0x2, true, &payload);

            // Header width: 125 stays 7-bit, 126..=65535 uses u16,
            // beyond that u64.
            let expected_header = 2 + 4 + if len <= 125 {
                0
            } else if len <= 65_535 {
                2
            } else {
                8
            };
            assert_eq!(wire.len(), expected_header + len);

            let mut buf = io_buffer();
            buf.append(&wire).unwrap();
            let frame = FrameReader::new().read_frame(&mut buf).unwrap().unwrap();
            assert_eq!(frame.payload.len(), len);
        }
    }

    #[test]
    fn control_frames_must_be_small_and_final() {
        let oversized = client_frame(0x9, true, &vec![0; 126]);
        let mut buf = io_buffer();
        buf.append(&oversized).unwrap();
        assert_eq!(
            FrameReader::new().read_frame(&mut buf),
            Err(WsError::MalformedFrame("oversized control frame"))
        );

        let fragmented = client_frame(0x8, false, b"bye");
        let mut buf = io_buffer();
        buf.append(&fragmented).unwrap();
        assert_eq!(
            FrameReader::new().read_frame(&mut buf),
            Err(WsError::MalformedFrame("fragmented control frame"))
        );
    }

    #[test]
    fn fragmented_text_reassembles() {
        let mut assembler = MessageAssembler::new();
        let mut reader = FrameReader::new();
        let mut buf = io_buffer();

        buf.append(&client_frame(0x1, false, b"Hel")).unwrap();
        buf.append(&client_frame(0x9, true, b"hb")).unwrap();
        buf.append(&client_frame(0x0, true, b"lo!")).unwrap();

        let mut messages = Vec::new();
        while let Some(frame) = reader.read_frame(&mut buf).unwrap() {
            if let Some(message) = assembler.push(frame).unwrap() {
                messages.push(message);
            }
        }
        // The interleaved ping surfaces first, then the joined text.
        assert_eq!(
            messages,
            vec![
                Message::Ping(b"hb".to_vec()),
                Message::Text("Hello!".into())
            ]
        );
    }

    #[test]
    fn stray_continuation_is_a_protocol_error() {
        let mut assembler = MessageAssembler::new();
        let frame = Frame {
            fin: true,
            opcode: OpCode::Continuation,
            payload: vec![],
        };
        assert!(matches!(
            assembler.push(frame),
            Err(WsError::FragmentProtocol(_))
        ));
    }

    #[test]
    fn server_frames_are_unmasked_and_round_trip_lengths() {
        for len in [0usize, 125, 126, 65_536] {
            let mut buf = io_buffer();
            write_frame(&mut buf, OpCode::Binary, &vec![9; len], true).unwrap();
            let wire = buf.read_all();
            assert_eq!(wire[1] & MASKED, 0, "server frames carry no mask");
        }
    }

    #[test]
    fn close_round_trip() {
        let mut buf = io_buffer();
        write_message(&mut buf, &Message::Close(Some((1000, "bye".into())))).unwrap();
        let wire = buf.read_all();
        assert_eq!(wire[0], FIN | 0x8);
        assert_eq!(&wire[2..4], &1000u16.to_be_bytes());
        assert_eq!(&wire[4..], b"bye");
    }
}
