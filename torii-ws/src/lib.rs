//! WebSocket support: the RFC 6455 handshake and the masked frame
//! codec, feeding a per-connection message assembler.

pub mod handshake;
pub mod protocol;

pub use self::handshake::{accept_key, handshake_headers, validate_upgrade};
pub use self::protocol::{Frame, FrameReader, Message, MessageAssembler, OpCode, WsError};
