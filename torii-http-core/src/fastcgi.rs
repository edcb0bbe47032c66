//! FastCGI record framing (the gateway side of dynamic content).
//!
//! Only the record header and the begin-request body are modeled; the
//! server speaks the protocol as a client toward a responder
//! application.

use std::fmt;

pub const FCGI_VERSION_1: u8 = 1;

/// Fixed 8-byte record header.
pub const RECORD_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    Unknown = 11,
}

impl RecordKind {
    #[must_use]
    pub fn from_u8(byte: u8) -> Self {
        match byte {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            _ => Self::Unknown,
        }
    }
}

/// The application role requested by a begin-request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub kind: RecordKind,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    Truncated,
    BadVersion(u8),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => f.write_str("fastcgi record truncated"),
            Self::BadVersion(v) => write!(f, "unsupported fastcgi version {v}"),
        }
    }
}

impl std::error::Error for RecordError {}

impl RecordHeader {
    #[must_use]
    pub fn new(kind: RecordKind, request_id: u16, content_length: u16) -> Self {
        Self {
            version: FCGI_VERSION_1,
            kind,
            request_id,
            content_length,
            padding_length: pad_to_eight(content_length),
        }
    }

    pub fn parse(src: &[u8]) -> Result<Self, RecordError> {
        if src.len() < RECORD_HEADER_LEN {
            return Err(RecordError::Truncated);
        }
        if src[0] != FCGI_VERSION_1 {
            return Err(RecordError::BadVersion(src[0]));
        }
        Ok(Self {
            version: src[0],
            kind: RecordKind::from_u8(src[1]),
            request_id: u16::from_be_bytes([src[2], src[3]]),
            content_length: u16::from_be_bytes([src[4], src[5]]),
            padding_length: src[6],
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let request_id = self.request_id.to_be_bytes();
        let content_length = self.content_length.to_be_bytes();
        [
            self.version,
            self.kind as u8,
            request_id[0],
            request_id[1],
            content_length[0],
            content_length[1],
            self.padding_length,
            0, // reserved
        ]
    }
}

/// Body of a begin-request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: Role,
    pub keep_connection: bool,
}

impl BeginRequestBody {
    #[must_use]
    pub fn encode(&self) -> [u8; 8] {
        let role = (self.role as u16).to_be_bytes();
        [
            role[0],
            role[1],
            u8::from(self.keep_connection),
            0,
            0,
            0,
            0,
            0,
        ]
    }
}

fn pad_to_eight(content_length: u16) -> u8 {
    ((8 - (content_length % 8)) % 8) as u8
}
