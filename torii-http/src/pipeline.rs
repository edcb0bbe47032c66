//! Response serialization.
//!
//! HTTP/1 responses run a two-state machine: the head goes down first,
//! then the body drains chunk by chunk sized to the send-buffer width.
//! The HTTP/2 path hands the same head and body source to the h2
//! engine's weighted scheduler instead.

use std::io;

use http::header;

use torii_core::IoBuffer;
use torii_http_core::BodySource;
use torii_http_core::h2::hpack;
use torii_http_core::h2::proto::ResponseHead;
use torii_http_core::proto::h1;

use crate::message::{Response, SendState};

/// Serializes one HTTP/1 response into a send buffer.
pub struct H1Serializer {
    status: http::StatusCode,
    headers: http::HeaderMap,
    body: Option<Box<dyn BodySource>>,
    state: SendState,
    remaining: u64,
    chunk_size: usize,
}

impl H1Serializer {
    #[must_use]
    pub fn new(mut response: Response, chunk_size: usize) -> Self {
        let connection = if response.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        response.headers.insert(
            header::CONNECTION,
            http::HeaderValue::from_static(connection),
        );
        let remaining = response.content_length();

        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            state: SendState::SendHeader,
            remaining,
            chunk_size: chunk_size.max(1),
        }
    }

    #[must_use]
    pub fn bytes_remaining(&self) -> u64 {
        self.remaining
    }

    /// Lays the next piece of the response into `dst`.
    ///
    /// Returns true once the response is fully serialized. Callers loop
    /// `write_content` + send until done.
    pub fn write_content(&mut self, dst: &mut IoBuffer) -> io::Result<bool> {
        if self.state == SendState::SendHeader {
            h1::encode_response_head(self.status, &self.headers, dst)?;
            self.state = SendState::SendBody;
            tracing::trace!(status = %self.status, remaining = self.remaining, "head serialized");
        }

        let Some(body) = self.body.as_mut() else {
            return Ok(true);
        };

        let max = self.chunk_size.min(self.remaining.max(1) as usize);
        let (written, eof) = body.read_chunk(dst, max)?;
        self.remaining = self.remaining.saturating_sub(written as u64);

        if eof || self.remaining == 0 {
            self.body = None;
            return Ok(true);
        }
        Ok(false)
    }
}

impl std::fmt::Debug for H1Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1Serializer")
            .field("status", &self.status)
            .field("state", &self.state)
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// Converts a response head into the h2 engine's shape: lowercase
/// names, pseudo status carried separately.
#[must_use]
pub fn to_h2_response(response: &Response) -> ResponseHead {
    let fields = response
        .headers
        .iter()
        .filter(|(name, _)| *name != header::CONNECTION && *name != header::TRANSFER_ENCODING)
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| hpack::Header::new(name.as_str(), v))
        })
        .collect();

    ResponseHead {
        status: response.status.as_u16(),
        fields,
    }
}
