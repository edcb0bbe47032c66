use std::io;

use torii_core::IoBuffer;

/// A pull source for response body bytes.
///
/// Implemented by the file-reader tiers; the serializers ask for at most
/// `max` bytes per pass so HTTP/2 DATA frames can be sized to the stream
/// window.
pub trait BodySource: Send {
    /// Total body size in bytes, after range/compression negotiation.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends up to `max` bytes into `buf`.
    ///
    /// Returns the byte count actually written and whether the source
    /// reached its end.
    fn read_chunk(&mut self, buf: &mut IoBuffer, max: usize) -> io::Result<(usize, bool)>;
}

/// A body held fully in memory (status pages, tests).
#[derive(Debug, Clone)]
pub struct InMemoryBody {
    bytes: Vec<u8>,
    position: usize,
}

impl InMemoryBody {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, position: 0 }
    }
}

impl BodySource for InMemoryBody {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_chunk(&mut self, buf: &mut IoBuffer, max: usize) -> io::Result<(usize, bool)> {
        let remaining = self.bytes.len() - self.position;
        let n = remaining.min(max);
        buf.append(&self.bytes[self.position..self.position + n])
            .map_err(io::Error::from)?;
        self.position += n;
        Ok((n, self.position == self.bytes.len()))
    }
}
