//! HPACK header compression (RFC 7541).
//!
//! The decoder and encoder each own an [`IndexTable`]: the fixed static
//! table plus a newest-first dynamic table under a byte budget. The
//! encoding policy favors fully indexed fields, demotes a configured set
//! of volatile names to non-indexed literals, and marks credentials as
//! never-indexed.

mod decoder;
mod encoder;
pub mod huffman;
mod integer;
mod table;

pub use self::decoder::{Decoder, DecoderError};
pub use self::encoder::Encoder;
pub use self::huffman::HuffmanError;
pub use self::table::{Entry, IndexTable};

/// One decoded header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}
