use std::fmt;

use super::huffman::{self, HuffmanError};
use super::integer;
use super::table::{Entry, IndexTable};
use super::Header;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderError {
    /// The header block ended inside a representation.
    Truncated,

    /// A prefix integer kept its continuation bit set past any sane
    /// value.
    IntegerOverflow,

    /// An index outside the combined address space.
    InvalidIndex(usize),

    /// A dynamic-table-size update above the SETTINGS-negotiated cap.
    InvalidTableSizeUpdate { requested: usize, allowed: usize },

    /// A header name or value was not valid UTF-8.
    InvalidUtf8,

    /// The string codec failed.
    Huffman(HuffmanError),
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => f.write_str("header block truncated"),
            Self::IntegerOverflow => f.write_str("prefix integer overflow"),
            Self::InvalidIndex(index) => write!(f, "index {index} out of table range"),
            Self::InvalidTableSizeUpdate { requested, allowed } => write!(
                f,
                "table size update to {requested} above the allowed {allowed}"
            ),
            Self::InvalidUtf8 => f.write_str("header field is not valid utf-8"),
            Self::Huffman(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for DecoderError {}

impl From<HuffmanError> for DecoderError {
    fn from(src: HuffmanError) -> Self {
        Self::Huffman(src)
    }
}

/// Decodes header blocks, maintaining the peer-driven dynamic table.
#[derive(Debug)]
pub struct Decoder {
    table: IndexTable,
    /// Cap from SETTINGS_HEADER_TABLE_SIZE; size updates above it are a
    /// compression error.
    max_allowed: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_table_size(crate::h2::frame::DEFAULT_SETTINGS_HEADER_TABLE_SIZE)
    }

    #[must_use]
    pub fn with_max_table_size(max: usize) -> Self {
        Self {
            table: IndexTable::new(max),
            max_allowed: max,
        }
    }

    /// Applies SETTINGS_HEADER_TABLE_SIZE. May evict immediately.
    pub fn set_max_table_size(&mut self, max: usize) {
        self.max_allowed = max;
        self.table.set_max_size(max);
    }

    #[must_use]
    pub fn table(&self) -> &IndexTable {
        &self.table
    }

    /// Decodes one complete header block.
    pub fn decode(&mut self, src: &[u8]) -> Result<Vec<Header>, DecoderError> {
        let mut headers = Vec::new();
        let mut pos = 0;

        while pos < src.len() {
            let first = src[pos];

            if first & 0x80 == 0x80 {
                // Indexed Header Field.
                let index = integer::decode(src, &mut pos, 7)?;
                let entry = self.table.get(index)?;
                headers.push(Header::new(entry.name, entry.value));
            } else if first & 0xC0 == 0x40 {
                // Literal with Incremental Indexing.
                let index = integer::decode(src, &mut pos, 6)?;
                let (name, value) = self.read_literal(src, &mut pos, index)?;
                self.table.insert(Entry::new(name.clone(), value.clone()));
                headers.push(Header::new(name, value));
            } else if first & 0xE0 == 0x20 {
                // Dynamic Table Size Update.
                let size = integer::decode(src, &mut pos, 5)?;
                if size > self.max_allowed {
                    return Err(DecoderError::InvalidTableSizeUpdate {
                        requested: size,
                        allowed: self.max_allowed,
                    });
                }
                self.table.set_max_size(size);
            } else {
                // Without Indexing (0x00) and Never Indexed (0x10) share
                // the wire shape; neither touches the dynamic table.
                let index = integer::decode(src, &mut pos, 4)?;
                let (name, value) = self.read_literal(src, &mut pos, index)?;
                headers.push(Header::new(name, value));
            }
        }

        Ok(headers)
    }

    fn read_literal(
        &self,
        src: &[u8],
        pos: &mut usize,
        name_index: usize,
    ) -> Result<(String, String), DecoderError> {
        let name = if name_index > 0 {
            self.table.get(name_index)?.name
        } else {
            read_string(src, pos)?
        };
        let value = read_string(src, pos)?;
        Ok((name, value))
    }
}

fn read_string(src: &[u8], pos: &mut usize) -> Result<String, DecoderError> {
    let huffman_coded = *src.get(*pos).ok_or(DecoderError::Truncated)? & 0x80 == 0x80;
    let len = integer::decode(src, pos, 7)?;

    let end = pos.checked_add(len).ok_or(DecoderError::IntegerOverflow)?;
    let raw = src.get(*pos..end).ok_or(DecoderError::Truncated)?;
    *pos = end;

    let bytes = if huffman_coded {
        let mut out = Vec::with_capacity(len * 2);
        huffman::decode(raw, &mut out)?;
        out
    } else {
        raw.to_vec()
    };

    String::from_utf8(bytes).map_err(|_| DecoderError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_fields_resolve_in_the_static_table() {
        // Scenario from the h2 request line: `82 84` is
        // `{:method: GET, :path: /}`.
        let mut decoder = Decoder::new();
        let headers = decoder.decode(&[0x82, 0x84]).unwrap();
        assert_eq!(
            headers,
            vec![Header::new(":method", "GET"), Header::new(":path", "/")]
        );
    }

    #[test]
    fn rfc7541_c_4_first_request() {
        let block = [
            0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab,
            0x90, 0xf4, 0xff,
        ];
        let mut decoder = Decoder::new();
        let headers = decoder.decode(&block).unwrap();
        assert_eq!(
            headers,
            vec![
                Header::new(":method", "GET"),
                Header::new(":scheme", "http"),
                Header::new(":path", "/"),
                Header::new(":authority", "www.example.com"),
            ]
        );
        // `:authority: www.example.com` entered the dynamic table.
        assert_eq!(decoder.table().dynamic_len(), 1);
        assert_eq!(decoder.table().current_size(), 57);
        assert_eq!(
            decoder.table().get(62).unwrap(),
            Entry::new(":authority", "www.example.com")
        );
    }

    #[test]
    fn never_indexed_literals_skip_the_table() {
        // 0x10, new name, plain strings.
        let mut block = vec![0x10];
        block.push(0x08);
        block.extend_from_slice(b"password");
        block.push(0x06);
        block.extend_from_slice(b"secret");

        let mut decoder = Decoder::new();
        let headers = decoder.decode(&block).unwrap();
        assert_eq!(headers, vec![Header::new("password", "secret")]);
        assert_eq!(decoder.table().dynamic_len(), 0);
    }

    #[test]
    fn table_size_update_above_the_cap_is_rejected() {
        let mut decoder = Decoder::with_max_table_size(128);
        // 0x20 | 5-bit prefix integer 256: 0x3F then 256-31=225.
        let err = decoder.decode(&[0x3F, 0xE1, 0x01]).unwrap_err();
        assert!(matches!(err, DecoderError::InvalidTableSizeUpdate { .. }));
    }

    #[test]
    fn table_size_update_evicts() {
        let mut decoder = Decoder::new();
        let block = [
            0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab,
            0x90, 0xf4, 0xff,
        ];
        decoder.decode(&block).unwrap();
        assert_eq!(decoder.table().dynamic_len(), 1);

        // Shrink to zero: 0x20 | 0.
        decoder.decode(&[0x20]).unwrap();
        assert_eq!(decoder.table().dynamic_len(), 0);
    }

    #[test]
    fn truncated_blocks_error_out() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.decode(&[0x40, 0x05, b'a']), Err(DecoderError::Truncated));
    }
}
