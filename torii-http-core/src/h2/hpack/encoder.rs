use super::huffman;
use super::integer;
use super::table::{Entry, IndexTable, Lookup};
use super::Header;

/// Names that change on nearly every message; indexing them would churn
/// the dynamic table for no hit-rate gain.
const WITHOUT_INDEXING: [&str; 6] = [
    ":path",
    "content-length",
    "if-modified-since",
    "if-none-match",
    "location",
    "set-cookie",
];

fn is_without_indexing(name: &str) -> bool {
    WITHOUT_INDEXING.contains(&name)
}

/// Credentials and short cookies must never enter any table, ours or an
/// intermediary's.
fn is_never_indexed(name: &str, value: &str) -> bool {
    name == "authorization" || (name == "cookie" && value.len() < 20)
}

/// Encodes header blocks, mirroring the insertions the peer's decoder
/// will perform so dynamic indices stay in sync.
#[derive(Debug)]
pub struct Encoder {
    table: IndexTable,
    pending_size_update: Option<usize>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: IndexTable::new(crate::h2::frame::DEFAULT_SETTINGS_HEADER_TABLE_SIZE),
            pending_size_update: None,
        }
    }

    /// Applies the peer's SETTINGS_HEADER_TABLE_SIZE. The matching
    /// dynamic-table-size update is emitted at the start of the next
    /// header block.
    pub fn set_max_table_size(&mut self, max: usize) {
        self.table.set_max_size(max);
        self.pending_size_update = Some(max);
    }

    #[must_use]
    pub fn table(&self) -> &IndexTable {
        &self.table
    }

    /// Encodes one complete header block.
    pub fn encode(&mut self, headers: &[Header], dst: &mut Vec<u8>) {
        if let Some(size) = self.pending_size_update.take() {
            integer::encode(dst, 0x20, 5, size);
        }
        for header in headers {
            self.encode_field(&header.name, &header.value, dst);
        }
    }

    pub fn encode_field(&mut self, name: &str, value: &str, dst: &mut Vec<u8>) {
        // A full (name, value) hit always wins; the indexing-policy sets
        // only demote the literal forms below.
        let name_index = match self.table.lookup(name, value) {
            Lookup::Field(index) => {
                tracing::trace!(name, index, "hpack: indexed field");
                integer::encode(dst, 0x80, 7, index);
                return;
            }
            Lookup::Name(index) => index,
            Lookup::Miss => 0,
        };

        let pattern = if is_never_indexed(name, value) {
            tracing::trace!(name, "hpack: never indexed");
            (0x10, 4)
        } else if is_without_indexing(name) {
            tracing::trace!(name, "hpack: without indexing");
            (0x00, 4)
        } else {
            tracing::trace!(name, name_index, "hpack: incremental indexing");
            (0x40, 6)
        };

        integer::encode(dst, pattern.0, pattern.1, name_index);
        if name_index == 0 {
            encode_string(dst, name);
        }
        encode_string(dst, value);

        if pattern.0 == 0x40 {
            self.table.insert(Entry::new(name, value));
        }
    }
}

/// Writes a string literal, Huffman-coded when that is shorter.
fn encode_string(dst: &mut Vec<u8>, s: &str) {
    let raw = s.as_bytes();
    let huffman_len = huffman::encoded_len(raw);
    if huffman_len < raw.len() {
        integer::encode(dst, 0x80, 7, huffman_len);
        huffman::encode(raw, dst);
    } else {
        integer::encode(dst, 0x00, 7, raw.len());
        dst.extend_from_slice(raw);
    }
}
