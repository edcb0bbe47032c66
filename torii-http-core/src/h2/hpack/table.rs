use std::collections::VecDeque;

use super::DecoderError;

/// Per-entry bookkeeping overhead (RFC 7541 §4.1).
const ENTRY_OVERHEAD: usize = 32;

/// The static table from RFC 7541 Appendix A; index 1 is the first row.
pub(super) const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// One name/value pair held by the dynamic table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub value: String,
}

impl Entry {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Byte cost charged against the table budget.
    #[must_use]
    pub fn cost(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// The combined index address space: static entries 1..=61, then the
/// dynamic table newest-first.
#[derive(Debug)]
pub struct IndexTable {
    dynamic: VecDeque<Entry>,
    current_size: usize,
    max_size: usize,
}

/// Outcome of looking a field up for encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Lookup {
    /// Both name and value matched at this index.
    Field(usize),
    /// Only the name matched at this index.
    Name(usize),
    Miss,
}

impl IndexTable {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            dynamic: VecDeque::new(),
            current_size: 0,
            max_size,
        }
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Total byte cost of the dynamic entries; never exceeds
    /// [`max_size`](Self::max_size).
    #[must_use]
    pub fn current_size(&self) -> usize {
        self.current_size
    }

    #[must_use]
    pub fn dynamic_len(&self) -> usize {
        self.dynamic.len()
    }

    /// Resolves an index from the combined address space.
    pub fn get(&self, index: usize) -> Result<Entry, DecoderError> {
        if index == 0 {
            return Err(DecoderError::InvalidIndex(0));
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok(Entry::new(name, value));
        }
        // Dynamic index 1 is the most recently inserted entry.
        self.dynamic
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or(DecoderError::InvalidIndex(index))
    }

    /// Inserts at the head of the dynamic table, evicting from the tail
    /// until the byte budget holds.
    pub fn insert(&mut self, entry: Entry) {
        let cost = entry.cost();
        if cost > self.max_size {
            // An entry larger than the whole budget empties the table.
            self.dynamic.clear();
            self.current_size = 0;
            return;
        }
        self.dynamic.push_front(entry);
        self.current_size += cost;
        self.evict();
    }

    /// Applies a new byte budget, evicting immediately if needed.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict();
    }

    fn evict(&mut self) {
        while self.current_size > self.max_size {
            if let Some(oldest) = self.dynamic.pop_back() {
                self.current_size -= oldest.cost();
            } else {
                self.current_size = 0;
            }
        }
    }

    /// Encoder-side search across the full address space. Static
    /// entries win over dynamic ones; a full match wins over a
    /// name-only match.
    pub(super) fn lookup(&self, name: &str, value: &str) -> Lookup {
        let mut name_only = None;

        for (i, &(entry_name, entry_value)) in STATIC_TABLE.iter().enumerate() {
            if entry_name == name {
                if entry_value == value {
                    return Lookup::Field(i + 1);
                }
                name_only.get_or_insert(i + 1);
            }
        }

        for (i, entry) in self.dynamic.iter().enumerate() {
            if entry.name == name {
                let index = STATIC_TABLE.len() + i + 1;
                if entry.value == value {
                    return Lookup::Field(index);
                }
                name_only.get_or_insert(index);
            }
        }

        match name_only {
            Some(index) => Lookup::Name(index),
            None => Lookup::Miss,
        }
    }
}
