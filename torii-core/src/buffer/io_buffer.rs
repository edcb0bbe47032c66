use std::{fmt, io};

use crate::error::CoreError;

use super::{Block, BlockFactory, PAGE_SIZE};

/// The last asynchronous operation a buffer was posted for.
///
/// A connection keeps at most one operation of each kind outstanding;
/// the flag lets completion handling assert it is finishing the same
/// operation the buffer was armed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoOpKind {
    #[default]
    Idle,
    Accept,
    Receive,
    Send,
    Disconnect,
}

/// A contiguous byte region with four cursors.
///
/// ```not_rust
///   0          prependable       read            write          end
///   +---------------+--------------+---------------+-------------+
///   |   headroom    |  (consumed)  |   readable    |  writable   |
///   +---------------+--------------+---------------+-------------+
/// ```
///
/// Invariant: `0 <= prependable <= read <= write <= end`, with `end`
/// bounded by the backing block's reserved extent. `end` only ever grows
/// in page multiples; the backing region never relocates, so raw marks
/// taken with [`reserve`] stay valid across payload writes.
///
/// [`reserve`]: IoBuffer::reserve
pub struct IoBuffer {
    block: Block,
    headroom: usize,
    read: usize,
    write: usize,
    end: usize,
    last_op: IoOpKind,
    completed: bool,
}

impl IoBuffer {
    /// Takes a block from `factory` and commits the first page.
    pub fn new(factory: &BlockFactory, headroom: usize) -> Result<Self, CoreError> {
        let block = factory.get_block()?;
        Ok(Self::with_block(block, headroom))
    }

    pub fn with_block(block: Block, headroom: usize) -> Self {
        let headroom = headroom.min(block.len());
        let end = PAGE_SIZE.min(block.len()).max(headroom);
        Self {
            block,
            headroom,
            read: headroom,
            write: headroom,
            end,
            last_op: IoOpKind::Idle,
            completed: false,
        }
    }

    /// Bytes available to a reader: `write - read`.
    #[must_use]
    pub fn readable(&self) -> usize {
        self.write - self.read
    }

    /// Bytes available to a writer without making more space.
    #[must_use]
    pub fn writable(&self) -> usize {
        self.end - self.write
    }

    /// Slack in front of the read cursor, headroom included.
    #[must_use]
    pub fn prependable_bytes(&self) -> usize {
        self.read
    }

    /// Committed extent of the buffer.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.end
    }

    /// Reserved extent of the backing block.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.block.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readable() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.writable() == 0
    }

    /// The readable region.
    #[must_use]
    pub fn peek(&self) -> &[u8] {
        &self.block.as_slice()[self.read..self.write]
    }

    /// The writable region.
    pub fn write_slice(&mut self) -> &mut [u8] {
        let (write, end) = (self.write, self.end);
        &mut self.block.as_mut_slice()[write..end]
    }

    pub fn advance_write(&mut self, n: usize) {
        assert!(self.write + n <= self.end, "write cursor past committed extent");
        self.write += n;
    }

    pub fn advance_read(&mut self, n: usize) {
        assert!(self.read + n <= self.write, "read cursor past write cursor");
        self.read += n;
    }

    /// Consumes `n` readable bytes, rewinding to the headroom when the
    /// buffer drains completely.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable(), "retrieve past readable region");
        if n < self.readable() {
            self.advance_read(n);
        } else {
            self.reset();
        }
    }

    /// Rewinds both cursors to the headroom mark.
    pub fn reset(&mut self) {
        self.read = self.headroom;
        self.write = self.headroom;
    }

    /// Guarantees `writable() >= n`, compacting the readable region down
    /// to the headroom when the slack suffices, or committing more of the
    /// reserved extent otherwise. The backing region never moves.
    pub fn make_writeable_space(&mut self, n: usize) -> Result<(), CoreError> {
        if self.writable() >= n {
            return Ok(());
        }
        if self.writable() + self.prependable_bytes() < n + self.headroom {
            self.expand(n)?;
        } else {
            self.compact();
        }
        debug_assert!(self.writable() >= n);
        Ok(())
    }

    fn expand(&mut self, n: usize) -> Result<(), CoreError> {
        let needed = self.write + n;
        if needed > self.block.len() {
            return Err(CoreError::BufferExhausted {
                requested: needed,
                reserved: self.block.len(),
            });
        }
        self.end = needed.next_multiple_of(PAGE_SIZE).min(self.block.len());
        Ok(())
    }

    fn compact(&mut self) {
        let readable = self.readable();
        let (read, write, headroom) = (self.read, self.write, self.headroom);
        self.block.as_mut_slice().copy_within(read..write, headroom);
        self.read = headroom;
        self.write = headroom + readable;
    }

    /// Appends `data`, growing the writable region as needed.
    pub fn append(&mut self, data: &[u8]) -> Result<(), CoreError> {
        self.make_writeable_space(data.len())?;
        let write = self.write;
        self.block.as_mut_slice()[write..write + data.len()].copy_from_slice(data);
        self.write += data.len();
        Ok(())
    }

    pub fn append_byte(&mut self, byte: u8) -> Result<(), CoreError> {
        self.append(&[byte])
    }

    /// Reserves `n` writable bytes and returns a mark for [`patch`].
    ///
    /// The reserved span reads as whatever the block last held; callers
    /// overwrite it before the bytes become readable to a peer. The
    /// mark is an absolute index: patch before retrieving past the
    /// headroom, since a compaction would shift the region under it.
    ///
    /// [`patch`]: IoBuffer::patch
    pub fn reserve(&mut self, n: usize) -> Result<usize, CoreError> {
        self.make_writeable_space(n)?;
        let mark = self.write;
        self.write += n;
        Ok(mark)
    }

    /// Back-fills bytes at a mark previously returned by [`reserve`].
    ///
    /// [`reserve`]: IoBuffer::reserve
    pub fn patch(&mut self, mark: usize, data: &[u8]) {
        assert!(mark + data.len() <= self.write, "patch past write cursor");
        self.block.as_mut_slice()[mark..mark + data.len()].copy_from_slice(data);
    }

    /// Bytes written since `mark`.
    #[must_use]
    pub fn written_since(&self, mark: usize) -> usize {
        self.write - mark
    }

    /// Copies up to `dst.len()` readable bytes out, consuming them.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let n = self.readable().min(dst.len());
        dst[..n].copy_from_slice(&self.peek()[..n]);
        self.retrieve(n);
        n
    }

    /// Drains the whole readable region into an owned vector.
    pub fn read_all(&mut self) -> Vec<u8> {
        let out = self.peek().to_vec();
        self.reset();
        out
    }

    pub fn set_last_op(&mut self, op: IoOpKind) {
        self.last_op = op;
        self.completed = false;
    }

    #[must_use]
    pub fn last_op(&self) -> IoOpKind {
        self.last_op
    }

    /// Marks the posted operation finished; returns false if it already
    /// was, so completion handling runs exactly once.
    pub fn complete(&mut self) -> bool {
        !std::mem::replace(&mut self.completed, true)
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

impl io::Write for IoBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf).map_err(io::Error::from)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for IoBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_into(buf))
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("headroom", &self.headroom)
            .field("read", &self.read)
            .field("write", &self.write)
            .field("end", &self.end)
            .field("reserved", &self.block.len())
            .field("last_op", &self.last_op)
            .finish()
    }
}
