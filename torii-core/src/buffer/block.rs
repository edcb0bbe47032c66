use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::error::CoreError;

use super::PAGE_SIZE;

/// Shared state behind a [`BlockFactory`] and every [`Block`] it hands
/// out.
///
/// The region is mapped once and never unmapped before process exit;
/// `base` stays valid for as long as any `Arc<Shared>` is alive.
struct Shared {
    region: MmapMut,
    base: NonNull<u8>,
    block_size: usize,
    capacity: u32,
    next: AtomicU32,
    free: Mutex<Vec<u32>>,
}

// The raw base pointer is only ever dereferenced through disjoint
// per-block windows, handed out under the free-list discipline below.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn block_offset(&self, index: u32) -> usize {
        index as usize * self.block_size
    }

    /// Hint the kernel that a recycled block's pages can be reclaimed.
    ///
    /// The slice stays reserved; its next owner starts from zeroed pages
    /// the same way a freshly committed block would.
    fn decommit(&self, index: u32) {
        #[cfg(unix)]
        {
            let offset = self.block_offset(index);
            // SAFETY: no `Block` refers to this window anymore; dropping
            // the page contents cannot invalidate live reads or writes.
            let _ = unsafe {
                self.region.unchecked_advise_range(
                    memmap2::UncheckedAdvice::DontNeed,
                    offset,
                    self.block_size,
                )
            };
        }
        #[cfg(not(unix))]
        {
            let _ = index;
        }
    }
}

/// Hands out fixed-extent slices of one lazily committed reservation.
///
/// On NUMA hosts the configured node is recorded for diagnostics; pages
/// are first-touch committed, which places them on the node of the
/// worker that fills them.
pub struct BlockFactory {
    shared: Arc<Shared>,
    numa_node: Option<u16>,
}

impl BlockFactory {
    /// Reserves `capacity` blocks of `block_size` bytes each.
    ///
    /// `block_size` is rounded up to page granularity.
    pub fn new(block_size: usize, capacity: u32) -> std::io::Result<Self> {
        Self::with_numa_node(block_size, capacity, None)
    }

    pub fn with_numa_node(
        block_size: usize,
        capacity: u32,
        numa_node: Option<u16>,
    ) -> std::io::Result<Self> {
        let block_size = block_size.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let mut region = MmapMut::map_anon(block_size * capacity as usize)?;
        let base = NonNull::new(region.as_mut_ptr()).unwrap_or(NonNull::dangling());

        if let Some(node) = numa_node {
            tracing::debug!(
                numa_node = node,
                blocks = capacity,
                block_size,
                "buffer pool reservation bound by first touch"
            );
        }

        Ok(Self {
            shared: Arc::new(Shared {
                region,
                base,
                block_size,
                capacity,
                next: AtomicU32::new(0),
                free: Mutex::new(Vec::new()),
            }),
            numa_node,
        })
    }

    /// Fixed extent of every block this factory hands out.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    #[must_use]
    pub fn numa_node(&self) -> Option<u16> {
        self.numa_node
    }

    /// Number of blocks currently available without growing the high
    /// water mark.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        let handed_out = self.shared.next.load(Ordering::Relaxed).min(self.shared.capacity);
        self.shared.free.lock().len() + (self.shared.capacity - handed_out) as usize
    }

    /// Takes one block out of the reservation.
    ///
    /// Recycled blocks are preferred over extending the high water mark.
    pub fn get_block(&self) -> Result<Block, CoreError> {
        let index = match self.shared.free.lock().pop() {
            Some(index) => index,
            None => {
                let index = self.shared.next.fetch_add(1, Ordering::Relaxed);
                if index >= self.shared.capacity {
                    // Roll the counter back so capacity checks stay sane.
                    self.shared.next.fetch_sub(1, Ordering::Relaxed);
                    return Err(CoreError::PoolExhausted);
                }
                index
            }
        };

        let offset = self.shared.block_offset(index);
        // SAFETY: `index` was removed from circulation above, so no other
        // live `Block` maps this window; the region outlives the Arc.
        let ptr = unsafe { NonNull::new_unchecked(self.shared.base.as_ptr().add(offset)) };

        Ok(Block {
            ptr,
            len: self.shared.block_size,
            index,
            shared: self.shared.clone(),
        })
    }
}

impl fmt::Debug for BlockFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockFactory")
            .field("block_size", &self.shared.block_size)
            .field("capacity", &self.shared.capacity)
            .field("numa_node", &self.numa_node)
            .finish()
    }
}

/// One reserved slice of the factory's region.
///
/// Dropping a block returns it to the factory's free list after advising
/// the kernel its committed pages may be reclaimed.
pub struct Block {
    ptr: NonNull<u8>,
    len: usize,
    index: u32,
    shared: Arc<Shared>,
}

// A block is an exclusively owned window; moving it across workers is
// fine, sharing references to it is governed by the owner.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    /// Reserved extent in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: the window is exclusively owned and mapped for the
        // lifetime of `shared`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, plus `&mut self` guarantees uniqueness.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.shared.decommit(self.index);
        self.shared.free.lock().push(self.index);
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_recycle_through_the_free_list() {
        let factory = BlockFactory::new(PAGE_SIZE, 2).unwrap();
        assert_eq!(factory.free_blocks(), 2);

        let a = factory.get_block().unwrap();
        let b = factory.get_block().unwrap();
        assert_eq!(factory.free_blocks(), 0);
        assert!(matches!(
            factory.get_block(),
            Err(CoreError::PoolExhausted)
        ));

        let a_index = a.index;
        drop(a);
        assert_eq!(factory.free_blocks(), 1);
        let c = factory.get_block().unwrap();
        assert_eq!(c.index, a_index);
        drop((b, c));
        assert_eq!(factory.free_blocks(), 2);
    }

    #[test]
    fn block_size_rounds_up_to_page_granularity() {
        let factory = BlockFactory::new(100, 1).unwrap();
        assert_eq!(factory.block_size(), PAGE_SIZE);

        let factory = BlockFactory::new(PAGE_SIZE + 1, 1).unwrap();
        assert_eq!(factory.block_size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn block_windows_are_disjoint() {
        let factory = BlockFactory::new(PAGE_SIZE, 2).unwrap();
        let mut a = factory.get_block().unwrap();
        let mut b = factory.get_block().unwrap();

        a.as_mut_slice()[0] = 0xAA;
        b.as_mut_slice()[0] = 0xBB;
        assert_eq!(a.as_slice()[0], 0xAA);
        assert_eq!(b.as_slice()[0], 0xBB);
    }
}
