//! Block cache layer.
//!
//! Keeps a small pool of in-memory copies of disk blocks. A block stays
//! cached while anyone holds a reference to it; a dirty block is written
//! back when the cache entry is dropped.

use crate::{block_dev::BlockDevice, layout::BSIZE};
use alloc::{collections::VecDeque, sync::Arc};
use spin::Mutex;

/// Blocks held by the cache at once
const BLOCK_CACHE_SIZE: usize = 32;

/// Buffer with block alignment so typed views stay aligned
#[repr(C, align(8))]
struct CacheBuf([u8; BSIZE]);

/// Cached copy of one disk block
pub struct BlockCache {
    buf: CacheBuf,
    block_id: usize,
    device: Arc<dyn BlockDevice>,
    modified: bool,
}

impl BlockCache {
    /// Load a block from disk
    fn new(block_id: usize, device: Arc<dyn BlockDevice>) -> Self {
        let mut buf = CacheBuf([0; BSIZE]);
        device.read_block(block_id, &mut buf.0);
        Self {
            buf,
            block_id,
            device,
            modified: false,
        }
    }

    fn addr_of_offset(&self, offset: usize) -> usize {
        &self.buf.0[offset] as *const _ as usize
    }

    fn get_ref<T>(&self, offset: usize) -> &T
    where
        T: Sized,
    {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= BSIZE);
        let addr = self.addr_of_offset(offset);
        debug_assert_eq!(addr % core::mem::align_of::<T>(), 0);
        unsafe { &*(addr as *const T) }
    }

    fn get_mut<T>(&mut self, offset: usize) -> &mut T
    where
        T: Sized,
    {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= BSIZE);
        self.modified = true;
        let addr = self.addr_of_offset(offset);
        debug_assert_eq!(addr % core::mem::align_of::<T>(), 0);
        unsafe { &mut *(addr as *mut T) }
    }

    /// Read a typed view at `offset`
    pub fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    /// Modify a typed view at `offset`
    pub fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    /// The whole block
    pub fn bytes(&self) -> &[u8; BSIZE] {
        &self.buf.0
    }

    /// The whole block, marked dirty
    pub fn bytes_mut(&mut self) -> &mut [u8; BSIZE] {
        self.modified = true;
        &mut self.buf.0
    }

    /// Write a dirty block back to disk
    pub fn sync(&mut self) {
        if self.modified {
            self.modified = false;
            self.device.write_block(self.block_id, &self.buf.0);
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.sync()
    }
}

/// FIFO replacement over the cached blocks
pub struct BlockCacheManager {
    queue: VecDeque<(usize, Arc<Mutex<BlockCache>>)>,
}

impl BlockCacheManager {
    /// Empty cache
    pub const fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Get the cache entry of a block, loading it if absent.
    ///
    /// Panics when every slot is pinned by an outstanding reference.
    pub fn get_block(
        &mut self,
        block_id: usize,
        device: &Arc<dyn BlockDevice>,
    ) -> Arc<Mutex<BlockCache>> {
        if let Some(pair) = self.queue.iter().find(|pair| pair.0 == block_id) {
            return Arc::clone(&pair.1);
        }
        if self.queue.len() == BLOCK_CACHE_SIZE {
            if let Some(idx) = self
                .queue
                .iter()
                .position(|pair| Arc::strong_count(&pair.1) == 1)
            {
                self.queue.drain(idx..=idx);
            } else {
                panic!("block cache: run out of slots");
            }
        }
        let cache = Arc::new(Mutex::new(BlockCache::new(block_id, Arc::clone(device))));
        self.queue.push_back((block_id, Arc::clone(&cache)));
        cache
    }

    /// Write every dirty cached block back
    pub fn sync_all(&mut self) {
        for (_, cache) in self.queue.iter() {
            cache.lock().sync();
        }
    }
}
