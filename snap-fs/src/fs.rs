//! The file system object: superblock, block allocator, transactions and
//! the inode cache bookkeeping.

use crate::{
    block_dev::BlockDevice,
    cache::{BlockCache, BlockCacheManager},
    inode::{Inode, InodeData, InodeGuard},
    layout::{
        DiskInode, SuperBlock, BPB, BSIZE, FS_MAGIC, IPB, LOGSIZE, ROOTINO, T_DIR, T_FILE, T_NONE,
    },
    log::{self, Journal},
    snapshot::SnapshotMeta,
};
use alloc::{string::String, sync::Arc, vec::Vec};
use spin::Mutex;

/// Inode cache slots
pub(crate) const NINODE: usize = 50;

#[derive(Clone, Copy)]
pub(crate) struct Slot {
    pub inum: u32,
    pub refs: u32,
}

const FREE_SLOT: Slot = Slot { inum: 0, refs: 0 };

/// A mounted file system
pub struct SnapFs {
    device: Arc<dyn BlockDevice>,
    sb: SuperBlock,
    cache: Mutex<BlockCacheManager>,
    journal: Mutex<Journal>,
    icache: Mutex<[Slot; NINODE]>,
    ilocks: Vec<Mutex<InodeData>>,
    pub(crate) smeta: Mutex<SnapshotMeta>,
}

/// Transaction handle from [`SnapFs::begin_op`]; the group commits when
/// the last one drops.
pub struct Tx {
    fs: Arc<SnapFs>,
}

impl Drop for Tx {
    fn drop(&mut self) {
        let commit = self.fs.journal.lock().end_op();
        if commit {
            self.fs.commit();
        }
    }
}

impl SnapFs {
    fn build(device: Arc<dyn BlockDevice>, sb: SuperBlock) -> Arc<Self> {
        let mut ilocks = Vec::with_capacity(NINODE);
        for _ in 0..NINODE {
            ilocks.push(Mutex::new(InodeData::INVALID));
        }
        Arc::new(Self {
            journal: Mutex::new(Journal::new(&sb)),
            smeta: Mutex::new(SnapshotMeta::new(sb.size)),
            device,
            sb,
            cache: Mutex::new(BlockCacheManager::new()),
            icache: Mutex::new([FREE_SLOT; NINODE]),
            ilocks,
        })
    }

    /// Create a fresh file system on the device: zero the image, lay out
    /// the metadata, allocate the root directory and the snapshot state.
    pub fn format(device: Arc<dyn BlockDevice>, size: u32, ninodes: u32) -> Arc<Self> {
        let nlog = LOGSIZE as u32;
        let ninodeblocks = ninodes / IPB as u32 + 1;
        let nbitmap = size / BPB as u32 + 1;
        let nmeta = 2 + nlog + ninodeblocks + nbitmap;
        assert!(nmeta < size, "format: image too small");
        let sb = SuperBlock {
            magic: FS_MAGIC,
            size,
            nblocks: size - nmeta,
            ninodes,
            nlog,
            logstart: 2,
            inodestart: 2 + nlog,
            bmapstart: 2 + nlog + ninodeblocks,
        };
        let zero = [0u8; BSIZE];
        for b in 0..size {
            device.write_block(b as usize, &zero);
        }
        let fs = Self::build(device, sb);
        {
            let cache = fs.block(1);
            cache.lock().modify::<SuperBlock, _>(0, |s| *s = sb);
            cache.lock().sync();
        }
        {
            let _tx = fs.begin_op();
            fs.bitmap_mark_used(nmeta);
            let root = fs.ialloc(T_DIR).unwrap();
            assert_eq!(root.inum(), ROOTINO, "format: root inum");
            let mut g = root.lock();
            g.data.nlink = 1;
            g.update();
            let inum = root.inum();
            if g.dirlink(".", inum).is_err() || g.dirlink("..", inum).is_err() {
                panic!("format: root dots");
            }
        }
        fs.setup_snapshot_state();
        fs
    }

    /// Mount an existing file system: read the superblock, replay the
    /// log, load the snapshot state.
    pub fn open(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        let mut raw = [0u8; BSIZE];
        device.read_block(1, &mut raw);
        let mut sb = SuperBlock::default();
        unsafe {
            core::ptr::copy_nonoverlapping(
                raw.as_ptr(),
                &mut sb as *mut SuperBlock as *mut u8,
                core::mem::size_of::<SuperBlock>(),
            );
        }
        assert_eq!(sb.magic, FS_MAGIC, "open: bad magic");
        log::recover(&device, &sb);
        let fs = Self::build(device, sb);
        ::log::info!(
            "sb: size {} nblocks {} ninodes {} nlog {} logstart {} inodestart {} bmapstart {}",
            sb.size,
            sb.nblocks,
            sb.ninodes,
            sb.nlog,
            sb.logstart,
            sb.inodestart,
            sb.bmapstart
        );
        fs.setup_snapshot_state();
        fs
    }

    /// The superblock.
    #[inline]
    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    /// Root directory handle.
    pub fn root_inode(self: &Arc<Self>) -> Inode {
        self.iget(ROOTINO).unwrap()
    }

    // Blocks

    pub(crate) fn block(&self, block_id: usize) -> Arc<Mutex<BlockCache>> {
        self.cache.lock().get_block(block_id, &self.device)
    }

    /// Enter a transaction.
    pub fn begin_op(self: &Arc<Self>) -> Tx {
        self.journal.lock().begin_op();
        Tx {
            fs: Arc::clone(self),
        }
    }

    pub(crate) fn log_write(&self, block_id: usize) {
        self.journal.lock().record(block_id);
    }

    fn commit(&self) {
        let (ids, data_start, header_start) = {
            let mut journal = self.journal.lock();
            (
                journal.take_ids(),
                journal.data_start(),
                journal.header_start(),
            )
        };
        if ids.is_empty() {
            return;
        }
        for (i, id) in ids.iter().enumerate() {
            let cache = self.block(*id);
            let guard = cache.lock();
            self.device.write_block(data_start + i, guard.bytes());
        }
        log::write_header(&self.device, header_start, &ids);
        for id in ids.iter() {
            self.block(*id).lock().sync();
        }
        log::write_header(&self.device, header_start, &[]);
    }

    fn bitmap_mark_used(&self, n: u32) {
        for b in 0..n {
            let block_id = self.sb.bmap_block(b);
            let cache = self.block(block_id);
            let bi = b as usize % BPB;
            cache.lock().bytes_mut()[bi / 8] |= 1 << (bi % 8);
            drop(cache);
            self.log_write(block_id);
        }
    }

    /// Allocate a zeroed data block. Caller must be in a transaction.
    ///
    /// # Panics
    ///
    /// Panics when the disk is full.
    pub(crate) fn balloc(&self) -> u32 {
        let mut b = 0u32;
        while b < self.sb.size {
            let block_id = self.sb.bmap_block(b);
            let cache = self.block(block_id);
            let mut guard = cache.lock();
            let limit = BPB.min((self.sb.size - b) as usize);
            let found = (0..limit).find(|bi| guard.bytes()[bi / 8] & (1 << (bi % 8)) == 0);
            if let Some(bi) = found {
                guard.bytes_mut()[bi / 8] |= 1 << (bi % 8);
                drop(guard);
                drop(cache);
                self.log_write(block_id);
                let bno = b + bi as u32;
                let cache = self.block(bno as usize);
                cache.lock().bytes_mut().fill(0);
                drop(cache);
                self.log_write(bno as usize);
                return bno;
            }
            drop(guard);
            b += BPB as u32;
        }
        panic!("balloc: out of blocks");
    }

    /// Free a data block, unless a snapshot still references it.
    /// Caller must be in a transaction.
    pub(crate) fn bfree(&self, b: u32) {
        if self.smeta.lock().is_shared(b) {
            return;
        }
        let block_id = self.sb.bmap_block(b);
        let cache = self.block(block_id);
        let mut guard = cache.lock();
        let bi = b as usize % BPB;
        let m = 1u8 << (bi % 8);
        assert!(guard.bytes()[bi / 8] & m != 0, "freeing free block");
        guard.bytes_mut()[bi / 8] &= !m;
        drop(guard);
        self.log_write(block_id);
    }

    /// Flush every dirty cached block to the device.
    pub fn sync_all(&self) {
        self.cache.lock().sync_all();
    }

    /// Is the block marked used in the on-disk bitmap?
    pub fn block_in_use(&self, b: u32) -> bool {
        let cache = self.block(self.sb.bmap_block(b));
        let bi = b as usize % BPB;
        let used = cache.lock().bytes()[bi / 8] & (1 << (bi % 8)) != 0;
        used
    }

    // Inodes

    /// Find or create the cache slot of `inum` and take a reference.
    /// Returns `None` when every slot is taken.
    pub fn iget(self: &Arc<Self>, inum: u32) -> Option<Inode> {
        let mut icache = self.icache.lock();
        let mut empty = None;
        for (i, slot) in icache.iter_mut().enumerate() {
            if slot.refs > 0 && slot.inum == inum {
                slot.refs += 1;
                return Some(Inode {
                    fs: Arc::clone(self),
                    idx: i,
                    inum,
                });
            }
            if empty.is_none() && slot.refs == 0 {
                empty = Some(i);
            }
        }
        let idx = empty?;
        icache[idx] = Slot { inum, refs: 1 };
        drop(icache);
        *self.ilocks[idx].lock() = InodeData::INVALID;
        Some(Inode {
            fs: Arc::clone(self),
            idx,
            inum,
        })
    }

    pub(crate) fn idup(&self, idx: usize) {
        self.icache.lock()[idx].refs += 1;
    }

    /// Drop one reference; the last reference of an unlinked inode
    /// truncates and frees it on disk.
    pub(crate) fn iput(fs: &Arc<Self>, idx: usize, inum: u32) {
        let must_free = {
            let data = fs.ilocks[idx].lock();
            let refs = fs.icache.lock()[idx].refs;
            data.valid && data.nlink == 0 && refs == 1
        };
        if must_free {
            let _tx = fs.begin_op();
            let mut guard = fs.guard_of(idx, inum);
            guard.truncate();
            guard.data.ty = T_NONE;
            guard.update();
            guard.data.valid = false;
        }
        fs.icache.lock()[idx].refs -= 1;
    }

    pub(crate) fn guard_of(self: &Arc<Self>, idx: usize, inum: u32) -> InodeGuard<'_> {
        let mut data = self.ilocks[idx].lock();
        if !data.valid {
            let cache = self.block(self.sb.inode_block(inum));
            cache
                .lock()
                .read::<DiskInode, _>(self.sb.inode_offset(inum), |d| data.load(d));
            data.valid = true;
            assert!(data.ty != T_NONE, "ilock: no type");
        }
        InodeGuard {
            fs: self,
            inum,
            data,
        }
    }

    /// Allocate an on-disk inode of the given type. Caller must be in a
    /// transaction. Returns `None` when the inode table is full.
    pub(crate) fn ialloc(self: &Arc<Self>, ty: u16) -> Option<Inode> {
        for inum in 1..self.sb.ninodes {
            let block_id = self.sb.inode_block(inum);
            let cache = self.block(block_id);
            let mut guard = cache.lock();
            let offset = self.sb.inode_offset(inum);
            if guard.read::<DiskInode, _>(offset, |d| d.ty == T_NONE) {
                guard.modify::<DiskInode, _>(offset, |d| {
                    *d = DiskInode::FREE;
                    d.ty = ty;
                });
                drop(guard);
                drop(cache);
                self.log_write(block_id);
                return self.iget(inum);
            }
        }
        None
    }

    /// Count of allocated inodes in the on-disk table.
    pub fn allocated_inodes(&self) -> u32 {
        let mut count = 0;
        for inum in 1..self.sb.ninodes {
            let cache = self.block(self.sb.inode_block(inum));
            let used = cache
                .lock()
                .read::<DiskInode, _>(self.sb.inode_offset(inum), |d| d.ty != T_NONE);
            if used {
                count += 1;
            }
        }
        count
    }

    /// Count of inode cache slots referenced, loaded or linked.
    pub fn cached_inodes(&self) -> u32 {
        let icache = self.icache.lock();
        let mut count = 0;
        for (i, slot) in icache.iter().enumerate() {
            let data = self.ilocks[i].lock();
            if slot.refs > 0 || data.valid || data.nlink > 0 {
                count += 1;
            }
        }
        count
    }

    // Paths

    fn namex(self: &Arc<Self>, path: &str, stop_at_parent: bool) -> Option<(Inode, String)> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut ip = self.iget(ROOTINO)?;
        for (i, name) in parts.iter().enumerate() {
            let is_last = i + 1 == parts.len();
            let guard = ip.lock();
            if guard.ty() != T_DIR {
                return None;
            }
            if stop_at_parent && is_last {
                drop(guard);
                return Some((ip, String::from(*name)));
            }
            let next = guard.dirlookup(name)?.0;
            drop(guard);
            ip = next;
        }
        if stop_at_parent {
            return None;
        }
        Some((ip, String::new()))
    }

    /// Resolve a path from the root.
    pub fn namei(self: &Arc<Self>, path: &str) -> Option<Inode> {
        self.namex(path, false).map(|(ip, _)| ip)
    }

    /// Resolve the parent directory of a path; also yields the final
    /// component.
    pub fn nameiparent(self: &Arc<Self>, path: &str) -> Option<(Inode, String)> {
        self.namex(path, true)
    }

    /// Create an entry under `dp`. An existing regular file is returned
    /// as-is when a regular file was asked for. The returned inode is
    /// unlocked; callers lock it explicitly.
    pub fn create(
        self: &Arc<Self>,
        dp: &Inode,
        name: &str,
        ty: u16,
        major: i16,
        minor: i16,
    ) -> Option<Inode> {
        let mut dg = dp.lock();
        if let Some((ip, _)) = dg.dirlookup(name) {
            drop(dg);
            let matches = {
                let g = ip.lock();
                ty == T_FILE && g.ty() == T_FILE
            };
            return if matches { Some(ip) } else { None };
        }
        let ip = self.ialloc(ty)?;
        {
            let mut g = ip.lock();
            g.data.major = major;
            g.data.minor = minor;
            g.data.nlink = 1;
            g.update();
            if ty == T_DIR {
                // parent gains a link through ".."; none for "." to avoid
                // a cyclic count
                dg.data.nlink += 1;
                dg.update();
                if g.dirlink(".", ip.inum()).is_err() || g.dirlink("..", dp.inum()).is_err() {
                    panic!("create dots");
                }
            }
        }
        if dg.dirlink(name, ip.inum()).is_err() {
            panic!("create: dirlink");
        }
        Some(ip)
    }
}
