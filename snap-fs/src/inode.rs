//! In-memory inodes.
//!
//! A fixed cache of inode slots backs every [`Inode`] handle. The slot
//! bookkeeping (which inode, how many handles) lives under the cache lock;
//! the inode content lives under a per-slot lock taken through
//! [`Inode::lock`]. Dropping the last handle of an unlinked inode frees it
//! on disk.
//!
//! Writes to regular files go through the snapshot check: a block whose
//! bit is set in the snapshot map is cloned before it is modified.

use crate::{
    fs::SnapFs,
    layout::{
        DirEntry, DiskInode, BSIZE, MAXFILE, NDIRECT, NINDIRECT, ROOTINO, T_DEV, T_DIR, T_NONE,
    },
};
use alloc::{string::String, sync::Arc, vec::Vec};
use spin::MutexGuard;

/// Inode content as cached in memory
pub(crate) struct InodeData {
    pub valid: bool,
    pub ty: u16,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 1],
}

impl InodeData {
    pub const INVALID: Self = Self {
        valid: false,
        ty: T_NONE,
        major: 0,
        minor: 0,
        nlink: 0,
        size: 0,
        addrs: [0; NDIRECT + 1],
    };

    pub(crate) fn load(&mut self, d: &DiskInode) {
        self.ty = d.ty;
        self.major = d.major;
        self.minor = d.minor;
        self.nlink = d.nlink;
        self.size = d.size;
        self.addrs = d.addrs;
    }

    fn store(&self) -> DiskInode {
        DiskInode {
            ty: self.ty,
            major: self.major,
            minor: self.minor,
            nlink: self.nlink,
            size: self.size,
            addrs: self.addrs,
        }
    }
}

/// Handle to a cached inode.
///
/// Cloning bumps the slot reference; dropping the last handle of an inode
/// without links frees it on disk.
pub struct Inode {
    pub(crate) fs: Arc<SnapFs>,
    pub(crate) idx: usize,
    pub(crate) inum: u32,
}

impl Inode {
    /// Inode number on disk
    #[inline]
    pub fn inum(&self) -> u32 {
        self.inum
    }

    /// Lock the inode content, reading it from disk on first touch.
    pub fn lock(&self) -> InodeGuard<'_> {
        self.fs.guard_of(self.idx, self.inum)
    }

    /// Read bytes at an offset (no lock held by the caller).
    pub fn read_at(&self, off: u32, dst: &mut [u8]) -> Option<usize> {
        self.lock().read_at(off, dst)
    }

    /// Write bytes at an offset inside its own transaction.
    pub fn write_at(&self, off: u32, src: &[u8]) -> Option<usize> {
        let _tx = self.fs.begin_op();
        self.lock().write_at(off, src)
    }

    /// The file system this inode belongs to.
    pub fn fs(&self) -> &Arc<SnapFs> {
        &self.fs
    }
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        self.fs.idup(self.idx);
        Self {
            fs: Arc::clone(&self.fs),
            idx: self.idx,
            inum: self.inum,
        }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        SnapFs::iput(&self.fs, self.idx, self.inum);
    }
}

/// Locked view of an inode's content.
pub struct InodeGuard<'a> {
    pub(crate) fs: &'a Arc<SnapFs>,
    pub(crate) inum: u32,
    pub(crate) data: MutexGuard<'a, InodeData>,
}

impl InodeGuard<'_> {
    /// File type
    #[inline]
    pub fn ty(&self) -> u16 {
        self.data.ty
    }

    /// File size in bytes
    #[inline]
    pub fn size(&self) -> u32 {
        self.data.size
    }

    /// Link count
    #[inline]
    pub fn nlink(&self) -> i16 {
        self.data.nlink
    }

    /// Data block addresses, the last one being the indirect pointer
    #[inline]
    pub fn addrs(&self) -> &[u32; NDIRECT + 1] {
        &self.data.addrs
    }

    /// Add one link. Caller records the new directory entry and must be
    /// in a transaction.
    pub fn inc_nlink(&mut self) {
        self.data.nlink += 1;
        self.update();
    }

    /// Drop one link without touching directory entries; undo path of a
    /// failed link. Caller must be in a transaction.
    pub fn dec_nlink(&mut self) {
        self.data.nlink -= 1;
        self.update();
    }

    /// Write the inode back to its disk slot. Caller must be in a
    /// transaction.
    pub fn update(&self) {
        let sb = self.fs.superblock();
        let block_id = sb.inode_block(self.inum);
        let cache = self.fs.block(block_id);
        cache
            .lock()
            .modify::<DiskInode, _>(sb.inode_offset(self.inum), |d| *d = self.data.store());
        drop(cache);
        self.fs.log_write(block_id);
    }

    /// Address of the `bn`-th data block, allocating it if absent.
    ///
    /// # Panics
    ///
    /// Panics past the largest supported file.
    pub fn bmap(&mut self, bn: usize) -> u32 {
        if bn < NDIRECT {
            if self.data.addrs[bn] == 0 {
                self.data.addrs[bn] = self.fs.balloc();
            }
            return self.data.addrs[bn];
        }
        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: out of range");
        if self.data.addrs[NDIRECT] == 0 {
            self.data.addrs[NDIRECT] = self.fs.balloc();
        }
        let ind = self.data.addrs[NDIRECT] as usize;
        let cache = self.fs.block(ind);
        let mut guard = cache.lock();
        let mut addr = guard.read::<[u32; NINDIRECT], _>(0, |a| a[bn]);
        if addr == 0 {
            drop(guard);
            addr = self.fs.balloc();
            guard = cache.lock();
            guard.modify::<[u32; NINDIRECT], _>(0, |a| a[bn] = addr);
            drop(guard);
            self.fs.log_write(ind);
        }
        addr
    }

    /// Address of the `bn`-th data block, 0 when absent. Never allocates.
    pub fn bmmap(&self, bn: usize) -> u32 {
        if bn < NDIRECT {
            return self.data.addrs[bn];
        }
        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: out of range");
        if self.data.addrs[NDIRECT] == 0 {
            return 0;
        }
        let cache = self.fs.block(self.data.addrs[NDIRECT] as usize);
        let addr = cache.lock().read::<[u32; NINDIRECT], _>(0, |a| a[bn]);
        addr
    }

    /// Read up to `dst.len()` bytes at `off`. Holes read as zero.
    pub fn read_at(&self, off: u32, dst: &mut [u8]) -> Option<usize> {
        if self.data.ty == T_DEV {
            return None;
        }
        if off > self.data.size {
            return None;
        }
        let n = (dst.len() as u32).min(self.data.size - off) as usize;
        let mut tot = 0;
        let mut off = off as usize;
        while tot < n {
            let m = (n - tot).min(BSIZE - off % BSIZE);
            let addr = self.bmmap(off / BSIZE);
            if addr == 0 {
                dst[tot..tot + m].fill(0);
            } else {
                let cache = self.fs.block(addr as usize);
                let guard = cache.lock();
                dst[tot..tot + m].copy_from_slice(&guard.bytes()[off % BSIZE..off % BSIZE + m]);
            }
            tot += m;
            off += m;
        }
        Some(n)
    }

    /// Write `src` at `off`. Caller must be in a transaction.
    ///
    /// For regular files every touched block is first checked against the
    /// snapshot map: a shared direct block is cloned in place, a shared
    /// indirect-referenced block forces the whole indirect subtree to be
    /// migrated to fresh blocks. The byte write then proceeds on private
    /// blocks, and the snapshot map is persisted if it changed.
    pub fn write_at(&mut self, off: u32, src: &[u8]) -> Option<usize> {
        if self.data.ty == T_DEV {
            return None;
        }
        let n = src.len() as u32;
        if off > self.data.size || off.checked_add(n).is_none() {
            return None;
        }
        if (off + n) as usize > MAXFILE * BSIZE {
            return None;
        }
        if n == 0 {
            return Some(0);
        }

        let mut cow_happened = false;
        if self.data.ty != T_DIR {
            cow_happened = self.clone_shared_blocks(off, n);
        }

        let mut tot = 0usize;
        let mut pos = off as usize;
        while tot < n as usize {
            let m = (n as usize - tot).min(BSIZE - pos % BSIZE);
            let addr = self.bmap(pos / BSIZE) as usize;
            let cache = self.fs.block(addr);
            cache.lock().bytes_mut()[pos % BSIZE..pos % BSIZE + m]
                .copy_from_slice(&src[tot..tot + m]);
            drop(cache);
            self.fs.log_write(addr);
            tot += m;
            pos += m;
        }

        if pos as u32 > self.data.size {
            self.data.size = pos as u32;
        }
        self.update();
        if cow_happened {
            self.fs.persist_smeta();
        }
        Some(n as usize)
    }

    /// Snapshot check for the blocks a write will touch. Returns whether
    /// any snapshot-map bit changed.
    fn clone_shared_blocks(&mut self, off: u32, n: u32) -> bool {
        let first = off as usize / BSIZE;
        let last = (off + n - 1) as usize / BSIZE;
        let mut changed = false;
        let mut migrate_indirect = false;
        for bn in first..=last {
            let addr = self.bmmap(bn);
            if addr == 0 {
                continue;
            }
            if !self.fs.smap_is_shared(addr) {
                continue;
            }
            self.fs.smap_clear(addr);
            changed = true;
            if bn >= NDIRECT {
                // settled below for the whole indirect subtree at once
                migrate_indirect = true;
                continue;
            }
            // clone the direct block before touching it
            let mut copy = [0u8; BSIZE];
            {
                let cache = self.fs.block(addr as usize);
                copy.copy_from_slice(cache.lock().bytes());
            }
            self.data.addrs[bn] = 0;
            let fresh = self.bmap(bn) as usize;
            let cache = self.fs.block(fresh);
            cache.lock().bytes_mut().copy_from_slice(&copy);
            drop(cache);
            self.fs.log_write(fresh);
        }
        if migrate_indirect {
            self.migrate_indirect();
        }
        changed
    }

    /// Move the indirect block and every block it references onto fresh
    /// blocks. Bounds the snapshot-map updates of indirect writes to one
    /// migration instead of one per write.
    fn migrate_indirect(&mut self) {
        let old_ind = self.data.addrs[NDIRECT] as usize;
        let table = {
            let cache = self.fs.block(old_ind);
            let guard = cache.lock();
            guard.read::<[u32; NINDIRECT], _>(0, |a| *a)
        };
        let mut fresh_table = table;
        let mut copy = [0u8; BSIZE];
        for (i, &addr) in table.iter().enumerate() {
            if addr == 0 {
                continue;
            }
            {
                let cache = self.fs.block(addr as usize);
                copy.copy_from_slice(cache.lock().bytes());
            }
            let fresh = self.fs.balloc();
            fresh_table[i] = fresh;
            let cache = self.fs.block(fresh as usize);
            cache.lock().bytes_mut().copy_from_slice(&copy);
            drop(cache);
            self.fs.log_write(fresh as usize);
        }
        let new_ind = self.fs.balloc();
        {
            let cache = self.fs.block(new_ind as usize);
            cache
                .lock()
                .modify::<[u32; NINDIRECT], _>(0, |a| *a = fresh_table);
        }
        self.fs.log_write(new_ind as usize);
        self.data.addrs[NDIRECT] = new_ind;
    }

    /// Discard the inode content. Caller must be in a transaction.
    ///
    /// Blocks still marked in the snapshot map survive; they belong to a
    /// snapshot now.
    pub fn truncate(&mut self) {
        for i in 0..NDIRECT {
            if self.data.addrs[i] != 0 {
                self.fs.bfree(self.data.addrs[i]);
                self.data.addrs[i] = 0;
            }
        }
        if self.data.addrs[NDIRECT] != 0 {
            let ind = self.data.addrs[NDIRECT] as usize;
            let table = {
                let cache = self.fs.block(ind);
                let guard = cache.lock();
                guard.read::<[u32; NINDIRECT], _>(0, |a| *a)
            };
            for addr in table {
                if addr != 0 {
                    self.fs.bfree(addr);
                }
            }
            self.fs.bfree(ind as u32);
            self.data.addrs[NDIRECT] = 0;
        }
        self.data.size = 0;
        self.update();
    }

    /// Every block address the inode references: direct blocks, the
    /// indirect pointer block and the blocks it lists.
    pub fn referenced_blocks(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for &addr in &self.data.addrs[..NDIRECT] {
            if addr != 0 {
                out.push(addr);
            }
        }
        let ind = self.data.addrs[NDIRECT];
        if ind != 0 {
            let cache = self.fs.block(ind as usize);
            let table = {
                let guard = cache.lock();
                guard.read::<[u32; NINDIRECT], _>(0, |a| *a)
            };
            for addr in table {
                if addr != 0 {
                    out.push(addr);
                }
            }
            out.push(ind);
        }
        out
    }

    // Directories

    /// Look a name up in a directory. Returns the entry's inode and the
    /// byte offset of the entry.
    ///
    /// # Panics
    ///
    /// Panics when the inode is not a directory.
    pub fn dirlookup(&self, name: &str) -> Option<(Inode, u32)> {
        assert_eq!(self.data.ty, T_DIR, "dirlookup not DIR");
        let size = self.data.size;
        let ent = core::mem::size_of::<DirEntry>() as u32;
        let mut de = DirEntry::EMPTY;
        let mut off = 0;
        while off < size {
            self.read_entry(off, &mut de);
            if de.inum != 0 && de.is_named(name) {
                let ip = self.fs.iget(de.inum as u32)?;
                return Some((ip, off));
            }
            off += ent;
        }
        None
    }

    /// Append a `(name, inum)` entry. Fails when the name is taken.
    /// Caller must be in a transaction.
    pub fn dirlink(&mut self, name: &str, inum: u32) -> Result<(), ()> {
        if self.dirlookup(name).is_some() {
            return Err(());
        }
        let size = self.data.size;
        let ent = core::mem::size_of::<DirEntry>() as u32;
        let mut de = DirEntry::EMPTY;
        let mut off = 0;
        while off < size {
            self.read_entry(off, &mut de);
            if de.inum == 0 {
                break;
            }
            off += ent;
        }
        let de = DirEntry::new(name, inum);
        match self.write_at(off, de.as_bytes()) {
            Some(n) if n == de.as_bytes().len() => Ok(()),
            _ => panic!("dirlink"),
        }
    }

    /// Remove the named entry, dropping one link of its inode.
    /// Non-empty directories refuse. Caller must be in a transaction.
    pub fn dirunlink(&mut self, name: &str) -> Result<(), ()> {
        let (ip, off) = self.dirlookup(name).ok_or(())?;
        {
            let mut child = ip.lock();
            if child.data.ty == T_DIR && !child.is_dir_empty() {
                return Err(());
            }
            let de = DirEntry::EMPTY;
            if self.write_at(off, de.as_bytes()) != Some(de.as_bytes().len()) {
                return Err(());
            }
            if child.data.ty == T_DIR {
                self.data.nlink -= 1;
                self.update();
            }
            child.data.nlink -= 1;
            child.update();
        }
        drop(ip);
        Ok(())
    }

    /// Entries of a directory, dot entries filtered out.
    pub fn entries(&self) -> Vec<(String, u32)> {
        assert_eq!(self.data.ty, T_DIR, "entries not DIR");
        let size = self.data.size;
        let ent = core::mem::size_of::<DirEntry>() as u32;
        let mut de = DirEntry::EMPTY;
        let mut out = Vec::new();
        let mut off = 0;
        while off < size {
            self.read_entry(off, &mut de);
            if de.inum != 0 && !de.is_named(".") && !de.is_named("..") {
                out.push((String::from(de.name()), de.inum as u32));
            }
            off += ent;
        }
        out
    }

    /// Anything besides `.` and `..` left?
    pub fn is_dir_empty(&self) -> bool {
        let size = self.data.size;
        let ent = core::mem::size_of::<DirEntry>() as u32;
        let mut de = DirEntry::EMPTY;
        let mut off = 2 * ent;
        while off < size {
            self.read_entry(off, &mut de);
            if de.inum != 0 {
                return false;
            }
            off += ent;
        }
        true
    }

    fn read_entry(&self, off: u32, de: &mut DirEntry) {
        if self.read_at(off, de.as_bytes_mut()) != Some(core::mem::size_of::<DirEntry>()) {
            panic!("dir entry read");
        }
    }

    /// Does the inode sit inside the snapshot tree (or is it `/snapshot`
    /// itself)? Root-based walk over `..` links.
    pub fn is_snapshot_descendant(&self) -> bool {
        if self.inum == ROOTINO {
            return false;
        }
        let snap_inum = {
            let root = match self.fs.iget(ROOTINO) {
                Some(root) => root,
                None => return false,
            };
            let guard = root.lock();
            match guard.dirlookup("snapshot") {
                Some((ip, _)) => ip.inum(),
                None => return false,
            }
        };
        if self.inum == snap_inum {
            return true;
        }
        if self.data.ty != T_DIR {
            return false;
        }
        let mut cur = self.dirlookup("..").map(|(p, _)| p);
        // climb towards the root; the chain is finite
        while let Some(ip) = cur {
            if ip.inum() == snap_inum {
                return true;
            }
            if ip.inum() == ROOTINO {
                return false;
            }
            let next = {
                let guard = ip.lock();
                guard.dirlookup("..").map(|(p, _)| p)
            };
            cur = next;
        }
        false
    }
}

impl DirEntry {
    /// Raw bytes of the entry
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(self as *const _ as *const u8, core::mem::size_of::<Self>())
        }
    }

    /// Raw bytes of the entry, writable
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(self as *mut _ as *mut u8, core::mem::size_of::<Self>())
        }
    }
}
