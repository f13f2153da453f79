//! Whole-filesystem snapshots.
//!
//! A snapshot mirrors `/` under `/snapshot/<hex-id>`: directories are
//! rebuilt, file inodes share their data-block addresses with the live
//! file they shadow. Every shared block is marked in the snapshot map, so
//! the allocator refuses to free it and the write path clones it before
//! the first modification.

use crate::{
    fs::SnapFs,
    inode::Inode,
    layout::{ROOTINO, T_DEV, T_DIR, T_FILE},
};
use alloc::{collections::BTreeSet, format, string::String, sync::Arc, vec, vec::Vec};

/// In-memory snapshot state, persisted as `/snapshot/smap`:
/// the next snapshot id followed by one bit per disk block.
pub struct SnapshotMeta {
    next_id: u32,
    smap: Vec<u8>,
}

impl SnapshotMeta {
    pub(crate) fn new(total_blocks: u32) -> Self {
        Self {
            next_id: 1,
            smap: vec![0; (total_blocks as usize + 7) / 8],
        }
    }

    /// Bit set ⇔ the block is referenced by at least one snapshot.
    pub(crate) fn is_shared(&self, b: u32) -> bool {
        self.smap[b as usize / 8] & (1 << (b % 8)) != 0
    }

    pub(crate) fn set(&mut self, b: u32) {
        self.smap[b as usize / 8] |= 1 << (b % 8);
    }

    pub(crate) fn clear(&mut self, b: u32) {
        self.smap[b as usize / 8] &= !(1 << (b % 8));
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.smap.len());
        out.extend_from_slice(&self.next_id.to_le_bytes());
        out.extend_from_slice(&self.smap);
        out
    }

    /// Restore from file contents; a short file counts as corrupt.
    fn load(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() < 4 + self.smap.len() {
            return false;
        }
        self.next_id = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        let len = self.smap.len();
        self.smap.copy_from_slice(&bytes[4..4 + len]);
        true
    }
}

/// Why a snapshot operation failed
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SnapshotError {
    /// Mid-walk allocation failure or broken snapshot tree
    Generic,
    /// Admission check: the walk would exhaust the inode table
    OutOfInodes,
    /// No snapshot with that id
    InvalidId,
}

impl SnapFs {
    pub(crate) fn smap_is_shared(&self, b: u32) -> bool {
        self.smeta.lock().is_shared(b)
    }

    pub(crate) fn smap_clear(&self, b: u32) {
        self.smeta.lock().clear(b);
    }

    /// `/snapshot`, created on first use.
    pub fn snapshot_root(self: &Arc<Self>, root: &Inode) -> Option<Inode> {
        let found = { root.lock().dirlookup("snapshot").map(|(ip, _)| ip) };
        match found {
            Some(ip) => Some(ip),
            None => {
                let _tx = self.begin_op();
                self.create(root, "snapshot", T_DIR, 0, 0)
            }
        }
    }

    /// Load `/snapshot/smap` at mount, creating and persisting a fresh
    /// state on first boot.
    pub(crate) fn setup_snapshot_state(self: &Arc<Self>) {
        let root = self.root_inode();
        let sroot = self.snapshot_root(&root).expect("snapshot root");
        let found = { sroot.lock().dirlookup("smap").map(|(ip, _)| ip) };
        match found {
            Some(info) => {
                let guard = info.lock();
                let mut buf = vec![0u8; guard.size() as usize];
                let read = guard.read_at(0, &mut buf).unwrap_or(0);
                drop(guard);
                let mut smeta = self.smeta.lock();
                if !smeta.load(&buf[..read]) {
                    *smeta = SnapshotMeta::new(self.superblock().size);
                }
            }
            None => {
                {
                    let _tx = self.begin_op();
                    self.create(&sroot, "smap", T_FILE, 0, 0)
                        .expect("snapshot map file");
                }
                self.persist_smeta();
            }
        }
    }

    /// Rewrite `/snapshot/smap` from the in-memory state, in its own
    /// transaction. Failures are logged and swallowed; the in-memory
    /// state stays authoritative until the next rewrite.
    pub(crate) fn persist_smeta(self: &Arc<Self>) {
        let bytes = self.smeta.lock().to_bytes();
        let root = self.root_inode();
        let sroot = match self.snapshot_root(&root) {
            Some(ip) => ip,
            None => {
                ::log::error!("snapshot: no /snapshot for the map");
                return;
            }
        };
        let found = { sroot.lock().dirlookup("smap").map(|(ip, _)| ip) };
        let info = match found {
            Some(ip) => Some(ip),
            None => {
                let _tx = self.begin_op();
                self.create(&sroot, "smap", T_FILE, 0, 0)
            }
        };
        match info {
            Some(info) => {
                if info.write_at(0, &bytes) != Some(bytes.len()) {
                    ::log::error!("snapshot: map rewrite failed");
                }
            }
            None => ::log::error!("snapshot: cannot create the map file"),
        }
    }

    /// Inodes in the subtree of `ip`, the subtree root included.
    /// `/snapshot` under the root is not counted.
    pub fn count_tree_inodes(self: &Arc<Self>, ip: &Inode) -> u32 {
        let children = {
            let guard = ip.lock();
            if guard.ty() != T_DIR {
                return 1;
            }
            let mut entries = guard.entries();
            if ip.inum() == ROOTINO {
                entries.retain(|(name, _)| name != "snapshot");
            }
            entries
        };
        let mut total = 1;
        for (_, inum) in children {
            if let Some(child) = self.iget(inum) {
                total += self.count_tree_inodes(&child);
            }
        }
        total
    }

    /// Collect every data block referenced by file inodes in the subtree.
    fn tree_blocks(self: &Arc<Self>, ip: &Inode, out: &mut BTreeSet<u32>) {
        enum Kind {
            File(Vec<u32>),
            Dir(Vec<(String, u32)>),
            Other,
        }
        let kind = {
            let guard = ip.lock();
            match guard.ty() {
                T_FILE => Kind::File(guard.referenced_blocks()),
                T_DIR => {
                    let mut entries = guard.entries();
                    if ip.inum() == ROOTINO {
                        entries.retain(|(name, _)| name != "snapshot");
                    }
                    Kind::Dir(entries)
                }
                _ => Kind::Other,
            }
        };
        match kind {
            Kind::File(blocks) => out.extend(blocks),
            Kind::Dir(children) => {
                for (_, inum) in children {
                    if let Some(child) = self.iget(inum) {
                        self.tree_blocks(&child, out);
                    }
                }
            }
            Kind::Other => {}
        }
    }

    /// Mirror one inode into the snapshot tree. Directories are rebuilt
    /// empty; files share their block addresses, which get marked in the
    /// snapshot map.
    fn copy_inode(self: &Arc<Self>, dst_dir: &Inode, src: &Inode, name: &str) -> Option<Inode> {
        let _tx = self.begin_op();
        let ty = { src.lock().ty() };
        let np = self.ialloc(ty)?;
        {
            let mut g = np.lock();
            let sg = src.lock();
            g.data.major = sg.data.major;
            g.data.minor = sg.data.minor;
            g.data.nlink = 1;
            if ty == T_DIR {
                g.data.nlink += 1;
                drop(sg);
                g.update();
                if g.dirlink(".", np.inum()).is_err() || g.dirlink("..", dst_dir.inum()).is_err() {
                    panic!("snapshot: dots");
                }
            } else {
                g.data.size = sg.size();
                g.data.addrs = *sg.addrs();
                for b in sg.referenced_blocks() {
                    self.smeta.lock().set(b);
                }
                drop(sg);
                g.update();
            }
        }
        let mut dg = dst_dir.lock();
        if dg.dirlink(name, np.inum()).is_err() {
            panic!("snapshot: dirlink");
        }
        drop(dg);
        Some(np)
    }

    fn mirror_tree(self: &Arc<Self>, src: &Inode, dst: &Inode) -> Result<(), ()> {
        let entries = {
            let guard = src.lock();
            let mut entries = guard.entries();
            if src.inum() == ROOTINO {
                entries.retain(|(name, _)| name != "snapshot");
            }
            entries
        };
        for (name, inum) in entries {
            let child = match self.iget(inum) {
                Some(child) => child,
                None => continue,
            };
            let ty = { child.lock().ty() };
            match ty {
                T_DIR => {
                    let copy = self.copy_inode(dst, &child, &name).ok_or(())?;
                    self.mirror_tree(&child, &copy)?;
                }
                T_DEV => {}
                _ => {
                    self.copy_inode(dst, &child, &name).ok_or(())?;
                }
            }
        }
        Ok(())
    }

    fn find_snapshot(self: &Arc<Self>, sroot: &Inode, id: u32) -> Option<Inode> {
        let name = format!("{id:08x}");
        let guard = sroot.lock();
        guard.dirlookup(&name).map(|(ip, _)| ip)
    }

    /// Capture the live tree under a fresh `/snapshot/<hex-id>`.
    ///
    /// Fails with [`SnapshotError::OutOfInodes`] when the admission check
    /// predicts inode exhaustion; a mid-walk failure leaves the partial
    /// mirror in place for [`SnapFs::snapshot_delete`] to clean up.
    pub fn snapshot_create(self: &Arc<Self>) -> Result<u32, SnapshotError> {
        let root = self.root_inode();
        let current = self.allocated_inodes().max(self.cached_inodes());
        let required = self.count_tree_inodes(&root);
        if current + required + 1 > self.superblock().ninodes {
            return Err(SnapshotError::OutOfInodes);
        }
        let sroot = self
            .snapshot_root(&root)
            .ok_or(SnapshotError::Generic)?;
        let id = {
            let mut smeta = self.smeta.lock();
            let id = smeta.next_id;
            smeta.next_id += 1;
            id
        };
        self.persist_smeta();
        let snap_dir = {
            let _tx = self.begin_op();
            self.create(&sroot, &format!("{id:08x}"), T_DIR, 0, 0)
                .ok_or(SnapshotError::Generic)?
        };
        self.mirror_tree(&root, &snap_dir)
            .map_err(|_| SnapshotError::Generic)?;
        self.persist_smeta();
        Ok(id)
    }

    /// Restore one file from the snapshot: a fresh inode sharing the
    /// snapshot's block addresses, all of them (re)marked shared.
    fn restore_inode(self: &Arc<Self>, dp: &Inode, snap_ip: &Inode, name: &str) -> Option<Inode> {
        let _tx = self.begin_op();
        let np = self.ialloc(T_FILE)?;
        {
            let mut g = np.lock();
            let sg = snap_ip.lock();
            g.data.major = sg.data.major;
            g.data.minor = sg.data.minor;
            g.data.nlink = 1;
            g.data.size = sg.size();
            g.data.addrs = *sg.addrs();
            for b in sg.referenced_blocks() {
                self.smeta.lock().set(b);
            }
            drop(sg);
            g.update();
        }
        self.persist_smeta();
        let mut dg = dp.lock();
        if dg.dirlink(name, np.inum()).is_err() {
            return None;
        }
        drop(dg);
        Some(np)
    }

    fn restore_tree(self: &Arc<Self>, snap_dir: &Inode, target_dir: &Inode) -> Result<(), ()> {
        let entries = { snap_dir.lock().entries() };
        for (name, inum) in entries {
            let child = self.iget(inum).ok_or(())?;
            let ty = { child.lock().ty() };
            match ty {
                T_DIR => {
                    let existing = { target_dir.lock().dirlookup(&name).map(|(ip, _)| ip) };
                    let sub = match existing {
                        Some(dir) => dir,
                        None => {
                            let _tx = self.begin_op();
                            self.create(target_dir, &name, T_DIR, 0, 0).ok_or(())?
                        }
                    };
                    self.restore_tree(&child, &sub)?;
                }
                T_DEV => {}
                _ => {
                    let exists = { target_dir.lock().dirlookup(&name).is_some() };
                    if exists {
                        let _tx = self.begin_op();
                        let mut tg = target_dir.lock();
                        let _ = tg.dirunlink(&name);
                    }
                    self.restore_inode(target_dir, &child, &name).ok_or(())?;
                }
            }
        }
        Ok(())
    }

    /// Bring `/` back to the state captured by snapshot `id`.
    /// Inode numbers are not preserved.
    pub fn snapshot_rollback(self: &Arc<Self>, id: u32) -> Result<(), SnapshotError> {
        let root = self.root_inode();
        let sroot = self
            .snapshot_root(&root)
            .ok_or(SnapshotError::Generic)?;
        let snap = self
            .find_snapshot(&sroot, id)
            .ok_or(SnapshotError::InvalidId)?;
        let current = self.allocated_inodes().max(self.cached_inodes());
        let to_add = self.count_tree_inodes(&snap);
        let to_delete = self.count_tree_inodes(&root);
        // the live tree may hold more inodes than the snapshot
        let required = to_add.saturating_sub(to_delete);
        if current + required > self.superblock().ninodes {
            return Err(SnapshotError::OutOfInodes);
        }
        self.restore_tree(&snap, &root)
            .map_err(|_| SnapshotError::Generic)
    }

    fn delete_tree(self: &Arc<Self>, dir: &Inode) {
        let entries = { dir.lock().entries() };
        for (name, inum) in entries {
            let child = match self.iget(inum) {
                Some(child) => child,
                None => continue,
            };
            let ty = { child.lock().ty() };
            if ty == T_DIR {
                self.delete_tree(&child);
            }
            if ty != T_DEV {
                let _tx = self.begin_op();
                let mut dg = dir.lock();
                let _ = dg.dirunlink(&name);
            }
        }
    }

    /// Unlink everything under `/snapshot/<hex-id>` and the directory
    /// itself, then settle the snapshot map: a block only the deleted
    /// snapshot referenced loses its bit, and is freed outright when the
    /// live tree does not hold it either.
    pub fn snapshot_delete(self: &Arc<Self>, id: u32) -> Result<(), SnapshotError> {
        let root = self.root_inode();
        let sroot = self
            .snapshot_root(&root)
            .ok_or(SnapshotError::Generic)?;
        let snap = self
            .find_snapshot(&sroot, id)
            .ok_or(SnapshotError::InvalidId)?;

        let mut doomed = BTreeSet::new();
        self.tree_blocks(&snap, &mut doomed);

        self.delete_tree(&snap);
        drop(snap);
        {
            let _tx = self.begin_op();
            let mut sg = sroot.lock();
            let _ = sg.dirunlink(&format!("{id:08x}"));
        }

        // blocks still referenced by another snapshot keep their bit
        let mut still = BTreeSet::new();
        let others = { sroot.lock().entries() };
        for (_, inum) in others {
            if let Some(other) = self.iget(inum) {
                let is_dir = { other.lock().ty() == T_DIR };
                if is_dir {
                    self.tree_blocks(&other, &mut still);
                }
            }
        }
        let mut live = BTreeSet::new();
        self.tree_blocks(&root, &mut live);

        let mut changed = false;
        {
            let _tx = self.begin_op();
            for &b in doomed.difference(&still) {
                {
                    let mut smeta = self.smeta.lock();
                    if smeta.is_shared(b) {
                        smeta.clear(b);
                        changed = true;
                    }
                }
                if !live.contains(&b) && self.block_in_use(b) {
                    self.bfree(b);
                }
            }
        }
        if changed {
            self.persist_smeta();
        }
        Ok(())
    }
}
