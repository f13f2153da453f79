//! 文件系统的挂载与路径接口。

use alloc::{string::String, sync::Arc, vec, vec::Vec};
use lazy_static::lazy_static;
use snap_fs::{
    BlockDevice, FSManager, FileHandle, Inode, OpenFlags, SnapFs, BSIZE, T_DIR, T_FILE,
};
use spin::Mutex;

/// 文件系统镜像的总块数。
pub const FS_BLOCKS: u32 = 4000;
/// inode 表的容量。
pub const FS_INODES: u32 = 200;

/// 内存里的块设备。
pub struct RamDisk(Mutex<Vec<[u8; BSIZE]>>);

impl RamDisk {
    /// 全零的盘。
    pub fn new(blocks: usize) -> Self {
        Self(Mutex::new(vec![[0; BSIZE]; blocks]))
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.0.lock()[block_id]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        self.0.lock()[block_id].copy_from_slice(buf);
    }
}

/// 挂载好的文件系统。
pub struct FileSystem {
    fs: Arc<SnapFs>,
}

impl FileSystem {
    fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            fs: SnapFs::format(device, FS_BLOCKS, FS_INODES),
        }
    }

    /// 底下的文件系统对象。
    pub fn fs(&self) -> &Arc<SnapFs> {
        &self.fs
    }

    /// 创建目录。
    pub fn mkdir(&self, path: &str) -> isize {
        let Some((parent, name)) = self.fs.nameiparent(path) else {
            return -1;
        };
        let _tx = self.fs.begin_op();
        match self.fs.create(&parent, &name, T_DIR, 0, 0) {
            Some(_) => 0,
            None => -1,
        }
    }
}

impl FSManager for FileSystem {
    fn open(&self, path: &str, flags: OpenFlags) -> Option<Arc<FileHandle>> {
        let (readable, writable) = flags.read_write();
        let inode = if flags.contains(OpenFlags::CREATE) {
            let (parent, name) = self.fs.nameiparent(path)?;
            let _tx = self.fs.begin_op();
            self.fs.create(&parent, &name, T_FILE, 0, 0)?
        } else {
            self.find(path)?
        };
        if flags.contains(OpenFlags::TRUNC) {
            let _tx = self.fs.begin_op();
            inode.lock().truncate();
        }
        Some(Arc::new(FileHandle::new(readable, writable, inode)))
    }

    fn find(&self, path: &str) -> Option<Inode> {
        self.fs.namei(path)
    }

    fn link(&self, src: &str, dst: &str) -> isize {
        let Some(ip) = self.fs.namei(src) else {
            return -1;
        };
        {
            let guard = ip.lock();
            if guard.ty() == T_DIR {
                return -1;
            }
        }
        let Some((parent, name)) = self.fs.nameiparent(dst) else {
            return -1;
        };
        let _tx = self.fs.begin_op();
        ip.lock().inc_nlink();
        let mut pg = parent.lock();
        if pg.dirlink(&name, ip.inum()).is_err() {
            drop(pg);
            let mut guard = ip.lock();
            guard.dec_nlink();
            return -1;
        }
        0
    }

    fn unlink(&self, path: &str) -> isize {
        let Some((parent, name)) = self.fs.nameiparent(path) else {
            return -1;
        };
        {
            // 快照树是只读的
            let guard = parent.lock();
            if guard.is_snapshot_descendant() {
                return -1;
            }
        }
        let _tx = self.fs.begin_op();
        let mut guard = parent.lock();
        match guard.dirunlink(&name) {
            Ok(()) => 0,
            Err(()) => -1,
        }
    }

    fn readdir(&self, path: &str) -> Option<Vec<String>> {
        let ip = self.fs.namei(path)?;
        let guard = ip.lock();
        if guard.ty() != T_DIR {
            return None;
        }
        Some(guard.entries().into_iter().map(|(name, _)| name).collect())
    }
}

lazy_static! {
    /// 内核启动时挂的块设备。
    pub static ref BLOCK_DEVICE: Arc<RamDisk> = Arc::new(RamDisk::new(FS_BLOCKS as usize));
    /// 全局文件系统。
    pub static ref FS: Arc<FileSystem> = {
        let device: Arc<dyn BlockDevice> = BLOCK_DEVICE.clone();
        Arc::new(FileSystem::new(device))
    };
}
