extern crate std;

use crate::*;
use alloc::{sync::Arc, vec, vec::Vec};
use std::sync::Mutex;

/// RAM 盘，与教学内核里挂的块设备同一个接口。
struct RamDisk(Mutex<Vec<[u8; BSIZE]>>);

impl RamDisk {
    fn new(blocks: usize) -> Self {
        Self(Mutex::new(vec![[0; BSIZE]; blocks]))
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.0.lock().unwrap()[block_id]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        self.0.lock().unwrap()[block_id].copy_from_slice(buf);
    }
}

const IMG_BLOCKS: u32 = 2400;

fn fresh_fs() -> (Arc<RamDisk>, Arc<SnapFs>) {
    let device = Arc::new(RamDisk::new(IMG_BLOCKS as usize));
    let fs = SnapFs::format(device.clone(), IMG_BLOCKS, 200);
    (device, fs)
}

fn make_file(fs: &Arc<SnapFs>, name: &str) -> Inode {
    let root = fs.root_inode();
    let _tx = fs.begin_op();
    fs.create(&root, name, T_FILE, 0, 0).unwrap()
}

/// 12 个 512 字节的块再加一行 hello，正好用上第一个间接块。
fn fill_test_file(file: &Inode) {
    let mut buf = [0u8; BSIZE];
    buf[BSIZE - 1] = b'\n';
    for i in 0..NDIRECT {
        buf[0] = b'0' + (i % 10) as u8;
        assert_eq!(file.write_at((i * BSIZE) as u32, &buf), Some(BSIZE));
    }
    assert_eq!(file.write_at((NDIRECT * BSIZE) as u32, b"hello\n"), Some(6));
}

fn addrs_of(file: &Inode) -> [u32; NDIRECT + 1] {
    *file.lock().addrs()
}

fn indirect_table(file: &Inode) -> [u32; NINDIRECT] {
    let guard = file.lock();
    let mut table = [0u32; NINDIRECT];
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = guard.bmmap(NDIRECT + i);
    }
    table
}

#[test]
fn write_read_roundtrip() {
    let (_device, fs) = fresh_fs();
    let file = make_file(&fs, "hi");
    assert_eq!(file.write_at(0, b"first line"), Some(10));
    let mut buf = [0u8; 32];
    assert_eq!(file.read_at(0, &mut buf), Some(10));
    assert_eq!(&buf[..10], b"first line");
}

#[test]
fn contents_survive_remount() {
    let (device, fs) = fresh_fs();
    {
        let file = make_file(&fs, "keep");
        file.write_at(0, b"durable").unwrap();
    }
    drop(fs);
    let fs = SnapFs::open(device);
    let file = fs.namei("/keep").unwrap();
    let mut buf = [0u8; 7];
    assert_eq!(file.read_at(0, &mut buf), Some(7));
    assert_eq!(&buf, b"durable");
}

#[test]
fn paths_walk_directories() {
    let (_device, fs) = fresh_fs();
    let root = fs.root_inode();
    let dir = {
        let _tx = fs.begin_op();
        fs.create(&root, "docs", T_DIR, 0, 0).unwrap()
    };
    {
        let _tx = fs.begin_op();
        fs.create(&dir, "note", T_FILE, 0, 0).unwrap();
    }
    assert!(fs.namei("/docs/note").is_some());
    assert!(fs.namei("/docs/missing").is_none());
    let (parent, name) = fs.nameiparent("/docs/note").unwrap();
    assert_eq!(parent.inum(), dir.inum());
    assert_eq!(name, "note");
}

#[test]
fn unlink_frees_file_blocks() {
    let (_device, fs) = fresh_fs();
    let file = make_file(&fs, "gone");
    file.write_at(0, &[7u8; BSIZE]).unwrap();
    let addr = { file.lock().bmmap(0) };
    assert!(fs.block_in_use(addr));
    drop(file);
    {
        let _tx = fs.begin_op();
        let root = fs.root_inode();
        let mut guard = root.lock();
        assert_eq!(guard.dirunlink("gone"), Ok(()));
    }
    assert!(!fs.block_in_use(addr));
}

#[test]
fn test_file_uses_direct_and_indirect_blocks() {
    let (_device, fs) = fresh_fs();
    let file = make_file(&fs, "hi");
    fill_test_file(&file);
    let addrs = addrs_of(&file);
    for (i, &addr) in addrs.iter().enumerate().take(NDIRECT) {
        assert_ne!(addr, 0, "direct slot {i}");
    }
    assert_ne!(addrs[NDIRECT], 0, "indirect pointer");
    let table = indirect_table(&file);
    assert_ne!(table[0], 0);
    assert!(table[1..].iter().all(|&a| a == 0));
}

#[test]
fn first_snapshot_gets_id_one() {
    let (_device, fs) = fresh_fs();
    let file = make_file(&fs, "hi");
    fill_test_file(&file);
    assert_eq!(fs.snapshot_create(), Ok(1));
    assert_eq!(fs.snapshot_create(), Ok(2));
    assert!(fs.namei("/snapshot/00000001/hi").is_some());
    assert!(fs.namei("/snapshot/00000002/hi").is_some());
}

#[test]
fn one_byte_write_clones_one_direct_block() {
    let (_device, fs) = fresh_fs();
    let file = make_file(&fs, "hi");
    fill_test_file(&file);
    let before = addrs_of(&file);
    fs.snapshot_create().unwrap();

    assert_eq!(file.write_at(0, b"X"), Some(1));
    let after = addrs_of(&file);
    assert_ne!(after[0], before[0], "touched block must be cloned");
    assert_eq!(after[1..], before[1..], "untouched blocks keep addresses");

    // 快照那边还看得到旧内容
    let snap = fs.namei("/snapshot/00000001/hi").unwrap();
    let mut buf = [0u8; 1];
    snap.read_at(0, &mut buf).unwrap();
    assert_eq!(buf[0], b'0');
    let mut buf = [0u8; 1];
    file.read_at(0, &mut buf).unwrap();
    assert_eq!(buf[0], b'X');
}

#[test]
fn append_migrates_whole_indirect_subtree() {
    let (_device, fs) = fresh_fs();
    let file = make_file(&fs, "hi");
    fill_test_file(&file);
    let before = addrs_of(&file);
    let before_table = indirect_table(&file);
    fs.snapshot_create().unwrap();

    let size = { file.lock().size() };
    assert_eq!(file.write_at(size, b"XYZ"), Some(3));

    let after = addrs_of(&file);
    let after_table = indirect_table(&file);
    assert_eq!(
        after[..NDIRECT],
        before[..NDIRECT],
        "direct blocks stay shared until written"
    );
    assert_ne!(after[NDIRECT], before[NDIRECT], "fresh indirect block");
    assert_ne!(after_table[0], before_table[0], "indirect data migrated");

    let snap = fs.namei("/snapshot/00000001/hi").unwrap();
    let snap_addrs = addrs_of(&snap);
    assert_eq!(snap_addrs, before, "snapshot keeps the captured addresses");
    let mut buf = [0u8; 6];
    snap.read_at((NDIRECT * BSIZE) as u32, &mut buf).unwrap();
    assert_eq!(&buf, b"hello\n");
    let mut buf = [0u8; 9];
    file.read_at((NDIRECT * BSIZE) as u32, &mut buf).unwrap();
    assert_eq!(&buf, b"hello\nXYZ");
}

#[test]
fn snapshot_protects_blocks_from_unlink() {
    let (_device, fs) = fresh_fs();
    let file = make_file(&fs, "hi");
    file.write_at(0, &[9u8; BSIZE]).unwrap();
    let addr = { file.lock().bmmap(0) };
    fs.snapshot_create().unwrap();
    drop(file);
    {
        let _tx = fs.begin_op();
        let root = fs.root_inode();
        let mut guard = root.lock();
        guard.dirunlink("hi").unwrap();
    }
    assert!(fs.namei("/hi").is_none());
    // 数据块归快照所有，不能回收
    assert!(fs.block_in_use(addr));
    let snap = fs.namei("/snapshot/00000001/hi").unwrap();
    let mut buf = [0u8; 1];
    snap.read_at(0, &mut buf).unwrap();
    assert_eq!(buf[0], 9);
}

#[test]
fn rollback_restores_deleted_file() {
    let (_device, fs) = fresh_fs();
    let file = make_file(&fs, "hi");
    fill_test_file(&file);
    let mut want = vec![0u8; (NDIRECT * BSIZE + 6) as usize];
    assert_eq!(file.read_at(0, &mut want), Some(want.len()));
    fs.snapshot_create().unwrap();
    drop(file);
    {
        let _tx = fs.begin_op();
        let root = fs.root_inode();
        let mut guard = root.lock();
        guard.dirunlink("hi").unwrap();
    }
    assert!(fs.namei("/hi").is_none());

    assert_eq!(fs.snapshot_rollback(1), Ok(()));
    let file = fs.namei("/hi").unwrap();
    let mut got = vec![0u8; want.len()];
    assert_eq!(file.read_at(0, &mut got), Some(got.len()));
    assert_eq!(got, want);
    assert_eq!(got[0], b'0');
}

#[test]
fn rollback_overwrites_modified_file() {
    let (_device, fs) = fresh_fs();
    let file = make_file(&fs, "cfg");
    file.write_at(0, b"v1").unwrap();
    fs.snapshot_create().unwrap();
    file.write_at(0, b"v2").unwrap();
    drop(file);

    assert_eq!(fs.snapshot_rollback(1), Ok(()));
    let file = fs.namei("/cfg").unwrap();
    let mut buf = [0u8; 2];
    file.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"v1");
}

#[test]
fn rollback_rejects_unknown_id() {
    let (_device, fs) = fresh_fs();
    assert_eq!(fs.snapshot_rollback(9), Err(SnapshotError::InvalidId));
    assert_eq!(fs.snapshot_delete(9), Err(SnapshotError::InvalidId));
}

#[test]
fn delete_reclaims_inodes_and_unique_blocks() {
    let (_device, fs) = fresh_fs();
    let file = make_file(&fs, "hi");
    file.write_at(0, &[3u8; BSIZE]).unwrap();
    let addr = { file.lock().bmmap(0) };
    fs.snapshot_create().unwrap();
    drop(file);
    {
        let _tx = fs.begin_op();
        let root = fs.root_inode();
        root.lock().dirunlink("hi").unwrap();
    }
    // 只剩快照引用这个块
    assert!(fs.block_in_use(addr));
    let inodes_with_snap = fs.allocated_inodes();

    assert_eq!(fs.snapshot_delete(1), Ok(()));
    assert!(fs.namei("/snapshot/00000001").is_none());
    assert!(fs.allocated_inodes() < inodes_with_snap);
    // 谁都不引用了，块也回收
    assert!(!fs.block_in_use(addr));
}

#[test]
fn delete_keeps_blocks_of_other_snapshots() {
    let (_device, fs) = fresh_fs();
    let file = make_file(&fs, "hi");
    file.write_at(0, &[5u8; BSIZE]).unwrap();
    let addr = { file.lock().bmmap(0) };
    fs.snapshot_create().unwrap();
    fs.snapshot_create().unwrap();
    drop(file);

    assert_eq!(fs.snapshot_delete(1), Ok(()));
    assert!(fs.block_in_use(addr));
    let snap = fs.namei("/snapshot/00000002/hi").unwrap();
    let mut buf = [0u8; 1];
    snap.read_at(0, &mut buf).unwrap();
    assert_eq!(buf[0], 5);

    // 第二个快照也删掉之后，共享位清空，写回原地
    assert_eq!(fs.snapshot_delete(2), Ok(()));
    let live = fs.namei("/hi").unwrap();
    let before = { live.lock().bmmap(0) };
    live.write_at(0, b"w").unwrap();
    assert_eq!({ live.lock().bmmap(0) }, before, "no snapshot, no clone");
}

#[test]
fn admission_rejects_when_inodes_run_out() {
    let device = Arc::new(RamDisk::new(IMG_BLOCKS as usize));
    let fs = SnapFs::format(device, IMG_BLOCKS, 16);
    for name in ["a", "b", "c"] {
        let file = make_file(&fs, name);
        file.write_at(0, name.as_bytes()).unwrap();
    }
    assert_eq!(fs.snapshot_create(), Ok(1));
    assert_eq!(fs.snapshot_create(), Ok(2));
    assert_eq!(fs.snapshot_create(), Err(SnapshotError::OutOfInodes));
    // 删掉一个快照腾出 inode，再建就成了
    assert_eq!(fs.snapshot_delete(1), Ok(()));
    assert_eq!(fs.snapshot_create(), Ok(3));
}

#[test]
fn snapshot_ids_survive_remount() {
    let (device, fs) = fresh_fs();
    make_file(&fs, "f");
    assert_eq!(fs.snapshot_create(), Ok(1));
    drop(fs);
    let fs = SnapFs::open(device);
    assert_eq!(fs.snapshot_create(), Ok(2));
}

#[test]
fn snapshot_descendants_are_detected() {
    let (_device, fs) = fresh_fs();
    make_file(&fs, "hi");
    fs.snapshot_create().unwrap();
    let snap = fs.namei("/snapshot/00000001").unwrap();
    assert!({ snap.lock().is_snapshot_descendant() });
    let root = fs.root_inode();
    assert!(!{ root.lock().is_snapshot_descendant() });
}
