use snap_fs::{BlockDevice, BSIZE};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// 宿主机文件充当块设备。
pub struct BlockFile(Mutex<File>);

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BSIZE) as u64))
            .expect("Error when seeking!");
        assert_eq!(file.read(buf).unwrap(), BSIZE, "Not a complete block!");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BSIZE) as u64))
            .expect("Error when seeking!");
        assert_eq!(file.write(buf).unwrap(), BSIZE, "Not a complete block!");
    }
}

/// 新建一个全零镜像文件。
pub fn create(path: &Path, blocks: u32) -> Arc<BlockFile> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .expect("cannot create image");
    file.set_len(blocks as u64 * BSIZE as u64).unwrap();
    Arc::new(BlockFile(Mutex::new(file)))
}

/// 打开已有镜像。
pub fn open(path: &Path) -> Arc<BlockFile> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .expect("cannot open image");
    Arc::new(BlockFile(Mutex::new(file)))
}
