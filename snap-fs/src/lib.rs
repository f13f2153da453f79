//! A block-allocated, journaled file system with whole-tree snapshots.
//!
//! Layered bottom-up: block device trait, block cache, write-ahead log,
//! inodes and directories, and the snapshot service. Snapshots share data
//! blocks with the live tree; a shared-block bitmap makes the write path
//! clone blocks before modifying them and keeps the allocator from
//! freeing them.

#![no_std]
#![deny(warnings)]

extern crate alloc;

mod block_dev;
mod cache;
mod file;
mod fs;
mod inode;
mod layout;
mod log;
mod snapshot;

pub use block_dev::BlockDevice;
pub use file::{FSManager, File, FileHandle, OpenFlags, UserBuffer};
pub use fs::{SnapFs, Tx};
pub use inode::{Inode, InodeGuard};
pub use layout::{
    DirEntry, DiskInode, SuperBlock, BSIZE, DIRSIZ, MAXFILE, NDIRECT, NINDIRECT, ROOTINO, T_DEV,
    T_DIR, T_FILE, T_NONE,
};
pub use snapshot::{SnapshotError, SnapshotMeta};

#[cfg(test)]
mod tests;
