//! Write-ahead log.
//!
//! Multi-block updates are grouped into transactions. Blocks touched by a
//! transaction are first copied into the log area together with a header
//! naming their home locations; only after the header is down do the home
//! blocks get written. Replaying the header at mount finishes any update
//! that was cut short.

use crate::{
    block_dev::BlockDevice,
    layout::{SuperBlock, BSIZE, LOG_HEADER_BLOCKS},
};
use alloc::{sync::Arc, vec::Vec};

/// Bookkeeping of the running transaction group
pub struct Journal {
    start: usize,
    capacity: usize,
    outstanding: u32,
    ids: Vec<usize>,
}

impl Journal {
    /// Journal over the log area described by the super block
    pub fn new(sb: &SuperBlock) -> Self {
        let capacity = sb.nlog as usize - LOG_HEADER_BLOCKS;
        Self {
            start: sb.logstart as usize,
            capacity,
            outstanding: 0,
            ids: Vec::new(),
        }
    }

    /// Enter a transaction. Nests: the group commits when the last
    /// participant leaves.
    pub fn begin_op(&mut self) {
        self.outstanding += 1;
    }

    /// Record a block as part of the running transaction.
    /// Re-recording the same block is absorbed.
    ///
    /// # Panics
    ///
    /// Panics if the group outgrows the log area.
    pub fn record(&mut self, block_id: usize) {
        assert!(self.outstanding > 0, "log: write outside of transaction");
        if !self.ids.contains(&block_id) {
            self.ids.push(block_id);
        }
        assert!(self.ids.len() <= self.capacity, "log: transaction too big");
    }

    /// Leave a transaction. Returns `true` when the caller must commit.
    pub fn end_op(&mut self) -> bool {
        assert!(self.outstanding > 0);
        self.outstanding -= 1;
        self.outstanding == 0 && !self.ids.is_empty()
    }

    /// Take the recorded block ids for committing.
    pub fn take_ids(&mut self) -> Vec<usize> {
        core::mem::take(&mut self.ids)
    }

    /// First block of the log data area.
    #[inline]
    pub fn data_start(&self) -> usize {
        self.start + LOG_HEADER_BLOCKS
    }

    /// First block of the header.
    #[inline]
    pub fn header_start(&self) -> usize {
        self.start
    }
}

/// Serialize the header: a count followed by the home block numbers,
/// spanning `LOG_HEADER_BLOCKS` blocks.
pub fn write_header(device: &Arc<dyn BlockDevice>, start: usize, ids: &[usize]) {
    let mut raw = [0u8; BSIZE * LOG_HEADER_BLOCKS];
    raw[..4].copy_from_slice(&(ids.len() as u32).to_le_bytes());
    for (i, id) in ids.iter().enumerate() {
        let off = 4 + i * 4;
        raw[off..off + 4].copy_from_slice(&(*id as u32).to_le_bytes());
    }
    for i in 0..LOG_HEADER_BLOCKS {
        device.write_block(start + i, &raw[i * BSIZE..(i + 1) * BSIZE]);
    }
}

fn read_header(device: &Arc<dyn BlockDevice>, start: usize) -> Vec<usize> {
    let mut raw = [0u8; BSIZE * LOG_HEADER_BLOCKS];
    for i in 0..LOG_HEADER_BLOCKS {
        device.read_block(start + i, &mut raw[i * BSIZE..(i + 1) * BSIZE]);
    }
    let n = u32::from_le_bytes(raw[..4].try_into().unwrap()) as usize;
    let max = (BSIZE * LOG_HEADER_BLOCKS - 4) / 4;
    (0..n.min(max))
        .map(|i| {
            let off = 4 + i * 4;
            u32::from_le_bytes(raw[off..off + 4].try_into().unwrap()) as usize
        })
        .collect()
}

/// Replay a committed but unfinished transaction at mount.
pub fn recover(device: &Arc<dyn BlockDevice>, sb: &SuperBlock) {
    let start = sb.logstart as usize;
    let ids = read_header(device, start);
    if ids.is_empty() {
        return;
    }
    log::warn!("log: replaying {} blocks", ids.len());
    let mut buf = [0u8; BSIZE];
    for (i, id) in ids.iter().enumerate() {
        device.read_block(start + LOG_HEADER_BLOCKS + i, &mut buf);
        device.write_block(*id, &buf);
    }
    write_header(device, start, &[]);
}
