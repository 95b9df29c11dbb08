//! Raw block I/O and the write-back block cache.
//!
//! All reads and writes of payload blocks go through [`BlockCache`];
//! superblocks bypass it and use [`BlockIo`] directly. A cache slot is
//! found by a multiplicative hash of the block number probed over a
//! short window, so lookups stay O(window) regardless of cache size.

use std::fs::File;
use std::io;

use rand::Rng;
use tracing::trace;

use crate::error::{Error, Result};
use crate::format::{self, TxnId};

/// Positioned whole-block reads and writes with full-length checking.
pub struct BlockIo {
    file: File,
    block_size: usize,
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
fn pread(mut file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

#[cfg(not(unix))]
fn pwrite(mut file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

impl BlockIo {
    pub fn new(file: File, block_size: usize) -> Self {
        BlockIo { file, block_size }
    }

    pub fn read(&self, block: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);
        let offset = block as u64 * self.block_size as u64;
        pread(&self.file, buf, offset).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::ShortRead { block },
            _ => Error::IoError(e),
        })
    }

    pub fn write(&self, block: u32, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);
        let offset = block as u64 * self.block_size as u64;
        pwrite(&self.file, buf, offset).map_err(|e| match e.kind() {
            io::ErrorKind::WriteZero => Error::ShortWrite { block },
            _ => Error::IoError(e),
        })
    }

    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

const SLOT_MULTIPLIER: u32 = 391_828_139;

struct Slot {
    block: u32,
    used: bool,
    dirty: bool,
    data: Vec<u8>,
}

/// Write-back cache over [`BlockIo`].
///
/// Eviction prefers empty slots, then slots not holding fragment
/// blocks (open fragment blocks keep being appended to, so throwing
/// them out is the worst choice), then a random slot in the window.
/// Dirty victims are sealed and written out first.
pub struct BlockCache {
    slots: Vec<Slot>,
    window: usize,
}

impl BlockCache {
    pub fn new(cache_size: usize, window: usize, block_size: usize) -> Self {
        let slots = (0..cache_size)
            .map(|_| Slot {
                block: 0,
                used: false,
                dirty: false,
                data: vec![0u8; block_size],
            })
            .collect();
        BlockCache { slots, window }
    }

    fn home(&self, block: u32) -> usize {
        block.wrapping_mul(SLOT_MULTIPLIER) as usize % self.slots.len()
    }

    fn flush_slot(slot: &mut Slot, io: &BlockIo) -> Result<()> {
        if slot.used && slot.dirty {
            format::seal_block(&mut slot.data);
            io.write(slot.block, &slot.data)?;
            slot.dirty = false;
        }
        Ok(())
    }

    /// Picks (and empties) the slot that will hold `block`.
    fn take_slot(&mut self, io: &BlockIo, block: u32) -> Result<usize> {
        let n = self.slots.len();
        let home = self.home(block);
        let mut free: Option<usize> = None;
        let mut nonfrag: Option<usize> = None;
        for k in 0..self.window {
            let i = (home + k) % n;
            let slot = &self.slots[i];
            if slot.used && slot.block == block {
                return Ok(i);
            }
            if !slot.used {
                free.get_or_insert(i);
            } else {
                let tag = format::get_word(&slot.data, 2);
                if tag != format::BLOCK_FRAG && tag != format::BLOCK_FRAG_PROGRESS {
                    nonfrag.get_or_insert(i);
                }
            }
        }
        let i = match free.or(nonfrag) {
            Some(i) => i,
            None => {
                let k = rand::thread_rng().gen_range(0..self.window);
                (home + k) % n
            }
        };
        if self.slots[i].used {
            trace!(
                evicted = self.slots[i].block,
                wanted = block,
                dirty = self.slots[i].dirty,
                "cache slot reuse"
            );
            Self::flush_slot(&mut self.slots[i], io)?;
        }
        let slot = &mut self.slots[i];
        slot.used = false;
        slot.dirty = false;
        slot.block = block;
        Ok(i)
    }

    fn load(&mut self, io: &BlockIo, block: u32) -> Result<usize> {
        let i = self.take_slot(io, block)?;
        if !self.slots[i].used {
            io.read(block, &mut self.slots[i].data)?;
            format::verify_block(&self.slots[i].data, block)?;
            self.slots[i].used = true;
        }
        Ok(i)
    }

    /// Read-through access.
    pub fn get(&mut self, io: &BlockIo, block: u32) -> Result<&[u8]> {
        let i = self.load(io, block)?;
        Ok(&self.slots[i].data)
    }

    /// Read-through access that marks the block dirty.
    pub fn get_mut(&mut self, io: &BlockIo, block: u32) -> Result<&mut [u8]> {
        let i = self.load(io, block)?;
        self.slots[i].dirty = true;
        Ok(&mut self.slots[i].data)
    }

    /// A zeroed, dirty block that is not fetched from disk. Used for
    /// freshly allocated blocks whose on-disk contents are garbage.
    pub fn zero(&mut self, io: &BlockIo, block: u32) -> Result<&mut [u8]> {
        let i = self.take_slot(io, block)?;
        let slot = &mut self.slots[i];
        slot.data.fill(0);
        slot.used = true;
        slot.dirty = true;
        Ok(&mut slot.data)
    }

    /// Drops a block from the cache without writing it.
    pub fn forget(&mut self, block: u32) {
        let n = self.slots.len();
        let home = self.home(block);
        for k in 0..self.window {
            let i = (home + k) % n;
            if self.slots[i].used && self.slots[i].block == block {
                self.slots[i].used = false;
                self.slots[i].dirty = false;
                return;
            }
        }
    }

    /// Writes out every dirty block owned by `txn`.
    pub fn flush_transaction(&mut self, io: &BlockIo, txn: TxnId) -> Result<()> {
        for slot in &mut self.slots {
            if slot.used && slot.dirty && Self::owner(&slot.data) == txn {
                Self::flush_slot(slot, io)?;
            }
        }
        Ok(())
    }

    /// Drops every dirty block owned by `txn` without writing it.
    pub fn cancel_transaction(&mut self, txn: TxnId) {
        for slot in &mut self.slots {
            if slot.used && slot.dirty && Self::owner(&slot.data) == txn {
                slot.used = false;
                slot.dirty = false;
            }
        }
    }

    /// Writes out everything dirty.
    pub fn flush_all(&mut self, io: &BlockIo) -> Result<()> {
        for slot in &mut self.slots {
            Self::flush_slot(slot, io)?;
        }
        Ok(())
    }

    /// Empties the cache; pending writes are discarded.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.used = false;
            slot.dirty = false;
        }
    }

    fn owner(data: &[u8]) -> TxnId {
        TxnId::new(format::get_word(data, 0), format::get_word(data, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{put_word, BLOCK_FRAG};
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    const BS: usize = 256;

    fn io(dir: &TempDir) -> BlockIo {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("blocks.db"))
            .unwrap();
        BlockIo::new(file, BS)
    }

    #[test]
    fn test_read_past_end_is_short() {
        let dir = TempDir::new().unwrap();
        let io = io(&dir);
        let mut buf = vec![0u8; BS];
        assert!(matches!(
            io.read(3, &mut buf),
            Err(Error::ShortRead { block: 3 })
        ));
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let io = io(&dir);
        let mut buf = vec![7u8; BS];
        format::seal_block(&mut buf);
        io.write(2, &buf).unwrap();
        let mut back = vec![0u8; BS];
        io.read(2, &mut back).unwrap();
        assert_eq!(back, buf);
    }

    #[test]
    fn test_cache_write_back_and_read_through() {
        let dir = TempDir::new().unwrap();
        let io = io(&dir);
        let mut cache = BlockCache::new(8, 4, BS);
        {
            let data = cache.zero(&io, 5).unwrap();
            put_word(data, 0, 0);
            put_word(data, 1, 9);
            put_word(data, 2, BLOCK_FRAG);
        }
        cache.flush_all(&io).unwrap();
        // A fresh cache must see the sealed block from disk.
        let mut cache2 = BlockCache::new(8, 4, BS);
        let data = cache2.get(&io, 5).unwrap();
        assert_eq!(format::get_word(data, 2), BLOCK_FRAG);
    }

    #[test]
    fn test_cancel_transaction_discards_dirty_blocks() {
        let dir = TempDir::new().unwrap();
        let io = io(&dir);
        let mut cache = BlockCache::new(8, 4, BS);
        {
            let data = cache.zero(&io, 6).unwrap();
            put_word(data, 0, 0);
            put_word(data, 1, 4);
        }
        cache.cancel_transaction(TxnId::new(0, 4));
        // Nothing was flushed, so the block must not exist on disk.
        let mut buf = vec![0u8; BS];
        assert!(io.read(6, &mut buf).is_err());
    }

    #[test]
    fn test_flush_transaction_only_touches_owner() {
        let dir = TempDir::new().unwrap();
        let io = io(&dir);
        let mut cache = BlockCache::new(8, 4, BS);
        for (block, lsb) in [(1u32, 4u32), (2, 5)] {
            let data = cache.zero(&io, block).unwrap();
            put_word(data, 0, 0);
            put_word(data, 1, lsb);
        }
        cache.flush_transaction(&io, TxnId::new(0, 4)).unwrap();
        let mut buf = vec![0u8; BS];
        io.read(1, &mut buf).unwrap();
        assert!(io.read(2, &mut buf).is_err());
    }

    #[test]
    fn test_corrupt_block_is_detected() {
        let dir = TempDir::new().unwrap();
        let io = io(&dir);
        let mut buf = vec![1u8; BS];
        format::seal_block(&mut buf);
        buf[10] ^= 0xff;
        io.write(4, &buf).unwrap();
        let mut cache = BlockCache::new(8, 4, BS);
        assert!(matches!(
            cache.get(&io, 4),
            Err(Error::ChecksumMismatch { block: 4 })
        ));
    }
}
