//! Free block accounting.
//!
//! Free blocks live in two places: an on-disk chain of freelist blocks
//! headed by the superblock, and two in-memory lists. The "old" list
//! holds entries popped off the disk chain; the "new" list collects
//! blocks freed since the last sync. Keeping frees out of the on-disk
//! chain until sync means a crash can never lose a block to a
//! half-updated chain: recovery re-derives frees from the journal.

use tracing::trace;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::format::{self, get_word, put_word};

pub(crate) struct FreeList {
    /// Head of the on-disk chain, as in the superblock.
    pub(crate) next: u32,
    /// Entries from the most recently loaded chain block.
    pub(crate) old: Vec<u32>,
    /// Blocks freed since the last sync, ascending.
    pub(crate) new_entries: Vec<u32>,
    /// Head of the chain of flushed new-list blocks.
    pub(crate) new_next: u32,
    /// First flushed new-list block; the tail that gets stitched onto
    /// the remaining old chain at sync.
    pub(crate) new_last: u32,
}

impl FreeList {
    pub(crate) fn new(next: u32) -> Self {
        FreeList {
            next,
            old: Vec::new(),
            new_entries: Vec::new(),
            new_next: 0,
            new_last: 0,
        }
    }
}

/// Keeps `list` ascending so freed neighbours end up adjacent and
/// later allocations line up on disk.
pub(crate) fn insert_sorted(list: &mut Vec<u32>, block: u32) {
    let pos = list.partition_point(|&b| b < block);
    list.insert(pos, block);
}

impl Database {
    /// Entries a freelist block can hold besides its six header words.
    pub(crate) fn freelist_capacity(&self) -> usize {
        self.geo.words() - 6
    }

    /// Takes one free block: from the old list, then from the disk
    /// chain, then by growing the file (skipping superblock indices).
    pub(crate) fn freelist_pop(&mut self) -> Result<u32> {
        if let Some(block) = self.free.old.pop() {
            return Ok(block);
        }
        if self.free.next == 0 {
            loop {
                self.last_used += 1;
                if !format::is_superblock(self.last_used) {
                    trace!(block = self.last_used, "extending file");
                    return Ok(self.last_used);
                }
            }
        }
        let head = self.free.next;
        let (next, entries) = {
            let data = self.cache.get(&self.io, head)?;
            if get_word(data, 0) != format::MAGIC {
                return Err(Error::WrongBlockType {
                    block: head,
                    found: get_word(data, 0),
                });
            }
            if get_word(data, 2) != format::BLOCK_FREELIST {
                return Err(Error::WrongBlockType {
                    block: head,
                    found: get_word(data, 2),
                });
            }
            let n = get_word(data, 4) as usize;
            let entries: Vec<u32> = (0..n).map(|i| get_word(data, 5 + i)).collect();
            (get_word(data, 3), entries)
        };
        self.free.next = next;
        self.free.old = entries;
        // the chain block itself is free now
        self.freelist_push(head)?;
        self.freelist_pop()
    }

    /// Records `block` as free, spilling the new list to disk when full.
    pub(crate) fn freelist_push(&mut self, block: u32) -> Result<()> {
        if self.free.new_entries.len() == self.freelist_capacity() {
            let spill = self.freelist_pop()?;
            self.freelist_flush_new(spill)?;
        }
        insert_sorted(&mut self.free.new_entries, block);
        Ok(())
    }

    /// Writes the new list into `block` and chains it in front of the
    /// previously flushed ones.
    fn freelist_flush_new(&mut self, block: u32) -> Result<()> {
        let entries = std::mem::take(&mut self.free.new_entries);
        let next = self.free.new_next;
        let data = self.cache.zero(&self.io, block)?;
        put_word(data, 0, format::MAGIC);
        put_word(data, 1, format::FREELIST_VERSION);
        put_word(data, 2, format::BLOCK_FREELIST);
        put_word(data, 3, next);
        put_word(data, 4, entries.len() as u32);
        for (i, b) in entries.iter().enumerate() {
            put_word(data, 5 + i, *b);
        }
        self.free.new_next = block;
        if self.free.new_last == 0 {
            self.free.new_last = block;
        }
        Ok(())
    }

    /// Merges the new list into the on-disk chain. Idempotent: syncing
    /// with nothing freed leaves the chain untouched.
    pub(crate) fn freelist_sync(&mut self) -> Result<()> {
        // Break the fixed point where every sync would rewrite the
        // same blocks over and over.
        if !self.free.old.is_empty()
            && self.free.new_entries.len() == self.freelist_capacity() - (self.free.old.len() - 1)
        {
            let b = self.freelist_pop()?;
            self.freelist_push(b)?;
        }

        if !self.free.old.is_empty() || !self.free.new_entries.is_empty() {
            // Drain the old in-memory list into the new one, keeping
            // the last popped block as the spare to flush into.
            let spare = loop {
                let b = self.freelist_pop()?;
                if self.free.old.is_empty() {
                    break b;
                }
                self.freelist_push(b)?;
            };
            self.freelist_flush_new(spare)?;
        }

        if self.free.next != 0 {
            if self.free.new_last != 0 {
                // stitch the remaining old chain after the new one
                let last = self.free.new_last;
                let next = self.free.next;
                let data = self.cache.get_mut(&self.io, last)?;
                put_word(data, 3, next);
            } else {
                self.free.new_next = self.free.next;
            }
        }

        self.free.next = self.free.new_next;
        self.free.new_next = 0;
        self.free.new_last = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sorted_keeps_order() {
        let mut list = Vec::new();
        for b in [9u32, 3, 7, 3, 1, 100] {
            insert_sorted(&mut list, b);
        }
        assert_eq!(list, vec![1, 3, 3, 7, 9, 100]);
        // pop from the end takes the highest block first
        assert_eq!(list.pop(), Some(100));
    }
}
