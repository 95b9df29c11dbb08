//! The usage sweep that runs before a sync.
//!
//! Transactions never free blocks directly; they log unused-block
//! candidates to the journal. Right before the database state is
//! flushed, this pass reads those candidates back and walks the index
//! to see which of them are still reachable from committed state.
//! Whatever remains unreachable goes back on the freelist.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::database::Database;
use crate::error::{Error, Result};
use crate::format::{self, get_word, ChunkId};
use crate::journal::{self, J_BLOCK_UNUSED};

pub(crate) const USE_UNKNOWN: u32 = 0;
pub(crate) const USE_USED: u32 = 1;
pub(crate) const USE_FREE: u32 = 2;

/// Sparse map of per-(x, y) statuses; absent means unknown. Used both
/// for block usage (key `(block, 0)`) and for checked table keys
/// (key `(table, key)`).
pub(crate) struct StatusList {
    map: HashMap<(u32, u32), u32>,
}

impl StatusList {
    pub(crate) fn new() -> StatusList {
        StatusList {
            map: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, x: u32, y: u32) -> u32 {
        self.map.get(&(x, y)).copied().unwrap_or(USE_UNKNOWN)
    }

    pub(crate) fn set(&mut self, x: u32, y: u32, status: u32) {
        self.map.insert((x, y), status);
    }

    pub(crate) fn mark_used(&mut self, block: u32) {
        self.set(block, 0, USE_USED);
    }

    pub(crate) fn mark_free(&mut self, block: u32) {
        self.set(block, 0, USE_FREE);
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (u32, u32, u32)> + '_ {
        self.map.iter().map(|(&(x, y), &s)| (x, y, s))
    }
}

impl Database {
    /// Reads every unused-block candidate out of the journal and frees
    /// the ones no committed key still reaches.
    pub(crate) fn check_usage(&mut self) -> Result<()> {
        let mut usage = StatusList::new();
        let mut checked = StatusList::new();
        let readback = self.cfg.journal_readback;
        let mut pos = 0u64;
        let mut candidates = 0usize;
        loop {
            let batch = match &mut self.journal {
                Some(j) => j.read_batch(pos, readback)?,
                None => return Err(Error::ReadOnly),
            };
            if batch.is_empty() {
                break;
            }
            pos += (batch.len() * journal::ENTRY_SIZE) as u64;
            for entry in batch {
                if entry.kind != J_BLOCK_UNUSED {
                    continue;
                }
                candidates += 1;
                let block = entry.a;
                if usage.get(block, 0) == USE_UNKNOWN {
                    self.status_check_block(&mut usage, &mut checked, block)?;
                }
            }
        }
        debug!(candidates, "usage sweep done");
        Ok(())
    }

    /// Decides the fate of one candidate block: collect the keys its
    /// chunks belong to, mark everything those keys still reach as
    /// used, and free the block if nothing reached it.
    fn status_check_block(
        &mut self,
        usage: &mut StatusList,
        checked: &mut StatusList,
        block: u32,
    ) -> Result<()> {
        if block > self.last_used {
            return Ok(());
        }
        let geo = self.geo;
        let (table_id, keys, cont) = match self.cache.get(&self.io, block) {
            Err(Error::ChecksumMismatch { .. }) | Err(Error::ShortRead { .. }) => {
                // a block a crashed transaction never finished writing
                trace!(block, "unreadable candidate freed");
                self.cache.forget(block);
                self.freelist_push(block)?;
                usage.mark_free(block);
                return Ok(());
            }
            Err(e) => return Err(e),
            Ok(data) => {
                let table_id = get_word(data, 3);
                match get_word(data, 2) {
                    format::BLOCK_BIG => (
                        table_id,
                        vec![get_word(data, 6)],
                        ChunkId::from_raw(get_word(data, 4)),
                    ),
                    format::BLOCK_FRAG => {
                        let mut keys = Vec::new();
                        for slot in 1..=geo.max_frags() {
                            let start = get_word(data, 3 + slot as usize) as usize;
                            let end = get_word(data, 4 + slot as usize);
                            if end == 0 {
                                break;
                            }
                            let key = get_word(data, start / 4 + 1);
                            if keys.last() != Some(&key) {
                                keys.push(key);
                            }
                        }
                        (table_id, keys, ChunkId::NONE)
                    }
                    format::BLOCK_FRAG_PROGRESS | format::BLOCK_FREELIST => {
                        // never sealed, or a stale freelist container
                        self.freelist_push(block)?;
                        usage.mark_free(block);
                        return Ok(());
                    }
                    found => {
                        return Err(Error::WrongBlockType { block, found });
                    }
                }
            }
        };

        for key in keys {
            if checked.get(table_id, key) == USE_USED {
                continue;
            }
            checked.set(table_id, key, USE_USED);
            self.tables_mark_use(table_id, key, usage)?;
        }

        if usage.get(block, 0) != USE_UNKNOWN {
            return Ok(());
        }
        self.freelist_push(block)?;
        usage.mark_free(block);

        // a freed chained cell head drags its continuation chain along
        let mut cont = cont;
        while !cont.is_none() {
            let b = geo.chunk_block(cont);
            if !geo.is_big(cont) {
                if usage.get(b, 0) == USE_UNKNOWN {
                    return self.status_check_block(usage, checked, b);
                }
                return Ok(());
            }
            let next = match self.cache.get(&self.io, b) {
                Ok(data) => ChunkId::from_raw(get_word(data, 4)),
                Err(_) => return Ok(()),
            };
            if usage.get(b, 0) == USE_UNKNOWN {
                self.freelist_push(b)?;
                usage.mark_free(b);
            }
            cont = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_list_defaults_unknown() {
        let mut list = StatusList::new();
        assert_eq!(list.get(7, 0), USE_UNKNOWN);
        list.mark_used(7);
        assert_eq!(list.get(7, 0), USE_USED);
        list.mark_free(9);
        assert_eq!(list.get(9, 0), USE_FREE);
        assert_eq!(list.get(7, 1), USE_UNKNOWN);
    }
}
