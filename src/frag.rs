//! Fragment allocation.
//!
//! Small chunks share blocks. A fragment block carries the common
//! header, then an offset table of `max_frags + 1` words: word `3 + s`
//! is the byte offset where slot `s` starts and word `4 + s` where it
//! ends, so slots are allocated strictly left to right and a zero
//! offset means the slot was never filled.
//!
//! While a transaction is still filling a block it is tagged
//! `BLOCK_FRAG_PROGRESS`; commit retags it `BLOCK_FRAG`. Recovery uses
//! that distinction to throw away half-filled blocks of rolled-back
//! transactions. Each transaction keeps a small set of open fragment
//! blocks and places new chunks best-fit; when the set is full the
//! fullest block is sealed to make room.

use tracing::trace;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::format::{self, get_word, put_word, ChunkId, Geometry, TxnId};
use crate::transaction::Transaction;

/// A fragment block a transaction is still appending to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpenFrag {
    pub(crate) block: u32,
    pub(crate) free_bytes: usize,
    pub(crate) next_slot: u32,
    pub(crate) table_id: u32,
}

fn bounds(geo: &Geometry, data: &[u8], chunk: ChunkId) -> Result<(usize, usize)> {
    let slot = geo.chunk_slot(chunk) as usize;
    let start = get_word(data, 3 + slot) as usize;
    let end = get_word(data, 4 + slot) as usize;
    if slot == 0 || start == 0 || end == 0 || end < start || end > geo.block_size - 4 {
        return Err(Error::IllegalChunkId { chunk: chunk.raw() });
    }
    Ok((start, end))
}

fn check_tag(data: &[u8], block: u32) -> Result<()> {
    let tag = get_word(data, 2);
    if tag != format::BLOCK_FRAG && tag != format::BLOCK_FRAG_PROGRESS {
        return Err(Error::WrongBlockType { block, found: tag });
    }
    Ok(())
}

impl Database {
    /// Copies a fragment out of its block.
    pub(crate) fn frag_read(&mut self, chunk: ChunkId) -> Result<Vec<u8>> {
        let geo = self.geo;
        let block = geo.chunk_block(chunk);
        let data = self.cache.get(&self.io, block)?;
        check_tag(data, block)?;
        let (start, end) = bounds(&geo, data, chunk)?;
        Ok(data[start..end].to_vec())
    }

    /// Copies a fragment and reports which transaction owns its block.
    pub(crate) fn frag_read_owned(&mut self, chunk: ChunkId) -> Result<(Vec<u8>, TxnId)> {
        let geo = self.geo;
        let block = geo.chunk_block(chunk);
        let data = self.cache.get(&self.io, block)?;
        check_tag(data, block)?;
        let (start, end) = bounds(&geo, data, chunk)?;
        let owner = TxnId::new(get_word(data, 0), get_word(data, 1));
        Ok((data[start..end].to_vec(), owner))
    }

    /// Writable access to a fragment. The block must belong to the
    /// calling transaction; fragments of committed blocks are only
    /// replaced, never edited.
    pub(crate) fn frag_get_mut(&mut self, txn_id: TxnId, chunk: ChunkId) -> Result<&mut [u8]> {
        let geo = self.geo;
        let block = geo.chunk_block(chunk);
        let data = self.cache.get_mut(&self.io, block)?;
        check_tag(data, block)?;
        debug_assert_eq!(
            TxnId::new(get_word(data, 0), get_word(data, 1)),
            txn_id,
            "fragment block {} is not owned by the writing transaction",
            block
        );
        let (start, end) = bounds(&geo, data, chunk)?;
        Ok(&mut data[start..end])
    }

    /// Allocates a fragment of `len` bytes for `txn`, reusing one of
    /// its open blocks when the chunk fits.
    pub(crate) fn frag_new(
        &mut self,
        txn: &mut Transaction,
        table_id: u32,
        len: usize,
    ) -> Result<ChunkId> {
        let len = (len + 3) & !3;
        let geo = self.geo;

        let mut best: Option<usize> = None;
        let mut best_left = i64::MAX;
        let mut worst = 0;
        let mut worst_left = i64::MAX;
        for (i, ff) in txn.frags.iter().enumerate() {
            let left = ff.free_bytes as i64 - len as i64;
            if ff.table_id == table_id && left >= 0 && left < best_left {
                best_left = left;
                best = Some(i);
            }
            if left < worst_left {
                worst_left = left;
                worst = i;
            }
        }

        let i = match best {
            Some(i) => i,
            None => {
                let block = self.tr_new_block(txn)?;
                {
                    let data = self.cache.zero(&self.io, block)?;
                    put_word(data, 0, txn.id.msb);
                    put_word(data, 1, txn.id.lsb);
                    put_word(data, 2, format::BLOCK_FRAG_PROGRESS);
                    put_word(data, 3, table_id);
                    put_word(data, 4, geo.frag_data_start() as u32);
                }
                trace!(block, table_id, "new fragment block");
                let i = if txn.frags.len() < self.cfg.max_open_frag_blocks {
                    txn.frags.push(OpenFrag {
                        block,
                        free_bytes: 0,
                        next_slot: 1,
                        table_id,
                    });
                    txn.frags.len() - 1
                } else {
                    let sealed = txn.frags[worst].block;
                    self.frag_finish(sealed)?;
                    worst
                };
                txn.frags[i] = OpenFrag {
                    block,
                    free_bytes: geo.frag_free_bytes(),
                    next_slot: 1,
                    table_id,
                };
                i
            }
        };

        let ff = txn.frags[i];
        let slot = ff.next_slot as usize;
        let data = self.cache.get_mut(&self.io, ff.block)?;
        debug_assert_eq!(
            TxnId::new(get_word(data, 0), get_word(data, 1)),
            txn.id,
            "open fragment block {} is not ours",
            ff.block
        );
        let start = get_word(data, 3 + slot);
        if start == 0 {
            return Err(Error::IllegalChunkId {
                chunk: geo.chunk(ff.block, slot as u32).raw(),
            });
        }
        put_word(data, 4 + slot, start + len as u32);

        let ff = &mut txn.frags[i];
        ff.free_bytes -= len.min(ff.free_bytes);
        ff.next_slot += 1;
        if ff.next_slot > geo.max_frags() {
            // out of slots; make sure it gets sealed, not reused
            ff.free_bytes = 0;
        }
        Ok(geo.chunk(ff.block, slot as u32))
    }

    /// Retags a fragment block as complete.
    pub(crate) fn frag_finish(&mut self, block: u32) -> Result<()> {
        let data = self.cache.get_mut(&self.io, block)?;
        put_word(data, 2, format::BLOCK_FRAG);
        Ok(())
    }

    /// Seals every open fragment block of `txn`. Part of commit.
    pub(crate) fn frag_close(&mut self, txn: &mut Transaction) -> Result<()> {
        let blocks: Vec<u32> = txn.frags.iter().map(|f| f.block).collect();
        for block in blocks {
            self.frag_finish(block)?;
        }
        txn.frags.clear();
        Ok(())
    }
}
