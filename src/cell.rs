//! Cell storage: one key/value pair as stored on disk.
//!
//! A cell chunk starts with three words (tag, key, total length)
//! followed by value bytes. Values that do not fit in one chunk
//! continue in continuation chunks (tag, key, bytes); the chain link
//! lives in word 4 of the big block holding each piece, so every piece
//! except the last occupies a whole big block. The last piece, or a
//! cell small enough in the first place, goes into a fragment.
//!
//! Chains are written tail first so each piece can point at an
//! already-allocated successor.

use tracing::trace;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::format::{
    self, get_word, put_word, ChunkId, CELL_OVERHEAD, CONT_OVERHEAD,
};
use crate::transaction::Transaction;

impl Database {
    /// Allocates a big block for `txn` with its chain link set.
    fn big_new(&mut self, txn: &mut Transaction, table_id: u32, next: ChunkId) -> Result<u32> {
        let block = self.tr_new_block(txn)?;
        let data = self.cache.zero(&self.io, block)?;
        put_word(data, 0, txn.id.msb);
        put_word(data, 1, txn.id.lsb);
        put_word(data, 2, format::BLOCK_BIG);
        put_word(data, 3, table_id);
        put_word(data, 4, next.raw());
        Ok(block)
    }

    /// Stores `value` under `key` and returns the head chunk.
    pub(crate) fn cell_write(
        &mut self,
        txn: &mut Transaction,
        table_id: u32,
        key: u32,
        value: &[u8],
    ) -> Result<ChunkId> {
        let len = value.len();
        let threshold = self.geo.big_threshold();

        if len + CELL_OVERHEAD < threshold {
            let chunk = self.frag_new(txn, table_id, len + CELL_OVERHEAD)?;
            let data = self.frag_get_mut(txn.id, chunk)?;
            put_word(data, 0, format::CHUNK_CELL);
            put_word(data, 1, key);
            put_word(data, 2, len as u32);
            data[CELL_OVERHEAD..CELL_OVERHEAD + len].copy_from_slice(value);
            return Ok(chunk);
        }

        // Value bytes each continuation piece carries; the head piece
        // carries four fewer for its longer header.
        let dib = self.geo.data_in_big() - CONT_OVERHEAD;
        let mut k = (len + CELL_OVERHEAD - CONT_OVERHEAD - 1) / dib;
        let mut next = ChunkId::NONE;

        trace!(table_id, key, len, pieces = k + 1, "chained cell");

        loop {
            let (start, cap) = if k == 0 {
                (0, dib - (CELL_OVERHEAD - CONT_OVERHEAD))
            } else {
                (k * dib - (CELL_OVERHEAD - CONT_OVERHEAD), dib)
            };
            let piece = cap.min(len - start);

            let (chunk, head_room) = if piece < threshold {
                (
                    self.frag_new(txn, table_id, piece + CELL_OVERHEAD)?,
                    false,
                )
            } else {
                let block = self.big_new(txn, table_id, next)?;
                (self.geo.chunk(block, 0), true)
            };

            let data: &mut [u8] = if head_room {
                let block = self.geo.chunk_block(chunk);
                let data = self.cache.get_mut(&self.io, block)?;
                &mut data[20..]
            } else {
                self.frag_get_mut(txn.id, chunk)?
            };

            if k == 0 {
                put_word(data, 0, format::CHUNK_CELL);
                put_word(data, 1, key);
                put_word(data, 2, len as u32);
                data[CELL_OVERHEAD..CELL_OVERHEAD + piece]
                    .copy_from_slice(&value[start..start + piece]);
                return Ok(chunk);
            }
            put_word(data, 0, format::CHUNK_CONT);
            put_word(data, 1, key);
            data[CONT_OVERHEAD..CONT_OVERHEAD + piece]
                .copy_from_slice(&value[start..start + piece]);

            next = chunk;
            k -= 1;
        }
    }

    /// Reads one chain piece: its chunk bytes and the next link.
    fn cell_piece(&mut self, id: ChunkId) -> Result<(Vec<u8>, ChunkId)> {
        if self.geo.is_big(id) {
            let block = self.geo.chunk_block(id);
            let data = self.cache.get(&self.io, block)?;
            if get_word(data, 2) != format::BLOCK_BIG {
                return Err(Error::WrongBlockType {
                    block,
                    found: get_word(data, 2),
                });
            }
            let next = ChunkId::from_raw(get_word(data, 4));
            let end = 20 + self.geo.data_in_big();
            Ok((data[20..end].to_vec(), next))
        } else {
            Ok((self.frag_read(id)?, ChunkId::NONE))
        }
    }

    /// Key and value length of the cell at `chunk`.
    pub(crate) fn cell_info(&mut self, chunk: ChunkId) -> Result<(u32, usize)> {
        let (data, _) = self.cell_piece(chunk)?;
        if get_word(&data, 0) != format::CHUNK_CELL {
            return Err(Error::WrongChunkType {
                chunk: chunk.raw(),
                found: get_word(&data, 0),
            });
        }
        Ok((get_word(&data, 1), get_word(&data, 2) as usize))
    }

    /// Reads a whole cell: its key and value.
    pub(crate) fn cell_get(&mut self, chunk: ChunkId) -> Result<(u32, Vec<u8>)> {
        let (key, len) = self.cell_info(chunk)?;
        let mut value = Vec::with_capacity(len);
        let mut id = chunk;
        let mut first = true;
        while value.len() < len || first {
            let (data, next) = self.cell_piece(id)?;
            let expect = if first {
                format::CHUNK_CELL
            } else {
                format::CHUNK_CONT
            };
            if get_word(&data, 0) != expect {
                return Err(Error::WrongChunkType {
                    chunk: id.raw(),
                    found: get_word(&data, 0),
                });
            }
            let overhead = if first { CELL_OVERHEAD } else { CONT_OVERHEAD };
            first = false;
            let take = (data.len() - overhead).min(len - value.len());
            value.extend_from_slice(&data[overhead..overhead + take]);
            if value.len() == len {
                break;
            }
            if next.is_none() {
                return Err(Error::TruncatedCell { chunk: chunk.raw() });
            }
            id = next;
        }
        Ok((key, value))
    }
}
