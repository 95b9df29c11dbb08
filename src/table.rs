//! The table directory and the key/value operations on tables.
//!
//! Table id 0 is the master directory: a hashtrie mapping table ids to
//! small `root` record cells (tag, table id, table root, table type).
//! Every other table hangs off its record. Transactions carry their
//! own copy-on-write directory root, so committing a transaction means
//! merging its directory into the committed one table by table.

use tracing::{debug, trace};

use crate::database::Database;
use crate::error::{Error, Result};
use crate::format::{self, get_word, put_word, ChunkId, MASTER_TABLE_ID, TABLE_HASHKEY};
use crate::journal::J_DEPEND;
use crate::transaction::Transaction;
use crate::usage::StatusList;

/// Root records are four words: tag, table id, root chunk, type.
const ROOT_RECORD_SIZE: usize = 16;

/// How many directory entries one resolve batch pulls.
const RESOLVE_BATCH: usize = 16;

/// What a table stores: plain 32-bit keys or hashed string keys. The
/// directory itself is the only `Master` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    Hash,
    StringKey,
    Master,
}

impl TableType {
    pub(crate) fn from_raw(table: u32, raw: u32) -> Result<TableType> {
        match raw {
            format::TABLE_HASHKEY => Ok(TableType::Hash),
            format::TABLE_STRINGKEY => Ok(TableType::StringKey),
            format::TABLE_MASTER => Ok(TableType::Master),
            _ => Err(Error::WrongTableType { table }),
        }
    }
}

/// One batch of a table scan, in trie order. Feed `continuation()`
/// back into the next scan call to resume where this one stopped.
#[derive(Debug)]
pub struct ScanResult {
    pub tuples: Vec<(u32, Vec<u8>)>,
}

impl ScanResult {
    pub fn continuation(&self) -> Option<u32> {
        self.tuples.last().map(|t| t.0)
    }

    /// Rebuilds a resumption point from a bare continuation key, for
    /// callers that persist it between scan batches.
    pub fn continued_from(key: u32) -> ScanResult {
        ScanResult {
            tuples: vec![(key, Vec::new())],
        }
    }
}

impl Database {
    /// Reads a table's root record out of the given directory root.
    fn table_get_root(&mut self, tables: ChunkId, table: u32) -> Result<(ChunkId, u32)> {
        if table == MASTER_TABLE_ID {
            return Err(Error::NoSuchTable { table });
        }
        let cell = self.hashtrie_find(MASTER_TABLE_ID, tables, table)?;
        if cell.is_none() {
            return Err(Error::NoSuchTable { table });
        }
        let data = self.frag_read(cell)?;
        if data.len() < ROOT_RECORD_SIZE {
            return Err(Error::WrongChunkType {
                chunk: cell.raw(),
                found: 0,
            });
        }
        if get_word(&data, 0) != format::CHUNK_ROOT {
            return Err(Error::WrongChunkType {
                chunk: cell.raw(),
                found: get_word(&data, 0),
            });
        }
        Ok((ChunkId::from_raw(get_word(&data, 2)), get_word(&data, 3)))
    }

    /// Committed-state root and type of a table, with a one-entry
    /// cache keyed on the last committed transaction.
    pub(crate) fn db_table_get_root(&mut self, table: u32) -> Result<(ChunkId, u32)> {
        if self.flags.read_only {
            self.readonly_refresh()?;
        }
        if let Some((at, id, root, ty)) = self.table_cache {
            if at == self.last_committed && id == table {
                return Ok((root, ty));
            }
        }
        let (root, ty) = self.table_get_root(self.tables, table)?;
        self.table_cache = Some((self.last_committed, table, root, ty));
        Ok((root, ty))
    }

    /// Same, but through a transaction's private directory.
    pub(crate) fn tr_table_get_root(
        &mut self,
        txn: &mut Transaction,
        table: u32,
    ) -> Result<(ChunkId, u32)> {
        if txn.cache_last_committed == self.last_committed && txn.cache_table_id == table {
            return Ok((txn.cache_table_root, txn.cache_table_type));
        }
        let (root, ty) = self.table_get_root(txn.tables, table)?;
        txn.cache_last_committed = self.last_committed;
        txn.cache_table_id = table;
        txn.cache_table_root = root;
        txn.cache_table_type = ty;
        Ok((root, ty))
    }

    /// Points a table's record at a new root, copying the record into
    /// our ownership first if a committed block still holds it.
    pub(crate) fn table_write_root(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        new_root: ChunkId,
    ) -> Result<()> {
        let (cell, owner) = self.hashtrie_find_owned(MASTER_TABLE_ID, txn.tables, table)?;
        if cell.is_none() {
            return Err(Error::NoSuchTable { table });
        }
        if owner == txn.id {
            let data = self.frag_get_mut(txn.id, cell)?;
            put_word(data, 2, new_root.raw());
            return Ok(());
        }
        let old = self.frag_read(cell)?;
        let ty = get_word(&old, 3);
        self.tr_unused(txn, self.geo.chunk_block(cell))?;
        let fresh = self.frag_new(txn, MASTER_TABLE_ID, ROOT_RECORD_SIZE)?;
        {
            let data = self.frag_get_mut(txn.id, fresh)?;
            put_word(data, 0, format::CHUNK_ROOT);
            put_word(data, 1, table);
            put_word(data, 2, new_root.raw());
            put_word(data, 3, ty);
        }
        let (tables, _, _) =
            self.hashtrie_write(txn, MASTER_TABLE_ID, txn.tables, table, fresh)?;
        txn.tables = tables;
        Ok(())
    }

    pub(crate) fn low_table_new(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        table_type: u32,
    ) -> Result<()> {
        self.check_writable()?;
        self.check_txn_open(txn)?;
        if table == MASTER_TABLE_ID {
            return Err(Error::TableExists { table });
        }
        let existing = self.hashtrie_find(MASTER_TABLE_ID, txn.tables, table)?;
        if !existing.is_none() {
            return Err(Error::TableExists { table });
        }
        let cell = self.frag_new(txn, MASTER_TABLE_ID, ROOT_RECORD_SIZE)?;
        {
            let data = self.frag_get_mut(txn.id, cell)?;
            put_word(data, 0, format::CHUNK_ROOT);
            put_word(data, 1, table);
            put_word(data, 2, 0);
            put_word(data, 3, table_type);
        }
        let (tables, _, _) = self.hashtrie_write(txn, MASTER_TABLE_ID, txn.tables, table, cell)?;
        txn.tables = tables;
        txn.dependencies = true;
        // the dependency is on the table NOT having existed
        self.tr_log(txn, J_DEPEND, 0, table, 0)?;
        debug!(table, "table created");
        Ok(())
    }

    /// Creates a plain hash-keyed table.
    pub fn create_table(&mut self, txn: &mut Transaction, table: u32) -> Result<()> {
        self.low_table_new(txn, table, TABLE_HASHKEY)
    }

    fn table_delete_root(&mut self, txn: &mut Transaction, table: u32) -> Result<()> {
        let cell = self.hashtrie_find(MASTER_TABLE_ID, txn.tables, table)?;
        if cell.is_none() {
            return Err(Error::NoSuchTable { table });
        }
        let (tables, _, _) =
            self.hashtrie_write(txn, MASTER_TABLE_ID, txn.tables, table, ChunkId::NONE)?;
        txn.tables = tables;
        txn.dependencies = true;
        self.tr_log(txn, J_DEPEND, 0, table, cell.raw())
    }

    /// Drops a table and everything in it.
    pub fn delete_table(&mut self, txn: &mut Transaction, table: u32) -> Result<()> {
        self.check_writable()?;
        self.check_txn_open(txn)?;
        let (root, _) = self.tr_table_get_root(txn, table)?;
        self.hashtrie_free_all(txn, root)?;
        self.table_delete_root(txn, table)?;
        if txn.cache_table_id == table {
            txn.cache_table_id = MASTER_TABLE_ID;
        }
        debug!(table, "table deleted");
        Ok(())
    }

    /// Records that this transaction read the table without touching
    /// any key in it, so commits that change it will conflict with us.
    pub fn depend_table(&mut self, txn: &mut Transaction, table: u32) -> Result<()> {
        self.check_writable()?;
        self.check_txn_open(txn)?;
        let cell = self.hashtrie_find(MASTER_TABLE_ID, txn.tables, table)?;
        txn.dependencies = true;
        self.tr_log(txn, J_DEPEND, 0, table, cell.raw())
    }

    pub(crate) fn low_key_store(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        key: u32,
        value: Option<&[u8]>,
        required_type: u32,
    ) -> Result<()> {
        self.check_writable()?;
        self.check_txn_open(txn)?;
        let (root, ty) = self.tr_table_get_root(txn, table)?;
        if ty != required_type {
            return Err(Error::WrongTableType { table });
        }
        let cell = match value {
            Some(v) => self.cell_write(txn, table, key, v)?,
            None => ChunkId::NONE,
        };
        let (new_root, old_cell, old_is_mine) =
            self.hashtrie_write(txn, table, root, key, cell)?;
        if new_root != root {
            self.table_write_root(txn, table, new_root)?;
        }
        txn.cache_last_committed = self.last_committed;
        txn.cache_table_id = table;
        txn.cache_table_root = new_root;
        txn.cache_table_type = ty;
        if !old_is_mine {
            let kind = if value.is_some() {
                crate::journal::J_WROTE
            } else {
                crate::journal::J_DELETE
            };
            self.tr_log(txn, kind, table, key, old_cell.raw())?;
        }
        trace!(table, key, delete = value.is_none(), "key stored");
        Ok(())
    }

    pub(crate) fn low_key_lookup(
        &mut self,
        table: u32,
        root: ChunkId,
        key: u32,
    ) -> Result<Option<Vec<u8>>> {
        let cell = self.hashtrie_find(table, root, key)?;
        if cell.is_none() {
            return Ok(None);
        }
        let (_, value) = self.cell_get(cell)?;
        Ok(Some(value))
    }

    /// Stores `value` under `key` within the transaction.
    pub fn key_store(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        key: u32,
        value: &[u8],
    ) -> Result<()> {
        self.low_key_store(txn, table, key, Some(value), TABLE_HASHKEY)
    }

    /// Deletes `key` within the transaction. Deleting an absent key is
    /// a no-op, not an error.
    pub fn key_delete(&mut self, txn: &mut Transaction, table: u32, key: u32) -> Result<()> {
        self.low_key_store(txn, table, key, None, TABLE_HASHKEY)
    }

    /// Reads `key` from committed state, ignoring open transactions.
    pub fn key_lookup(&mut self, table: u32, key: u32) -> Result<Option<Vec<u8>>> {
        let (root, ty) = self.db_table_get_root(table)?;
        if ty != TABLE_HASHKEY {
            return Err(Error::WrongTableType { table });
        }
        self.low_key_lookup(table, root, key)
    }

    /// Reads `key` as the transaction sees it, its own writes included.
    pub fn txn_key_lookup(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        key: u32,
    ) -> Result<Option<Vec<u8>>> {
        self.check_txn_open(txn)?;
        let (root, ty) = self.tr_table_get_root(txn, table)?;
        if ty != TABLE_HASHKEY {
            return Err(Error::WrongTableType { table });
        }
        self.low_key_lookup(table, root, key)
    }

    /// First key not in use, counting up from `start`. `u32::MAX`
    /// means every key from `start` up is taken.
    pub fn find_first_unused(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        start: u32,
    ) -> Result<u32> {
        let (root, _) = self.tr_table_get_root(txn, table)?;
        self.hashtrie_find_no_key(table, root, start)
    }

    /// First table id not in use, counting up from `start` (clamped
    /// to 1; 0 is the directory).
    pub fn find_first_unused_table(&mut self, txn: &mut Transaction, start: u32) -> Result<u32> {
        let start = start.max(1);
        self.hashtrie_find_no_key(MASTER_TABLE_ID, txn.tables, start)
    }

    pub fn get_table_type(&mut self, table: u32) -> Result<TableType> {
        if table == MASTER_TABLE_ID {
            return Ok(TableType::Master);
        }
        let (_, ty) = self.db_table_get_root(table)?;
        TableType::from_raw(table, ty)
    }

    pub fn txn_get_table_type(
        &mut self,
        txn: &mut Transaction,
        table: u32,
    ) -> Result<TableType> {
        if table == MASTER_TABLE_ID {
            return Ok(TableType::Master);
        }
        let (_, ty) = self.tr_table_get_root(txn, table)?;
        TableType::from_raw(table, ty)
    }

    pub(crate) fn low_table_scan(
        &mut self,
        table: u32,
        root: ChunkId,
        n: usize,
        after: Option<u32>,
    ) -> Result<Option<ScanResult>> {
        let found = self.hashtrie_scan(table, root, after, None, n)?;
        if found.is_empty() {
            return Ok(None);
        }
        let mut tuples = Vec::with_capacity(found.len());
        for (key, chunk) in found {
            let (_, value) = self.cell_get(chunk)?;
            tuples.push((key, value));
        }
        Ok(Some(ScanResult { tuples }))
    }

    /// Scans up to `n` keys of committed state in trie order; `after`
    /// resumes from a previous batch's continuation. `None` marks the
    /// end of the table.
    pub fn table_scan(
        &mut self,
        table: u32,
        n: usize,
        after: Option<u32>,
    ) -> Result<Option<ScanResult>> {
        let (root, ty) = self.db_table_get_root(table)?;
        if ty != TABLE_HASHKEY {
            return Err(Error::WrongTableType { table });
        }
        self.low_table_scan(table, root, n, after)
    }

    /// Scans as the transaction sees the table.
    pub fn txn_table_scan(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        n: usize,
        after: Option<u32>,
    ) -> Result<Option<ScanResult>> {
        self.check_txn_open(txn)?;
        let (root, ty) = self.tr_table_get_root(txn, table)?;
        if ty != TABLE_HASHKEY {
            return Err(Error::WrongTableType { table });
        }
        self.low_table_scan(table, root, n, after)
    }

    /// Merges the transaction's directory into committed state: first
    /// the directory trie itself, then the root of every table the
    /// transaction touched.
    pub(crate) fn tables_resolve(&mut self, txn: &mut Transaction) -> Result<()> {
        let merged = self.hashtrie_resolve(txn, MASTER_TABLE_ID, txn.tables, self.tables)?;
        txn.tables = merged;
        let mut after: Option<u32> = None;
        loop {
            let batch = self.hashtrie_scan(
                MASTER_TABLE_ID,
                txn.tables,
                after,
                Some(txn.id),
                RESOLVE_BATCH,
            )?;
            if batch.is_empty() {
                return Ok(());
            }
            after = batch.last().map(|t| t.0);
            let done = batch.len() < RESOLVE_BATCH;
            for (table, cell) in batch {
                let old_cell = self.hashtrie_find(MASTER_TABLE_ID, self.tables, table)?;
                if !old_cell.is_none() {
                    self.tr_unused(txn, self.geo.chunk_block(old_cell))?;
                }
                let old_root = match self.db_table_get_root(table) {
                    Ok((root, _)) => root,
                    Err(Error::NoSuchTable { .. }) => ChunkId::NONE,
                    Err(e) => return Err(e),
                };
                let record = self.frag_read(cell)?;
                if get_word(&record, 0) != format::CHUNK_ROOT {
                    return Err(Error::WrongChunkType {
                        chunk: cell.raw(),
                        found: get_word(&record, 0),
                    });
                }
                let my_root = ChunkId::from_raw(get_word(&record, 2));
                let new_root = self.hashtrie_resolve(txn, table, my_root, old_root)?;
                if new_root != my_root {
                    let data = self.frag_get_mut(txn.id, cell)?;
                    put_word(data, 2, new_root.raw());
                }
                trace!(table, "table root resolved");
            }
            if done {
                return Ok(());
            }
        }
    }

    /// Marks everything `key` reaches in `table` as used; absent
    /// tables contribute nothing. Table id 0 walks the directory.
    pub(crate) fn tables_mark_use(
        &mut self,
        table: u32,
        key: u32,
        usage: &mut StatusList,
    ) -> Result<()> {
        if table == MASTER_TABLE_ID {
            let root = self.tables;
            return self.hashtrie_mark_use(table, root, key, usage);
        }
        match self.db_table_get_root(table) {
            Ok((root, _)) => self.hashtrie_mark_use(table, root, key, usage),
            Err(Error::NoSuchTable { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_type_raw_round_trip() {
        for (raw, ty) in [
            (format::TABLE_HASHKEY, TableType::Hash),
            (format::TABLE_STRINGKEY, TableType::StringKey),
            (format::TABLE_MASTER, TableType::Master),
        ] {
            assert_eq!(TableType::from_raw(1, raw).unwrap(), ty);
        }
        assert!(TableType::from_raw(1, 0xdead_beef).is_err());
    }

    #[test]
    fn test_scan_continuation_is_last_key() {
        let r = ScanResult {
            tuples: vec![(3, vec![1]), (9, vec![2])],
        };
        assert_eq!(r.continuation(), Some(9));
        let empty = ScanResult { tuples: vec![] };
        assert_eq!(empty.continuation(), None);
    }
}
