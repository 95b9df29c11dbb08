//! Transactions: begin, commit with conflict resolution, cancel.
//!
//! A transaction works on a private copy-on-write view rooted at its
//! own table directory, logging every block allocation and key change
//! to the journal. Committing merges that view into committed state:
//! if nothing was committed since the transaction began (or since its
//! last resolve), the merge is a pointer swap; otherwise the
//! transaction's journal span is replayed against the committed index
//! to find real conflicts, key by key. Cancelling rewinds the journal
//! span instead, returning every allocated block as an unused-block
//! candidate.

use tracing::{debug, trace};

use crate::database::Database;
use crate::error::{Error, Result};
use crate::format::{self, ChunkId, TxnId, TABLE_HASHKEY, TABLE_MASTER, TABLE_STRINGKEY};
use crate::frag::OpenFrag;
use crate::journal::{
    self, JournalEntry, J_ALLOCATED, J_BLOCK_UNUSED, J_CANCEL, J_DELETE, J_DEPEND, J_FINISHED,
    J_KEY_LOCK, J_NEW, J_WROTE,
};
use crate::usage::StatusList;

/// Key statuses carried across the commit-time journal scan.
const ST_WROTE: u32 = 1;
const ST_DELETED: u32 = 2;
const ST_LOCKED: u32 = 3;

/// A handle on an open transaction. All operations go through the
/// owning [`Database`]; the handle only carries the transaction's
/// private state. Commit or cancel it before dropping it, or the next
/// sync will refuse to run.
pub struct Transaction {
    pub(crate) id: TxnId,
    /// This transaction's private table directory root.
    pub(crate) tables: ChunkId,
    /// Running sum of the CRCs of our journal entries.
    pub(crate) checksum: u32,
    /// Journal offset of our `new transaction` entry.
    pub(crate) offset: u64,
    /// Where an interrupted rewind starts over.
    pub(crate) cont_offset: u64,
    /// What was committed when we last resolved (or began).
    pub(crate) last_committed: TxnId,
    pub(crate) dependencies: bool,
    pub(crate) closed: bool,
    pub(crate) rewound: bool,
    pub(crate) frags: Vec<OpenFrag>,
    pub(crate) cache_last_committed: TxnId,
    pub(crate) cache_table_id: u32,
    pub(crate) cache_table_root: ChunkId,
    pub(crate) cache_table_type: u32,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }
}

impl Database {
    /// Starts a transaction on the current committed state.
    pub fn begin(&mut self) -> Result<Transaction> {
        let mut txn = Transaction {
            id: self.next_txn,
            tables: self.tables,
            checksum: 0,
            offset: 0,
            cont_offset: 0,
            last_committed: self.last_committed,
            dependencies: false,
            closed: false,
            rewound: false,
            frags: Vec::new(),
            cache_last_committed: TxnId::ZERO,
            cache_table_id: 0,
            cache_table_root: ChunkId::NONE,
            cache_table_type: 0,
        };
        if !self.flags.read_only {
            txn.offset = self.journal_mut()?.end();
            self.tr_log(&mut txn, J_NEW, 0, 0, 0)?;
            self.next_txn.increment();
        }
        self.live_transactions += 1;
        debug!(txn = %txn.id, "transaction started");
        Ok(txn)
    }

    /// Logs a journal entry for the transaction and folds its CRC into
    /// the running checksum the commit trailer will carry.
    pub(crate) fn tr_log(
        &mut self,
        txn: &mut Transaction,
        kind: u32,
        a: u32,
        b: u32,
        c: u32,
    ) -> Result<()> {
        let entry = JournalEntry::new(kind, txn.id, a, b, c);
        txn.checksum = txn.checksum.wrapping_add(entry.checksum());
        self.journal_mut()?.log(entry)
    }

    /// Allocates a block to the transaction, journalling it so a crash
    /// or cancel returns it to the freelist.
    pub(crate) fn tr_new_block(&mut self, txn: &mut Transaction) -> Result<u32> {
        let block = self.freelist_pop()?;
        self.tr_log(txn, J_ALLOCATED, block, 0, 0)?;
        Ok(block)
    }

    /// Logs a block as an unused-block candidate for the next sweep.
    pub(crate) fn tr_unused(&mut self, txn: &mut Transaction, block: u32) -> Result<()> {
        self.tr_log(txn, J_BLOCK_UNUSED, block, 0, 0)
    }

    /// Commits the transaction. On a conflict error the transaction is
    /// left open, so the caller can still cancel it.
    pub fn commit(&mut self, txn: &mut Transaction) -> Result<()> {
        if self.flags.read_only {
            txn.closed = true;
            self.transaction_done();
            return Ok(());
        }
        if txn.closed || txn.rewound {
            return Err(Error::TransactionClosed);
        }
        self.tr_resolve(txn)?;
        self.tr_finish(txn)?;
        self.transaction_done();
        debug!(txn = %txn.id, "transaction committed");
        self.maybe_deferred_sync()
    }

    /// Cancels the transaction, returning its block allocations.
    pub fn cancel(&mut self, txn: &mut Transaction) -> Result<()> {
        if self.flags.read_only {
            txn.closed = true;
            self.transaction_done();
            return Ok(());
        }
        self.tr_rewind(txn)?;
        self.transaction_done();
        debug!(txn = %txn.id, "transaction cancelled");
        self.maybe_deferred_sync()
    }

    fn transaction_done(&mut self) {
        self.live_transactions = self.live_transactions.saturating_sub(1);
    }

    fn maybe_deferred_sync(&mut self) -> Result<()> {
        if self.sync_pending && self.live_transactions == 0 {
            self.sync()?;
        }
        Ok(())
    }

    /// Undoes the transaction in the journal: every block it allocated
    /// is re-logged as unused, then a cancel trailer closes its span.
    /// Restartable; a failed rewind picks up where it stopped.
    fn tr_rewind(&mut self, txn: &mut Transaction) -> Result<()> {
        if txn.closed {
            return Err(Error::TransactionClosed);
        }
        if !txn.rewound {
            txn.rewound = true;
            txn.cont_offset = txn.offset;
            self.cache.cancel_transaction(txn.id);
        }
        let readback = self.cfg.journal_readback;
        let mut pos = txn.cont_offset;
        loop {
            let batch = self.journal_mut()?.read_batch(pos, readback)?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                if entry.txn == txn.id && entry.kind == J_ALLOCATED {
                    txn.cont_offset = pos;
                    self.tr_unused(txn, entry.a)?;
                }
                pos += journal::ENTRY_SIZE as u64;
            }
        }
        self.tr_log(txn, J_CANCEL, 0, 0, txn.checksum)?;
        txn.closed = true;
        Ok(())
    }

    /// Seals the transaction's blocks and writes the finish trailer,
    /// making its tables the committed tables.
    fn tr_finish(&mut self, txn: &mut Transaction) -> Result<()> {
        if txn.closed {
            return Err(Error::TransactionClosed);
        }
        self.frag_close(txn)?;
        self.cache.flush_transaction(&self.io, txn.id)?;

        if txn.dependencies && self.live_transactions > 1 {
            // Re-log our table dependencies as key locks, so the
            // transactions still running see them when they commit.
            let readback = self.cfg.journal_readback;
            let mut pos = txn.offset;
            loop {
                let batch = self.journal_mut()?.read_batch(pos, readback)?;
                if batch.is_empty() {
                    break;
                }
                for entry in batch {
                    pos += journal::ENTRY_SIZE as u64;
                    if entry.txn == txn.id && entry.kind == J_DEPEND {
                        self.tr_log(txn, J_KEY_LOCK, entry.a, entry.b, 0)?;
                    }
                }
            }
        }

        self.tr_log(txn, J_FINISHED, txn.tables.raw(), 0, txn.checksum)?;
        self.journal_mut()?.flush()?;

        self.last_committed = txn.id;
        self.table_cache = None;
        self.tables = txn.tables;
        txn.closed = true;

        self.save_state(false)?;

        if self.flags.sync_at_end {
            self.io.sync_data()?;
            self.journal_mut()?.sync_data()?;
        }
        Ok(())
    }

    /// Brings the transaction up to date with everything committed
    /// since it began (or last resolved).
    fn tr_resolve(&mut self, txn: &mut Transaction) -> Result<()> {
        if txn.last_committed == self.last_committed {
            return Ok(());
        }
        trace!(txn = %txn.id, "resolving against newer commits");
        self.tables_resolve(txn)?;
        self.tr_resolve_cont(txn)?;
        txn.last_committed = self.last_committed;
        Ok(())
    }

    /// Walks the journal from our first entry: re-checks every key we
    /// recorded against what is now committed, and checks every key
    /// lock later committers left behind.
    fn tr_resolve_cont(&mut self, txn: &mut Transaction) -> Result<()> {
        let readback = self.cfg.journal_readback;
        let mut statuses: Option<StatusList> = None;
        // (table, committed root, type) of the last table we looked at
        let mut committed: Option<(u32, ChunkId, u32)> = None;
        // (table, our root) likewise for our own side
        let mut ours: Option<(u32, ChunkId)> = None;
        let mut pos = txn.offset;

        loop {
            let batch = self.journal_mut()?.read_batch(pos, readback)?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                pos += journal::ENTRY_SIZE as u64;
                if entry.txn == txn.id {
                    match entry.kind {
                        J_WROTE | J_DELETE | J_DEPEND => {}
                        _ => continue,
                    }
                    let table = entry.a;
                    let key = entry.b;
                    let old_cell = ChunkId::from_raw(entry.c);
                    let is_depend = entry.kind == J_DEPEND;

                    if !is_depend {
                        if let Some(sl) = statuses.as_mut() {
                            if sl.get(table, key) != 0 {
                                // later intent for an already-checked key
                                let st = if entry.kind == J_WROTE {
                                    ST_WROTE
                                } else {
                                    ST_DELETED
                                };
                                sl.set(table, key, st);
                                continue;
                            }
                        }
                    }
                    if entry.kind == J_DELETE {
                        statuses
                            .get_or_insert_with(StatusList::new)
                            .set(table, key, ST_DELETED);
                    }

                    let (root, ty) = if table == format::MASTER_TABLE_ID {
                        (self.tables, TABLE_MASTER)
                    } else if let Some((_, r, y)) = committed.filter(|c| c.0 == table) {
                        (r, y)
                    } else {
                        let got = match self.db_table_get_root(table) {
                            Ok(pair) => pair,
                            Err(Error::NoSuchTable { .. }) => {
                                let (_, ty) = self.tr_table_get_root(txn, table)?;
                                (ChunkId::NONE, ty)
                            }
                            Err(e) => return Err(e),
                        };
                        committed = Some((table, got.0, got.1));
                        got
                    };

                    let cell = self.hashtrie_find(table, root, key)?;
                    if cell == old_cell {
                        continue;
                    }
                    trace!(table, key, "resolve mismatch");
                    match ty {
                        TABLE_STRINGKEY => {
                            if let Err(e) = self.s_key_resolve(txn, table, key, old_cell, cell) {
                                return Err(match e {
                                    Error::StringKeyConflict { .. } if is_depend => {
                                        Error::DependencyBroken { table }
                                    }
                                    other => other,
                                });
                            }
                        }
                        TABLE_HASHKEY => {
                            return Err(if is_depend {
                                Error::DependencyBroken { table }
                            } else {
                                Error::Conflict { table, key }
                            });
                        }
                        TABLE_MASTER => {
                            return Err(Error::DependencyBroken { table: key });
                        }
                        _ => return Err(Error::WrongTableType { table }),
                    }
                } else if entry.kind == J_KEY_LOCK {
                    // another transaction committed a dependency on
                    // this key; make sure we left it alone
                    let table = entry.a;
                    let key = entry.b;
                    let root = if table == format::MASTER_TABLE_ID {
                        txn.tables
                    } else if let Some((_, r)) = ours.filter(|o| o.0 == table) {
                        r
                    } else {
                        let r = match self.tr_table_get_root(txn, table) {
                            Ok((r, _)) => r,
                            Err(Error::NoSuchTable { .. }) => ChunkId::NONE,
                            Err(e) => return Err(e),
                        };
                        ours = Some((table, r));
                        r
                    };
                    let conflict = || {
                        if table != format::MASTER_TABLE_ID {
                            Error::Conflict { table, key }
                        } else {
                            Error::DependencyBroken { table: key }
                        }
                    };
                    let (cell, owner) = self.hashtrie_find_owned(table, root, key)?;
                    if !cell.is_none() && owner == txn.id {
                        return Err(conflict());
                    }
                    let sl = statuses.get_or_insert_with(StatusList::new);
                    if sl.get(table, key) != 0 {
                        return Err(conflict());
                    }
                    sl.set(table, key, ST_LOCKED);
                }
            }
        }

        // Deletes that lost their cell to the merge must win again.
        if let Some(sl) = statuses {
            let deleted: Vec<(u32, u32)> = sl
                .entries()
                .filter(|&(_, _, s)| s == ST_DELETED)
                .map(|(t, k, _)| (t, k))
                .collect();
            for (table, key) in deleted {
                let root = if table == format::MASTER_TABLE_ID {
                    txn.tables
                } else if let Some((_, r)) = ours.filter(|o| o.0 == table) {
                    r
                } else {
                    let (r, _) = self.tr_table_get_root(txn, table)?;
                    ours = Some((table, r));
                    r
                };
                let new_root = self.hashtrie_redelete(txn, table, root, key)?;
                if table == format::MASTER_TABLE_ID {
                    txn.tables = new_root;
                } else if new_root != root {
                    self.table_write_root(txn, table, new_root)?;
                    ours = Some((table, new_root));
                }
            }
        }
        Ok(())
    }
}
