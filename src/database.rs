//! Database lifecycle: open, recovery, sync, close.
//!
//! A database is one block file plus a sibling journal. The block file
//! carries two generations of bookkeeping in its superblocks: the
//! running ("dirty") values and the values as of the last clean sync.
//! Opening a dirty file loads the clean generation and rolls the
//! journal forward over it; opening a clean file just picks up where
//! the last sync left off. The journal is deleted on a clean close, so
//! a database at rest is a single file.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace, warn};

use crate::block::{BlockCache, BlockIo};
use crate::config::{Config, OpenFlags};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::format::{
    get_word, ChunkId, Geometry, Superblock, TxnId, BLOCK_FRAG_PROGRESS, BLOCK_SUPER, DB_VERSION,
    MAGIC,
};
use crate::freelist::FreeList;
use crate::journal::{
    self, Journal, JournalEntry, ENTRY_SIZE, J_ALLOCATED, J_BLOCK_UNUSED, J_CANCEL, J_FINISHED,
    J_NEW,
};
use crate::transaction::Transaction;

pub struct Database {
    pub(crate) io: BlockIo,
    /// Absent on read-only opens; every mutator goes through
    /// [`Database::journal_mut`] and fails cleanly without one.
    pub(crate) journal: Option<Journal>,
    pub(crate) cache: BlockCache,
    pub(crate) geo: Geometry,
    pub(crate) cfg: Config,
    pub(crate) flags: OpenFlags,
    pub(crate) path: PathBuf,
    _lock: Option<FileLock>,

    pub(crate) free: FreeList,
    pub(crate) last_used: u32,
    pub(crate) clean_last_used: u32,
    pub(crate) tables: ChunkId,
    pub(crate) clean_tables: ChunkId,
    pub(crate) clean_free_next: u32,
    pub(crate) next_txn: TxnId,
    pub(crate) clean_next_txn: TxnId,

    pub(crate) last_committed: TxnId,
    pub(crate) live_transactions: usize,
    pub(crate) sync_pending: bool,
    /// One-entry committed-root cache: (last_committed at fill, table,
    /// root, type).
    pub(crate) table_cache: Option<(TxnId, u32, ChunkId, u32)>,
}

impl Database {
    /// Opens or creates the database at `path`.
    ///
    /// Geometry in `cfg` only applies when the file is created; an
    /// existing file keeps the geometry in its superblocks. A dirty
    /// file (crashed or killed writer) is recovered here, before the
    /// handle is returned.
    pub fn open(path: impl AsRef<Path>, cfg: Config, flags: OpenFlags) -> Result<Database> {
        cfg.validate()?;
        let path = path.as_ref().to_path_buf();

        let lock = if flags.read_only {
            None
        } else {
            Some(FileLock::lock(&path)?)
        };

        let mut opts = OpenOptions::new();
        opts.read(true);
        if !flags.read_only {
            opts.write(true);
            if flags.exclusive {
                opts.create_new(true);
            } else if !flags.no_create {
                opts.create(true);
            }
        }
        let file = opts.open(&path)?;
        let file_len = file.metadata()?.len();
        let created = !flags.read_only && file_len == 0 && (!flags.no_create || flags.exclusive);

        let geo = if created {
            Geometry {
                block_size: cfg.block_size,
                frag_bits: cfg.frag_bits,
                hashtrie_bits: cfg.hashtrie_bits,
            }
        } else {
            let mut header = [0u8; 40];
            (&file).seek(SeekFrom::Start(0))?;
            (&file)
                .read_exact(&mut header)
                .map_err(|_| Error::NotADatabase)?;
            if get_word(&header, 0) != MAGIC
                || get_word(&header, 1) != DB_VERSION
                || get_word(&header, 2) != BLOCK_SUPER
            {
                return Err(Error::NotADatabase);
            }
            let geo = Geometry {
                block_size: get_word(&header, 4) as usize,
                frag_bits: get_word(&header, 5),
                hashtrie_bits: get_word(&header, 6),
            };
            let file_cfg = Config {
                block_size: geo.block_size,
                frag_bits: geo.frag_bits,
                hashtrie_bits: geo.hashtrie_bits,
                ..cfg.clone()
            };
            file_cfg.validate().map_err(|_| Error::NotADatabase)?;
            geo
        };

        let cache = BlockCache::new(cfg.cache_size, cfg.cache_search_length, geo.block_size);
        let mut db = Database {
            io: BlockIo::new(file, geo.block_size),
            journal: None,
            cache,
            geo,
            cfg,
            flags,
            path,
            _lock: lock,
            free: FreeList::new(0),
            last_used: 0,
            clean_last_used: 0,
            tables: ChunkId::NONE,
            clean_tables: ChunkId::NONE,
            clean_free_next: 0,
            next_txn: TxnId::new(0, 1),
            clean_next_txn: TxnId::new(0, 1),
            last_committed: TxnId::ZERO,
            live_transactions: 0,
            sync_pending: false,
            table_cache: None,
        };

        if created {
            db.save_state(true)?;
            info!(path = %db.path.display(), block_size = geo.block_size, "created database");
        }

        let is_clean = db.load_superblocks()?;

        if db.flags.read_only {
            db.readonly_refresh()?;
            return Ok(db);
        }

        if is_clean {
            db.journal = Some(Journal::create(&db.path, db.cfg.journal_writecache)?);
        } else {
            info!(path = %db.path.display(), "database is dirty, recovering");
            db.journal_replay()?;
        }

        // Mark the file dirty for as long as a writer has it open.
        db.save_state(false)?;
        Ok(db)
    }

    /// Reads superblock 0 and cross-checks it against every other
    /// superblock the file should carry. Returns whether the last
    /// writer shut down clean. State is loaded from the clean
    /// generation; a dirty generation is only ever reconstructed
    /// through the journal.
    fn load_superblocks(&mut self) -> Result<bool> {
        let mut buf = vec![0u8; self.geo.block_size];
        self.io.read(0, &mut buf)?;
        let first = Superblock::decode(&buf, 0)?;
        if first.geometry != self.geo {
            return Err(Error::NotADatabase);
        }
        let mut is_clean = first.clean;

        let mut i: u64 = 4;
        while i - 1 <= first.last_used as u64 {
            let block = (i - 1) as u32;
            i *= 4;
            if self.io.read(block, &mut buf).is_err() {
                // A hole where a superblock should be: the file grew
                // past it but the write never landed. The journal
                // covers anything that was in flight.
                warn!(block, "superblock unreadable, skipped");
                continue;
            }
            let sb = match Superblock::decode(&buf, block) {
                Ok(sb) => sb,
                Err(Error::ChecksumMismatch { .. }) => {
                    warn!(block, "superblock garbled, skipped");
                    continue;
                }
                Err(_) => return Err(Error::SuperblockMismatch { block }),
            };
            if sb.geometry != self.geo {
                return Err(Error::SuperblockMismatch { block });
            }
            if sb.clean_last_used != first.clean_last_used
                || sb.clean_tables != first.clean_tables
                || sb.clean_free_next != first.clean_free_next
                || sb.clean_next_txn != first.clean_next_txn
            {
                if sb.clean_next_txn < first.clean_next_txn {
                    // Written before the last sync reached it; the
                    // crash hit mid-save_state. Superblock 0 is always
                    // written first, so it wins.
                    debug!(block, "stale superblock generation, skipped");
                    continue;
                }
                return Err(Error::SuperblockMismatch { block });
            }
            is_clean &= sb.clean;
        }

        self.last_used = first.clean_last_used;
        self.clean_last_used = first.clean_last_used;
        self.tables = ChunkId::from_raw(first.clean_tables);
        self.clean_tables = self.tables;
        self.free = FreeList::new(first.clean_free_next);
        self.clean_free_next = first.clean_free_next;
        self.next_txn = first.clean_next_txn;
        self.clean_next_txn = first.clean_next_txn;
        debug!(
            clean = is_clean,
            last_used = self.last_used,
            next_txn = %self.next_txn,
            "loaded state"
        );
        Ok(is_clean)
    }

    /// Writes the current state into every superblock the file
    /// carries. With `clean` set the running values are promoted to
    /// the clean generation first; callers must only do that with the
    /// journal and all dirty blocks already on disk.
    pub(crate) fn save_state(&mut self, clean: bool) -> Result<()> {
        if clean {
            self.clean_last_used = self.last_used;
            self.clean_tables = self.tables;
            self.clean_free_next = self.free.next;
            self.clean_next_txn = self.next_txn;
        }
        let sb = Superblock {
            clean,
            geometry: self.geo,
            last_used: self.last_used,
            clean_last_used: self.clean_last_used,
            tables: self.tables.raw(),
            clean_tables: self.clean_tables.raw(),
            free_next: self.free.next,
            clean_free_next: self.clean_free_next,
            next_txn: self.next_txn,
            clean_next_txn: self.clean_next_txn,
        };
        let mut buf = vec![0u8; self.geo.block_size];
        let mut i: u64 = 1;
        while i - 1 <= self.last_used as u64 {
            // encode() rolls a fresh salt, so every copy checksums
            // differently and a partial multi-block save is detectable
            sb.encode(&mut buf);
            self.io.write((i - 1) as u32, &buf)?;
            i *= 4;
        }
        Ok(())
    }

    /// Re-reads superblock 0 so a read-only handle follows the live
    /// writer. Lookups track the writer's running table directory; a
    /// sync under our feet invalidates every cached block, since the
    /// freelist may have recycled them.
    pub(crate) fn readonly_refresh(&mut self) -> Result<()> {
        let mut buf = vec![0u8; self.geo.block_size];
        self.io.read(0, &mut buf)?;
        let sb = Superblock::decode(&buf, 0)?;
        self.last_used = sb.last_used;
        let tables = ChunkId::from_raw(sb.tables);
        if tables != self.tables {
            self.tables = tables;
            self.table_cache = None;
        }
        let clean_tables = ChunkId::from_raw(sb.clean_tables);
        if clean_tables != self.clean_tables {
            trace!("writer synced, resetting cache");
            self.cache.reset();
            self.clean_tables = clean_tables;
        }
        Ok(())
    }

    /// Rolls the journal forward over the clean state.
    ///
    /// Transactions are re-simulated in order: allocations are checked
    /// against the freelist, commit trailers against the running
    /// entry checksum, and a committed transaction's blocks against
    /// what actually reached the disk. The first entry that fails ends
    /// replay; everything after it belongs to writes that never made
    /// it. Unfinished transactions have their allocations queued as
    /// unused-block candidates and the closing sync sweeps them back
    /// onto the freelist.
    fn journal_replay(&mut self) -> Result<()> {
        let wc = self.cfg.journal_writecache;
        match Journal::open(&self.path, wc) {
            Ok(j) => self.journal = Some(j),
            Err(Error::MissingJournal) => {
                if self.flags.complain_journal {
                    return Err(Error::MissingJournal);
                }
                // The dirty flag alone does not prove lost data; a
                // clean close interrupted between the final superblock
                // write and the journal unlink looks exactly like this.
                warn!("journal missing on dirty database, starting fresh");
                self.journal = Some(Journal::create(&self.path, wc)?);
                return self.sync();
            }
            Err(e) => return Err(e),
        }

        struct Sim {
            id: TxnId,
            offset: u64,
            checksum: u32,
        }
        let mut sims: Vec<Sim> = Vec::new();
        let readback = self.cfg.journal_readback;
        let mut pos: u64 = 0;
        let mut stop: Option<u64> = None;

        'replay: loop {
            let batch = self.journal_mut()?.read_batch(pos, readback)?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                let here = pos;
                pos += ENTRY_SIZE as u64;

                if entry.kind == J_NEW {
                    sims.push(Sim {
                        id: entry.txn,
                        offset: here,
                        checksum: 0,
                    });
                    if entry.txn >= self.next_txn {
                        self.next_txn = entry.txn;
                        self.next_txn.increment();
                    }
                }
                let Some(at) = sims.iter().position(|s| s.id == entry.txn) else {
                    debug!(
                        txn = %entry.txn,
                        kind = %journal::fourcc(entry.kind),
                        "entry for unknown transaction ends replay"
                    );
                    stop = Some(here);
                    break 'replay;
                };
                match entry.kind {
                    J_CANCEL => {
                        if entry.c != sims[at].checksum {
                            stop = Some(here);
                            break 'replay;
                        }
                        trace!(txn = %entry.txn, "replayed cancel");
                        sims.swap_remove(at);
                        continue;
                    }
                    J_FINISHED => {
                        if entry.c != sims[at].checksum {
                            stop = Some(here);
                            break 'replay;
                        }
                        let offset = sims[at].offset;
                        if !self.replay_verify(offset, entry.txn).unwrap_or(false) {
                            warn!(txn = %entry.txn, "committed transaction fails verification");
                            stop = Some(here);
                            break 'replay;
                        }
                        self.tables = ChunkId::from_raw(entry.a);
                        trace!(txn = %entry.txn, "replayed commit");
                        sims.swap_remove(at);
                        continue;
                    }
                    J_ALLOCATED => {
                        let got = self.freelist_pop()?;
                        if got != entry.a {
                            warn!(
                                txn = %entry.txn,
                                want = entry.a,
                                got,
                                "allocation diverged from freelist"
                            );
                            stop = Some(here);
                            break 'replay;
                        }
                    }
                    _ => {}
                }
                sims[at].checksum = sims[at].checksum.wrapping_add(entry.checksum());
            }
        }
        let stop = stop.unwrap_or(pos);

        if !sims.is_empty() {
            warn!(count = sims.len(), "rewinding unfinished transactions");
            self.journal_mut()?.truncate(stop)?;
            for at in 0..sims.len() {
                self.replay_rewind(sims[at].id, sims[at].offset, stop)?;
            }
            self.journal_mut()?.flush()?;
        }
        self.sync()
    }

    /// Checks that every block a committed transaction allocated made
    /// it to disk, owned and finalized. A missing or torn block means
    /// the commit trailer hit the journal but the data did not.
    fn replay_verify(&mut self, offset: u64, id: TxnId) -> Result<bool> {
        let readback = self.cfg.journal_readback;
        let mut pos = offset;
        loop {
            let batch = self.journal_mut()?.read_batch(pos, readback)?;
            if batch.is_empty() {
                return Ok(false);
            }
            for entry in batch {
                pos += ENTRY_SIZE as u64;
                if entry.txn != id {
                    continue;
                }
                match entry.kind {
                    J_ALLOCATED => {
                        let good = match self.cache.get(&self.io, entry.a) {
                            Ok(data) => {
                                get_word(data, 0) == id.msb
                                    && get_word(data, 1) == id.lsb
                                    && get_word(data, 2) != BLOCK_FRAG_PROGRESS
                            }
                            Err(_) => false,
                        };
                        if !good {
                            return Ok(false);
                        }
                    }
                    J_FINISHED => return Ok(true),
                    _ => {}
                }
            }
        }
    }

    /// Appends unused-block candidates for everything an unfinished
    /// transaction allocated. `stop` bounds the scan to the journal as
    /// it was before the rewind itself started appending.
    fn replay_rewind(&mut self, id: TxnId, offset: u64, stop: u64) -> Result<()> {
        let readback = self.cfg.journal_readback;
        let mut pos = offset;
        'scan: loop {
            let batch = self.journal_mut()?.read_batch(pos, readback)?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                if pos >= stop {
                    break 'scan;
                }
                pos += ENTRY_SIZE as u64;
                if entry.txn != id || entry.kind != J_ALLOCATED {
                    continue;
                }
                self.journal_mut()?
                    .log(JournalEntry::new(J_BLOCK_UNUSED, id, entry.a, 0, 0))?;
            }
        }
        debug!(txn = %id, "rewound unfinished transaction");
        Ok(())
    }

    /// The full checkpoint dance. Order matters: the journal must be
    /// durable before the dirty superblocks reference its outcome, and
    /// every data block must be durable before the clean superblocks
    /// promote the state that reaches them.
    fn clean_state(&mut self) -> Result<()> {
        self.journal_mut()?.flush()?;
        self.check_usage()?;
        self.freelist_sync()?;
        self.cache.flush_all(&self.io)?;
        self.journal_mut()?.flush()?;
        self.save_state(false)?;
        self.journal_mut()?.sync_data()?;
        self.io.sync_data()?;
        self.save_state(true)?;
        self.io.sync_data()?;
        Ok(())
    }

    /// Checkpoints everything committed so far and starts a fresh
    /// journal. Fails with `TransactionsRunning` while transactions
    /// are open; use [`Database::sync_please`] to sync as soon as they
    /// finish.
    pub fn sync(&mut self) -> Result<()> {
        self.sync_pending = false;
        if self.flags.read_only {
            return self.readonly_refresh();
        }
        if self.live_transactions > 0 {
            return Err(Error::TransactionsRunning);
        }
        self.clean_state()?;
        self.save_state(false)?;
        self.journal = Some(Journal::create(&self.path, self.cfg.journal_writecache)?);
        debug!(next_txn = %self.next_txn, "synced");
        Ok(())
    }

    /// Syncs now if no transactions are open, otherwise as soon as the
    /// last one commits or cancels. A no-op when nothing has been
    /// committed since the previous sync.
    pub fn sync_please(&mut self) -> Result<()> {
        if self.live_transactions == 0 {
            if !self.flags.read_only && self.next_txn == self.clean_next_txn {
                return Ok(());
            }
            return self.sync();
        }
        self.sync_pending = true;
        Ok(())
    }

    /// Checkpoints and closes the database, deleting the journal so
    /// the file is clean and self-contained.
    ///
    /// Fails with `TransactionsRunning` if transactions are still
    /// open; the handle is consumed either way, and in the error case
    /// the file is left dirty for the next open to recover.
    pub fn close(mut self) -> Result<()> {
        if self.flags.read_only {
            return Ok(());
        }
        if self.live_transactions > 0 {
            return Err(Error::TransactionsRunning);
        }
        self.clean_state()?;
        if let Some(j) = self.journal.take() {
            j.kill()?;
        }
        info!(path = %self.path.display(), "closed clean");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn journal_mut(&mut self) -> Result<&mut Journal> {
        self.journal.as_mut().ok_or(Error::ReadOnly)
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.flags.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn check_txn_open(&self, txn: &Transaction) -> Result<()> {
        if txn.closed || txn.rewound {
            return Err(Error::TransactionClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn db_path(dir: &TempDir) -> PathBuf {
        dir.path().join("test.mird")
    }

    fn open(dir: &TempDir) -> Database {
        Database::open(db_path(dir), Config::default(), OpenFlags::default()).unwrap()
    }

    fn open_flags(dir: &TempDir, flags: OpenFlags) -> Result<Database> {
        Database::open(db_path(dir), Config::default(), flags)
    }

    #[test]
    fn test_create_store_reopen() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut txn = db.begin().unwrap();
        db.create_table(&mut txn, 1).unwrap();
        db.key_store(&mut txn, 1, 42, b"hello").unwrap();
        db.commit(&mut txn).unwrap();
        db.close().unwrap();

        let mut db = open(&dir);
        assert_eq!(db.key_lookup(1, 42).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(db.key_lookup(1, 43).unwrap(), None);
        db.close().unwrap();
    }

    #[test]
    fn test_clean_close_removes_journal() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        assert!(Journal::exists(&db_path(&dir)));
        db.close().unwrap();
        assert!(!Journal::exists(&db_path(&dir)));
    }

    #[test]
    fn test_sync_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut txn = db.begin().unwrap();
        db.create_table(&mut txn, 1).unwrap();
        db.key_store(&mut txn, 1, 7, b"seven").unwrap();
        db.commit(&mut txn).unwrap();
        db.sync().unwrap();
        db.sync().unwrap();
        assert_eq!(db.key_lookup(1, 7).unwrap(), Some(b"seven".to_vec()));
        db.close().unwrap();
    }

    #[test]
    fn test_cancel_discards_writes() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut txn = db.begin().unwrap();
        db.create_table(&mut txn, 1).unwrap();
        db.commit(&mut txn).unwrap();

        let mut txn = db.begin().unwrap();
        db.key_store(&mut txn, 1, 9, b"gone").unwrap();
        db.cancel(&mut txn).unwrap();
        assert_eq!(db.key_lookup(1, 9).unwrap(), None);
        db.close().unwrap();
    }

    #[test]
    fn test_conflicting_writes_fail_second_commit() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut setup = db.begin().unwrap();
        db.create_table(&mut setup, 1).unwrap();
        db.commit(&mut setup).unwrap();

        let mut a = db.begin().unwrap();
        let mut b = db.begin().unwrap();
        db.key_store(&mut a, 1, 5, b"first").unwrap();
        db.key_store(&mut b, 1, 5, b"second").unwrap();
        db.commit(&mut a).unwrap();
        match db.commit(&mut b) {
            Err(Error::Conflict { table: 1, key: 5 }) => {}
            other => panic!("expected conflict, got {:?}", other),
        }
        // the losing transaction stays open for an orderly cancel
        db.cancel(&mut b).unwrap();
        assert_eq!(db.key_lookup(1, 5).unwrap(), Some(b"first".to_vec()));
        db.close().unwrap();
    }

    #[test]
    fn test_conflict_follows_commit_order_not_begin_order() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut setup = db.begin().unwrap();
        db.create_table(&mut setup, 1).unwrap();
        db.commit(&mut setup).unwrap();

        // the later-begun transaction commits first and wins
        let mut a = db.begin().unwrap();
        let mut b = db.begin().unwrap();
        db.key_store(&mut a, 1, 5, b"late").unwrap();
        db.key_store(&mut b, 1, 5, b"early").unwrap();
        db.commit(&mut b).unwrap();
        match db.commit(&mut a) {
            Err(Error::Conflict { table: 1, key: 5 }) => {}
            other => panic!("expected conflict, got {:?}", other),
        }
        db.cancel(&mut a).unwrap();
        assert_eq!(db.key_lookup(1, 5).unwrap(), Some(b"early".to_vec()));
        db.close().unwrap();
    }

    #[test]
    fn test_disjoint_writes_both_commit() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut setup = db.begin().unwrap();
        db.create_table(&mut setup, 1).unwrap();
        db.commit(&mut setup).unwrap();

        let mut a = db.begin().unwrap();
        let mut b = db.begin().unwrap();
        db.key_store(&mut a, 1, 10, b"a").unwrap();
        db.key_store(&mut b, 1, 20, b"b").unwrap();
        db.commit(&mut a).unwrap();
        db.commit(&mut b).unwrap();
        assert_eq!(db.key_lookup(1, 10).unwrap(), Some(b"a".to_vec()));
        assert_eq!(db.key_lookup(1, 20).unwrap(), Some(b"b".to_vec()));
        db.close().unwrap();
    }

    #[test]
    fn test_broken_table_dependency() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut setup = db.begin().unwrap();
        db.create_table(&mut setup, 1).unwrap();
        db.commit(&mut setup).unwrap();

        let mut a = db.begin().unwrap();
        db.depend_table(&mut a, 1).unwrap();
        let mut b = db.begin().unwrap();
        db.delete_table(&mut b, 1).unwrap();
        db.commit(&mut b).unwrap();
        match db.commit(&mut a) {
            Err(Error::DependencyBroken { table: 1 }) => {}
            other => panic!("expected broken dependency, got {:?}", other),
        }
        db.cancel(&mut a).unwrap();
        db.close().unwrap();
    }

    #[test]
    fn test_crash_recovery_keeps_committed_data() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut txn = db.begin().unwrap();
        db.create_table(&mut txn, 1).unwrap();
        db.key_store(&mut txn, 1, 1, b"survives").unwrap();
        db.commit(&mut txn).unwrap();
        // no close, no sync: the file is dirty and only the journal
        // knows about the commit
        drop(db);

        let mut db = open(&dir);
        assert_eq!(db.key_lookup(1, 1).unwrap(), Some(b"survives".to_vec()));
        db.close().unwrap();
    }

    #[test]
    fn test_crash_recovery_rewinds_unfinished() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut txn = db.begin().unwrap();
        db.create_table(&mut txn, 1).unwrap();
        db.key_store(&mut txn, 1, 2, b"kept").unwrap();
        db.commit(&mut txn).unwrap();
        db.sync().unwrap();

        let mut open_txn = db.begin().unwrap();
        db.key_store(&mut open_txn, 1, 3, b"lost").unwrap();
        drop(db);

        let mut db = open(&dir);
        assert_eq!(db.key_lookup(1, 2).unwrap(), Some(b"kept".to_vec()));
        assert_eq!(db.key_lookup(1, 3).unwrap(), None);
        // the rewound allocations must be usable again
        let mut txn = db.begin().unwrap();
        db.key_store(&mut txn, 1, 3, b"again").unwrap();
        db.commit(&mut txn).unwrap();
        assert_eq!(db.key_lookup(1, 3).unwrap(), Some(b"again".to_vec()));
        db.close().unwrap();
    }

    #[test]
    fn test_truncated_commit_trailer_is_rewound() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut txn = db.begin().unwrap();
        db.create_table(&mut txn, 1).unwrap();
        db.commit(&mut txn).unwrap();
        db.sync().unwrap();

        let mut txn = db.begin().unwrap();
        db.key_store(&mut txn, 1, 5, b"torn").unwrap();
        db.commit(&mut txn).unwrap();
        drop(db);

        // cut the commit trailer off the journal, as a crash between
        // the data write and the trailer write would
        let jpath = journal::journal_path(&db_path(&dir));
        let len = fs::metadata(&jpath).unwrap().len();
        let file = OpenOptions::new().write(true).open(&jpath).unwrap();
        file.set_len(len - ENTRY_SIZE as u64).unwrap();
        drop(file);

        let mut db = open(&dir);
        assert_eq!(db.key_lookup(1, 5).unwrap(), None);
        db.close().unwrap();
    }

    #[test]
    fn test_read_only_follows_writer() {
        let dir = TempDir::new().unwrap();
        let mut writer = open(&dir);
        let mut txn = writer.begin().unwrap();
        writer.create_table(&mut txn, 1).unwrap();
        writer.key_store(&mut txn, 1, 8, b"visible").unwrap();
        writer.commit(&mut txn).unwrap();

        let mut reader =
            open_flags(&dir, OpenFlags::default().read_only(true)).unwrap();
        assert_eq!(reader.key_lookup(1, 8).unwrap(), Some(b"visible".to_vec()));

        let mut txn = reader.begin().unwrap();
        match reader.key_store(&mut txn, 1, 9, b"nope") {
            Err(Error::ReadOnly) => {}
            other => panic!("expected read-only error, got {:?}", other),
        }
        reader.cancel(&mut txn).unwrap();

        // a later commit shows up without reopening
        let mut txn = writer.begin().unwrap();
        writer.key_store(&mut txn, 1, 9, b"later").unwrap();
        writer.commit(&mut txn).unwrap();
        assert_eq!(reader.key_lookup(1, 9).unwrap(), Some(b"later".to_vec()));

        reader.close().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        match open_flags(&dir, OpenFlags::default()) {
            Err(Error::DatabaseLocked) => {}
            other => panic!("expected lock failure, got {:?}", other.map(|_| ())),
        }
        db.close().unwrap();
        open(&dir).close().unwrap();
    }

    #[test]
    fn test_open_missing_with_no_create_fails() {
        let dir = TempDir::new().unwrap();
        assert!(open_flags(&dir, OpenFlags::default().no_create(true)).is_err());
    }

    #[test]
    fn test_exclusive_open_refuses_existing() {
        let dir = TempDir::new().unwrap();
        open(&dir).close().unwrap();
        assert!(open_flags(&dir, OpenFlags::default().exclusive(true)).is_err());
    }

    #[test]
    fn test_garbage_file_is_not_a_database() {
        let dir = TempDir::new().unwrap();
        fs::write(db_path(&dir), vec![0xAB; 2048]).unwrap();
        match open_flags(&dir, OpenFlags::default()) {
            Err(Error::NotADatabase) => {}
            other => panic!("expected not-a-database, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_sync_refused_while_transactions_run() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut txn = db.begin().unwrap();
        db.create_table(&mut txn, 1).unwrap();
        match db.sync() {
            Err(Error::TransactionsRunning) => {}
            other => panic!("expected refusal, got {:?}", other),
        }
        // sync_please defers instead
        db.sync_please().unwrap();
        db.commit(&mut txn).unwrap();
        assert_eq!(db.next_txn, db.clean_next_txn);
        db.close().unwrap();
    }

    #[test]
    fn test_values_across_size_thresholds() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let threshold = db.geo.big_threshold();
        let sizes = [0usize, 1, threshold - 1, threshold, threshold + 1, 5000];

        let mut txn = db.begin().unwrap();
        db.create_table(&mut txn, 1).unwrap();
        for (i, &n) in sizes.iter().enumerate() {
            let value = vec![i as u8 + 1; n];
            db.key_store(&mut txn, 1, i as u32, &value).unwrap();
        }
        db.commit(&mut txn).unwrap();
        db.close().unwrap();

        let mut db = open(&dir);
        for (i, &n) in sizes.iter().enumerate() {
            let want = vec![i as u8 + 1; n];
            assert_eq!(db.key_lookup(1, i as u32).unwrap(), Some(want));
        }
        db.close().unwrap();
    }

    #[test]
    fn test_string_keys_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut txn = db.begin().unwrap();
        db.create_string_table(&mut txn, 2).unwrap();
        db.s_key_store(&mut txn, 2, b"alpha", b"1").unwrap();
        db.s_key_store(&mut txn, 2, b"beta", b"2").unwrap();
        db.s_key_store(&mut txn, 2, b"alpha", b"one").unwrap();
        db.commit(&mut txn).unwrap();
        db.close().unwrap();

        let mut db = open(&dir);
        assert_eq!(db.s_key_lookup(2, b"alpha").unwrap(), Some(b"one".to_vec()));
        assert_eq!(db.s_key_lookup(2, b"beta").unwrap(), Some(b"2".to_vec()));
        let mut txn = db.begin().unwrap();
        db.s_key_delete(&mut txn, 2, b"beta").unwrap();
        db.commit(&mut txn).unwrap();
        assert_eq!(db.s_key_lookup(2, b"beta").unwrap(), None);
        db.close().unwrap();
    }

    #[test]
    fn test_colliding_string_keys_merge_on_commit() {
        // "aa0" and "acn" share a hash, so both transactions rewrite
        // the same bucket; commit must merge them instead of failing
        assert_eq!(
            crate::skey::string_hash(b"aa0"),
            crate::skey::string_hash(b"acn")
        );

        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut setup = db.begin().unwrap();
        db.create_string_table(&mut setup, 2).unwrap();
        db.commit(&mut setup).unwrap();

        let mut a = db.begin().unwrap();
        let mut b = db.begin().unwrap();
        db.s_key_store(&mut a, 2, b"aa0", b"first").unwrap();
        db.s_key_store(&mut b, 2, b"acn", b"second").unwrap();
        db.commit(&mut a).unwrap();
        db.commit(&mut b).unwrap();
        assert_eq!(db.s_key_lookup(2, b"aa0").unwrap(), Some(b"first".to_vec()));
        assert_eq!(
            db.s_key_lookup(2, b"acn").unwrap(),
            Some(b"second".to_vec())
        );
        db.close().unwrap();

        // both survive the merged bucket being written out
        let mut db = open(&dir);
        assert_eq!(db.s_key_lookup(2, b"aa0").unwrap(), Some(b"first".to_vec()));
        assert_eq!(
            db.s_key_lookup(2, b"acn").unwrap(),
            Some(b"second".to_vec())
        );
        db.close().unwrap();
    }

    #[test]
    fn test_same_string_key_conflicts() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut setup = db.begin().unwrap();
        db.create_string_table(&mut setup, 2).unwrap();
        db.commit(&mut setup).unwrap();

        let mut a = db.begin().unwrap();
        let mut b = db.begin().unwrap();
        db.s_key_store(&mut a, 2, b"dup", b"a").unwrap();
        db.s_key_store(&mut b, 2, b"dup", b"b").unwrap();
        db.commit(&mut a).unwrap();
        match db.commit(&mut b) {
            Err(Error::StringKeyConflict { table: 2, .. }) => {}
            other => panic!("expected string key conflict, got {:?}", other),
        }
        db.cancel(&mut b).unwrap();
        assert_eq!(db.s_key_lookup(2, b"dup").unwrap(), Some(b"a".to_vec()));
        db.close().unwrap();
    }

    #[test]
    fn test_scan_pages_through_everything() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        let mut txn = db.begin().unwrap();
        db.create_table(&mut txn, 1).unwrap();
        for key in 0..100u32 {
            db.key_store(&mut txn, 1, key, &key.to_be_bytes()).unwrap();
        }
        db.commit(&mut txn).unwrap();

        let mut seen = Vec::new();
        let mut after = None;
        while let Some(batch) = db.table_scan(1, 7, after).unwrap() {
            after = batch.continuation();
            seen.extend(batch.tuples.into_iter().map(|(k, _)| k));
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..100u32).collect::<Vec<_>>());
        db.close().unwrap();
    }

    #[test]
    fn test_geometry_survives_mismatched_config() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(
            db_path(&dir),
            Config::default().block_size(2048),
            OpenFlags::default(),
        )
        .unwrap();
        assert_eq!(db.geo.block_size, 2048);
        db.close().unwrap();

        // reopening with a different block size keeps the on-disk one
        let db = Database::open(
            db_path(&dir),
            Config::default().block_size(512),
            OpenFlags::default(),
        )
        .unwrap();
        assert_eq!(db.geo.block_size, 2048);
        db.close().unwrap();
    }
}
