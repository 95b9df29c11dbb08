//! The write-ahead journal.
//!
//! The journal is a flat file of fixed 24-byte entries next to the
//! database file. Every mutation a transaction makes is logged before
//! the data blocks are flushed, so recovery can replay committed
//! transactions and roll back unfinished ones. The file has no header;
//! entry 0 starts at offset 0 and the file is truncated at sync.
//!
//! Appends are buffered: entries collect in memory and hit the file
//! once the buffer fills, a trailer is written, or a reader needs
//! them. A trailer entry (`FINISHED` or `CANCEL`) carries the running
//! checksum of every entry logged for that transaction, which is how
//! replay tells a complete commit record from one cut off mid-write.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::format::{CRC32, TxnId};

pub const ENTRY_SIZE: usize = 24;

pub const J_NEW: u32 = 0x6E65_7774; // "newt"
pub const J_CANCEL: u32 = 0x636E_636C; // "cncl"
pub const J_FINISHED: u32 = 0x6669_6E69; // "fini"
pub const J_ALLOCATED: u32 = 0x616C_6C6F; // "allo"
pub const J_WROTE: u32 = 0x7772_6974; // "writ"
pub const J_DELETE: u32 = 0x6465_6C65; // "dele"
// 0x7277_726F "rwro" and 0x7264_656C "rdel" are reserved for merged
// rewrite records but never written; replay folds unrecognized tags
// into the running checksum and moves on.
pub const J_BLOCK_UNUSED: u32 = 0x6672_6565; // "free"
pub const J_DEPEND: u32 = 0x6465_7065; // "depe"
pub const J_KEY_LOCK: u32 = 0x6C6F_636B; // "lock"

/// One journal record. The meaning of `a`, `b` and `c` depends on the
/// kind; for key records they are table id, key and old chunk id, for
/// trailers `c` is the running checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    pub kind: u32,
    pub txn: TxnId,
    pub a: u32,
    pub b: u32,
    pub c: u32,
}

impl JournalEntry {
    pub fn new(kind: u32, txn: TxnId, a: u32, b: u32, c: u32) -> Self {
        JournalEntry { kind, txn, a, b, c }
    }

    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        BigEndian::write_u32(&mut buf[0..4], self.kind);
        BigEndian::write_u32(&mut buf[4..8], self.txn.msb);
        BigEndian::write_u32(&mut buf[8..12], self.txn.lsb);
        BigEndian::write_u32(&mut buf[12..16], self.a);
        BigEndian::write_u32(&mut buf[16..20], self.b);
        BigEndian::write_u32(&mut buf[20..24], self.c);
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        JournalEntry {
            kind: BigEndian::read_u32(&buf[0..4]),
            txn: TxnId::new(
                BigEndian::read_u32(&buf[4..8]),
                BigEndian::read_u32(&buf[8..12]),
            ),
            a: BigEndian::read_u32(&buf[12..16]),
            b: BigEndian::read_u32(&buf[16..20]),
            c: BigEndian::read_u32(&buf[20..24]),
        }
    }

    /// Per-entry checksum, accumulated (wrapping) into a transaction's
    /// running sum for the trailer.
    pub fn checksum(&self) -> u32 {
        CRC32.checksum(&self.encode())
    }
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
fn pread(mut file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read(buf)
}

#[cfg(not(unix))]
fn pwrite(mut file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

pub struct Journal {
    file: File,
    path: PathBuf,
    /// Bytes already on disk.
    file_end: u64,
    /// Pending appends, at offsets `file_end..`.
    buf: Vec<u8>,
    /// Entries to buffer before forcing an append.
    writecache: usize,
}

/// The journal lives next to the database file.
pub fn journal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".journal");
    PathBuf::from(name)
}

impl Journal {
    /// Creates a fresh, empty journal, truncating any leftover file.
    pub fn create(db_path: &Path, writecache: usize) -> Result<Journal> {
        let path = journal_path(db_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        debug!(path = %path.display(), "created journal");
        Ok(Journal {
            file,
            path,
            file_end: 0,
            buf: Vec::new(),
            writecache,
        })
    }

    /// Opens an existing journal for replay and continued use.
    pub fn open(db_path: &Path, writecache: usize) -> Result<Journal> {
        let path = journal_path(db_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::MissingJournal,
                _ => Error::IoError(e),
            })?;
        let file_end = file.metadata()?.len();
        debug!(path = %path.display(), bytes = file_end, "opened journal");
        Ok(Journal {
            file,
            path,
            file_end,
            buf: Vec::new(),
            writecache,
        })
    }

    pub fn exists(db_path: &Path) -> bool {
        journal_path(db_path).exists()
    }

    /// Byte offset where the next logged entry will land.
    pub fn end(&self) -> u64 {
        self.file_end + self.buf.len() as u64
    }

    /// Appends an entry, flushing the buffer when it is full.
    pub fn log(&mut self, entry: JournalEntry) -> Result<()> {
        trace!(
            kind = %fourcc(entry.kind),
            txn = %entry.txn,
            a = entry.a,
            b = entry.b,
            c = entry.c,
            "journal"
        );
        self.buf.extend_from_slice(&entry.encode());
        if self.buf.len() >= self.writecache * ENTRY_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    /// Pushes buffered entries to the file.
    pub fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            pwrite(&self.file, &self.buf, self.file_end)?;
            self.file_end += self.buf.len() as u64;
            self.buf.clear();
        }
        Ok(())
    }

    /// Reads up to `max` whole entries starting at byte `pos`.
    /// Buffered appends are flushed first so readers see everything.
    pub fn read_batch(&mut self, pos: u64, max: usize) -> Result<Vec<JournalEntry>> {
        self.flush()?;
        let mut raw = vec![0u8; max * ENTRY_SIZE];
        let mut got = 0;
        while got < raw.len() {
            let n = pread(&self.file, &mut raw[got..], pos + got as u64)?;
            if n == 0 {
                break;
            }
            got += n;
        }
        Ok(raw[..got - got % ENTRY_SIZE]
            .chunks_exact(ENTRY_SIZE)
            .map(JournalEntry::decode)
            .collect())
    }

    /// Cuts the journal off at byte `pos`, dropping everything after.
    pub fn truncate(&mut self, pos: u64) -> Result<()> {
        self.flush()?;
        self.file.set_len(pos)?;
        self.file_end = pos;
        Ok(())
    }

    pub fn sync_data(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Deletes the journal file. Called after a clean sync, when the
    /// database no longer needs it.
    pub fn kill(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Renders a journal entry tag for log output.
pub fn fourcc(kind: u32) -> String {
    kind.to_be_bytes()
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn db_path(dir: &TempDir) -> PathBuf {
        dir.path().join("test.db")
    }

    #[test]
    fn test_entry_codec_and_checksum() {
        let e = JournalEntry::new(J_WROTE, TxnId::new(1, 2), 3, 4, 5);
        let back = JournalEntry::decode(&e.encode());
        assert_eq!(back, e);
        // the checksum covers every field
        let other = JournalEntry::new(J_WROTE, TxnId::new(1, 2), 3, 4, 6);
        assert_ne!(e.checksum(), other.checksum());
    }

    #[test]
    fn test_buffered_log_is_visible_to_reads() {
        let dir = TempDir::new().unwrap();
        let mut j = Journal::create(&db_path(&dir), 16).unwrap();
        for i in 0..5u32 {
            j.log(JournalEntry::new(J_ALLOCATED, TxnId::new(0, 1), i, 0, 0))
                .unwrap();
        }
        // nothing flushed yet, but the reader must still see it
        let back = j.read_batch(0, 64).unwrap();
        assert_eq!(back.len(), 5);
        assert_eq!(back[3].a, 3);
    }

    #[test]
    fn test_read_batch_paginates() {
        let dir = TempDir::new().unwrap();
        let mut j = Journal::create(&db_path(&dir), 4).unwrap();
        for i in 0..10u32 {
            j.log(JournalEntry::new(J_BLOCK_UNUSED, TxnId::new(0, 2), 0, 0, i))
                .unwrap();
        }
        let first = j.read_batch(0, 4).unwrap();
        assert_eq!(first.len(), 4);
        let rest = j.read_batch(4 * ENTRY_SIZE as u64, 64).unwrap();
        assert_eq!(rest.len(), 6);
        assert_eq!(rest[0].c, 4);
    }

    #[test]
    fn test_truncate_drops_tail() {
        let dir = TempDir::new().unwrap();
        let mut j = Journal::create(&db_path(&dir), 64).unwrap();
        for i in 0..6u32 {
            j.log(JournalEntry::new(J_NEW, TxnId::new(0, i), 0, 0, 0))
                .unwrap();
        }
        j.truncate(2 * ENTRY_SIZE as u64).unwrap();
        assert_eq!(j.end(), 2 * ENTRY_SIZE as u64);
        let back = j.read_batch(0, 64).unwrap();
        assert_eq!(back.len(), 2);
        // appends continue after the cut
        j.log(JournalEntry::new(J_CANCEL, TxnId::new(0, 9), 0, 0, 0))
            .unwrap();
        assert_eq!(j.read_batch(0, 64).unwrap().len(), 3);
    }

    #[test]
    fn test_reopen_finds_existing_entries() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);
        {
            let mut j = Journal::create(&path, 8).unwrap();
            j.log(JournalEntry::new(J_FINISHED, TxnId::new(0, 7), 1, 0, 99))
                .unwrap();
            j.flush().unwrap();
        }
        let mut j = Journal::open(&path, 8).unwrap();
        let back = j.read_batch(0, 8).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].kind, J_FINISHED);
        assert_eq!(back[0].c, 99);
    }

    #[test]
    fn test_missing_journal_is_reported() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Journal::open(&db_path(&dir), 8),
            Err(Error::MissingJournal)
        ));
    }
}
