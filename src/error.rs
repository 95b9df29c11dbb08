use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the storage engine.
///
/// Corruption variants carry the block number or chunk id that failed
/// validation; conflict variants carry the table and key so callers can
/// retry or report precisely.
#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// A block read returned fewer bytes than a full block.
    ShortRead { block: u32 },
    /// A block write was cut short.
    ShortWrite { block: u32 },
    /// Block trailer checksum did not match its contents.
    ChecksumMismatch { block: u32 },
    /// Block carried an unexpected type tag.
    WrongBlockType { block: u32, found: u32 },
    /// Chunk carried an unexpected chunk tag.
    WrongChunkType { chunk: u32, found: u32 },
    /// A chunk id pointed outside the block or at an empty slot.
    IllegalChunkId { chunk: u32 },
    /// A cell's continuation chain ended before the recorded length.
    TruncatedCell { chunk: u32 },
    /// Index node depth exceeded the key width; the index is damaged.
    RecursionTooDeep { table: u32, key: u32 },
    /// An index node's recorded key cannot reach this node; the index
    /// is damaged.
    IndexAstray { table: u32, key: u32 },
    /// The superblocks disagree about the database state.
    SuperblockMismatch { block: u32 },
    /// The file is not a database, or has an unsupported version.
    NotADatabase,
    /// The journal file is missing while the database is dirty.
    MissingJournal,
    CorruptJournal(String),
    /// Two transactions touched the same key.
    Conflict { table: u32, key: u32 },
    /// Two transactions touched the same string key.
    StringKeyConflict { table: u32, hash: u32, key_len: usize },
    /// A string-key bucket cell does not parse as a tuple list.
    CorruptBucket { table: u32, hash: u32 },
    /// A table this transaction read was created or deleted underneath it.
    DependencyBroken { table: u32 },
    TableExists { table: u32 },
    NoSuchTable { table: u32 },
    /// The table exists but holds keys of the other kind.
    WrongTableType { table: u32 },
    /// The transaction was already committed or cancelled.
    TransactionClosed,
    /// Sync requested while transactions are still open.
    TransactionsRunning,
    ReadOnly,
    /// Another process holds the database file lock.
    DatabaseLocked,
    InvalidConfig(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::ShortRead { block } => write!(f, "short read at block {}", block),
            Error::ShortWrite { block } => write!(f, "short write at block {}", block),
            Error::ChecksumMismatch { block } => {
                write!(f, "checksum mismatch in block {}", block)
            }
            Error::WrongBlockType { block, found } => {
                write!(f, "wrong block type {:#010x} in block {}", found, block)
            }
            Error::WrongChunkType { chunk, found } => {
                write!(f, "wrong chunk type {:#010x} in chunk {:#x}", found, chunk)
            }
            Error::IllegalChunkId { chunk } => write!(f, "illegal chunk id {:#x}", chunk),
            Error::TruncatedCell { chunk } => {
                write!(f, "cell chain truncated at chunk {:#x}", chunk)
            }
            Error::RecursionTooDeep { table, key } => {
                write!(f, "index too deep in table {} at key {:#x}", table, key)
            }
            Error::IndexAstray { table, key } => {
                write!(f, "index node astray in table {} at key {:#x}", table, key)
            }
            Error::SuperblockMismatch { block } => {
                write!(f, "superblock {} disagrees with superblock 0", block)
            }
            Error::NotADatabase => write!(f, "not a database file"),
            Error::MissingJournal => write!(f, "journal file is missing"),
            Error::CorruptJournal(msg) => write!(f, "corrupt journal: {}", msg),
            Error::Conflict { table, key } => {
                write!(f, "conflict in table {} on key {:#x}", table, key)
            }
            Error::StringKeyConflict { table, hash, key_len } => write!(
                f,
                "conflict in table {} on string key (hash {:#x}, {} bytes)",
                table, hash, key_len
            ),
            Error::CorruptBucket { table, hash } => write!(
                f,
                "corrupt string-key bucket in table {} (hash {:#x})",
                table, hash
            ),
            Error::DependencyBroken { table } => {
                write!(f, "dependency on table {} was broken", table)
            }
            Error::TableExists { table } => write!(f, "table {} already exists", table),
            Error::NoSuchTable { table } => write!(f, "no such table: {}", table),
            Error::WrongTableType { table } => {
                write!(f, "table {} has the wrong key type", table)
            }
            Error::TransactionClosed => write!(f, "transaction is closed"),
            Error::TransactionsRunning => {
                write!(f, "operation requires no running transactions")
            }
            Error::ReadOnly => write!(f, "database is read-only"),
            Error::DatabaseLocked => write!(f, "database is locked by another process"),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}
