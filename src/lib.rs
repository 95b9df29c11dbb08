//! Embeddable crash-safe transactional key/value store.
//!
//! A database is a single file of fixed-size checksummed blocks plus a
//! sibling write-ahead journal. Data lives in numbered tables, keyed
//! either by 32-bit integers or by byte strings; every table is a
//! copy-on-write hash trie, so committed state is never modified in
//! place and readers always see a consistent snapshot.
//!
//! Writes happen inside transactions with optimistic conflict
//! detection: transactions run against the state committed when they
//! began, and a commit fails with [`Error::Conflict`] if another
//! transaction got to the same key first.
//!
//! ```no_run
//! use mird::{Config, Database, OpenFlags};
//!
//! fn main() -> mird::Result<()> {
//!     let mut db = Database::open("data.mird", Config::default(), OpenFlags::default())?;
//!     let mut txn = db.begin()?;
//!     db.create_table(&mut txn, 1)?;
//!     db.key_store(&mut txn, 1, 42, b"value")?;
//!     db.commit(&mut txn)?;
//!     assert_eq!(db.key_lookup(1, 42)?, Some(b"value".to_vec()));
//!     db.close()
//! }
//! ```

mod block;
mod cell;
mod config;
mod database;
mod error;
mod flock;
mod format;
mod frag;
mod freelist;
mod hashtrie;
mod journal;
mod skey;
mod table;
mod transaction;
mod usage;

pub use config::{Config, OpenFlags};
pub use database::Database;
pub use error::{Error, Result};
pub use format::TxnId;
pub use skey::StringScanResult;
pub use table::{ScanResult, TableType};
pub use transaction::Transaction;
