//! String-keyed tables, layered on the 32-bit hashtrie.
//!
//! A string key is hashed to a 32-bit key; every string key sharing a
//! hash lives in one bucket cell as a packed tuple list (writer txn,
//! key length, value length, key bytes, value bytes, padded to a word
//! multiple). Storing rewrites the whole bucket, and commit-time
//! conflict resolution merges buckets tuple by tuple so two
//! transactions only collide when they touched the same string key,
//! not merely the same hash.

use tracing::trace;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::format::{get_word, put_word, ChunkId, TxnId, TABLE_STRINGKEY};
use crate::table::ScanResult;
use crate::transaction::Transaction;

/// Tuple header: writer msb, writer lsb, key length, value length.
const TUPLE_OVERHEAD: usize = 16;

/// Bytes one tuple occupies in a bucket.
fn tuple_step(key_len: usize, value_len: usize) -> usize {
    (key_len + value_len + TUPLE_OVERHEAD + 3) & !3
}

/// The string hash. Must never change; it is baked into every
/// string-keyed table on disk.
pub(crate) fn string_hash(key: &[u8]) -> u32 {
    let mut z = key.len() as u32;
    for &b in key {
        z = z.wrapping_add((z << 5) ^ b as u32);
    }
    z
}

/// One parsed bucket tuple, borrowed out of the bucket cell.
struct Tuple<'a> {
    writer: TxnId,
    key: &'a [u8],
    value: &'a [u8],
}

fn bucket_tuples<'a>(table: u32, hash: u32, data: &'a [u8]) -> Result<Vec<Tuple<'a>>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let rest = &data[pos..];
        if rest.len() < TUPLE_OVERHEAD {
            return Err(Error::CorruptBucket { table, hash });
        }
        let writer = TxnId::new(get_word(rest, 0), get_word(rest, 1));
        let key_len = get_word(rest, 2) as usize;
        let value_len = get_word(rest, 3) as usize;
        let step = tuple_step(key_len, value_len);
        if rest.len() < step {
            return Err(Error::CorruptBucket { table, hash });
        }
        out.push(Tuple {
            writer,
            key: &rest[TUPLE_OVERHEAD..TUPLE_OVERHEAD + key_len],
            value: &rest[TUPLE_OVERHEAD + key_len..TUPLE_OVERHEAD + key_len + value_len],
        });
        pos += step;
    }
    Ok(out)
}

fn push_tuple(out: &mut Vec<u8>, writer: TxnId, key: &[u8], value: &[u8]) {
    let start = out.len();
    out.resize(start + tuple_step(key.len(), value.len()), 0);
    let t = &mut out[start..];
    put_word(t, 0, writer.msb);
    put_word(t, 1, writer.lsb);
    put_word(t, 2, key.len() as u32);
    put_word(t, 3, value.len() as u32);
    t[TUPLE_OVERHEAD..TUPLE_OVERHEAD + key.len()].copy_from_slice(key);
    t[TUPLE_OVERHEAD + key.len()..TUPLE_OVERHEAD + key.len() + value.len()]
        .copy_from_slice(value);
}

/// Rebuilds a bucket with `key` set to `value` (or removed when
/// `value` is `None`). `None` out means the bucket is now empty.
fn pack_bucket(
    table: u32,
    hash: u32,
    writer: TxnId,
    old: Option<&[u8]>,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<Option<Vec<u8>>> {
    let survivors = match old {
        Some(data) => bucket_tuples(table, hash, data)?
            .into_iter()
            .filter(|t| t.key != key)
            .map(|t| (t.writer, t.key.to_vec(), t.value.to_vec()))
            .collect(),
        None => Vec::new(),
    };
    if value.is_none() && survivors.is_empty() {
        return Ok(None);
    }
    let mut out = Vec::new();
    if let Some(v) = value {
        push_tuple(&mut out, writer, key, v);
    }
    for (w, k, v) in survivors {
        push_tuple(&mut out, w, &k, &v);
    }
    Ok(Some(out))
}

fn find_tuple<'a>(
    table: u32,
    hash: u32,
    bucket: Option<&'a [u8]>,
    key: &[u8],
) -> Result<Option<(TxnId, &'a [u8])>> {
    match bucket {
        None => Ok(None),
        Some(data) => Ok(bucket_tuples(table, hash, data)?
            .into_iter()
            .find(|t| t.key == key)
            .map(|t| (t.writer, t.value))),
    }
}

/// One batch of a string-key table scan. The continuation is the hash
/// of the last bucket visited, not a string key.
#[derive(Debug)]
pub struct StringScanResult {
    pub tuples: Vec<(Vec<u8>, Vec<u8>)>,
    continuation: u32,
}

impl StringScanResult {
    pub fn continuation(&self) -> u32 {
        self.continuation
    }
}

impl Database {
    /// Creates a string-keyed table.
    pub fn create_string_table(&mut self, txn: &mut Transaction, table: u32) -> Result<()> {
        self.low_table_new(txn, table, TABLE_STRINGKEY)
    }

    fn s_key_write(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.check_writable()?;
        self.check_txn_open(txn)?;
        let (root, ty) = self.tr_table_get_root(txn, table)?;
        if ty != TABLE_STRINGKEY {
            return Err(Error::WrongTableType { table });
        }
        let hash = string_hash(key);
        let old = self.low_key_lookup(table, root, hash)?;
        let bucket = pack_bucket(table, hash, txn.id, old.as_deref(), key, value)?;
        trace!(table, hash, delete = value.is_none(), "string key stored");
        self.low_key_store(txn, table, hash, bucket.as_deref(), TABLE_STRINGKEY)
    }

    pub fn s_key_store(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.s_key_write(txn, table, key, Some(value))
    }

    pub fn s_key_delete(&mut self, txn: &mut Transaction, table: u32, key: &[u8]) -> Result<()> {
        self.s_key_write(txn, table, key, None)
    }

    fn s_key_find(
        &mut self,
        table: u32,
        root: ChunkId,
        ty: u32,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if ty != TABLE_STRINGKEY {
            return Err(Error::WrongTableType { table });
        }
        let hash = string_hash(key);
        let bucket = self.low_key_lookup(table, root, hash)?;
        Ok(find_tuple(table, hash, bucket.as_deref(), key)?.map(|(_, v)| v.to_vec()))
    }

    /// Reads a string key from committed state.
    pub fn s_key_lookup(&mut self, table: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (root, ty) = self.db_table_get_root(table)?;
        self.s_key_find(table, root, ty, key)
    }

    /// Reads a string key as the transaction sees it.
    pub fn txn_s_key_lookup(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.check_txn_open(txn)?;
        let (root, ty) = self.tr_table_get_root(txn, table)?;
        self.s_key_find(table, root, ty, key)
    }

    /// Merges a committed bucket change into this transaction's bucket
    /// for the same hash. Called during commit when another
    /// transaction replaced a bucket we also rewrote; only a shared
    /// string key is a real conflict.
    pub(crate) fn s_key_resolve(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        hash: u32,
        old_cell: ChunkId,
        new_cell: ChunkId,
    ) -> Result<()> {
        let (root, ty) = self.tr_table_get_root(txn, table)?;
        if ty != TABLE_STRINGKEY {
            return Err(Error::WrongTableType { table });
        }
        let ours = self.low_key_lookup(table, root, hash)?;
        let old = if old_cell.is_none() {
            None
        } else {
            Some(self.cell_get(old_cell)?.1)
        };
        let new = if new_cell.is_none() {
            None
        } else {
            Some(self.cell_get(new_cell)?.1)
        };

        let mut merged = ours;
        let mut need_save = false;

        // keys they wrote or rewrote
        if let Some(new_data) = new.as_deref() {
            for t in bucket_tuples(table, hash, new_data)? {
                let before = find_tuple(table, hash, old.as_deref(), t.key)?;
                let changed = match before {
                    None => true,
                    Some((w, _)) => w != t.writer,
                };
                if !changed {
                    continue;
                }
                let mine = find_tuple(table, hash, merged.as_deref(), t.key)?;
                match mine {
                    Some((w, _)) if w == txn.id => {
                        return Err(Error::StringKeyConflict {
                            table,
                            hash,
                            key_len: t.key.len(),
                        });
                    }
                    Some((w, _)) if w == t.writer => {}
                    _ => {
                        merged = pack_bucket(
                            table,
                            hash,
                            t.writer,
                            merged.as_deref(),
                            t.key,
                            Some(t.value),
                        )?;
                        need_save = true;
                    }
                }
            }
        }

        // keys they deleted
        if let Some(old_data) = old.as_deref() {
            for t in bucket_tuples(table, hash, old_data)? {
                if find_tuple(table, hash, new.as_deref(), t.key)?.is_some() {
                    continue;
                }
                match find_tuple(table, hash, merged.as_deref(), t.key)? {
                    None => {
                        return Err(Error::StringKeyConflict {
                            table,
                            hash,
                            key_len: t.key.len(),
                        });
                    }
                    Some((w, _)) if w == txn.id => {
                        return Err(Error::StringKeyConflict {
                            table,
                            hash,
                            key_len: t.key.len(),
                        });
                    }
                    Some(_) => {
                        merged =
                            pack_bucket(table, hash, txn.id, merged.as_deref(), t.key, None)?;
                        need_save = true;
                    }
                }
            }
        }

        if need_save {
            trace!(table, hash, "string key bucket merged");
            self.low_key_store(txn, table, hash, merged.as_deref(), TABLE_STRINGKEY)?;
        }
        Ok(())
    }

    fn explode_buckets(
        &mut self,
        table: u32,
        scanned: ScanResult,
    ) -> Result<Option<StringScanResult>> {
        let continuation = match scanned.continuation() {
            Some(c) => c,
            None => return Ok(None),
        };
        let mut tuples = Vec::new();
        for (hash, bucket) in &scanned.tuples {
            for t in bucket_tuples(table, *hash, bucket)? {
                tuples.push((t.key.to_vec(), t.value.to_vec()));
            }
        }
        Ok(Some(StringScanResult {
            tuples,
            continuation,
        }))
    }

    /// Scans up to `n` buckets of a string-keyed table in committed
    /// state, flattening them into `(key, value)` tuples.
    pub fn s_table_scan(
        &mut self,
        table: u32,
        n: usize,
        after: Option<u32>,
    ) -> Result<Option<StringScanResult>> {
        let (root, ty) = self.db_table_get_root(table)?;
        if ty != TABLE_STRINGKEY {
            return Err(Error::WrongTableType { table });
        }
        match self.low_table_scan(table, root, n, after)? {
            Some(batch) => self.explode_buckets(table, batch),
            None => Ok(None),
        }
    }

    /// Scans a string-keyed table as the transaction sees it.
    pub fn txn_s_table_scan(
        &mut self,
        txn: &mut Transaction,
        table: u32,
        n: usize,
        after: Option<u32>,
    ) -> Result<Option<StringScanResult>> {
        self.check_txn_open(txn)?;
        let (root, ty) = self.tr_table_get_root(txn, table)?;
        if ty != TABLE_STRINGKEY {
            return Err(Error::WrongTableType { table });
        }
        match self.low_table_scan(table, root, n, after)? {
            Some(batch) => self.explode_buckets(table, batch),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_hash_values() {
        assert_eq!(string_hash(b""), 0);
        assert_eq!(string_hash(b"a"), 1 + ((1 << 5) ^ b'a' as u32));
        assert_ne!(string_hash(b"ab"), string_hash(b"ba"));
    }

    #[test]
    fn test_tuple_step_word_aligned() {
        assert_eq!(tuple_step(0, 0), 16);
        assert_eq!(tuple_step(1, 0), 20);
        assert_eq!(tuple_step(3, 1), 20);
        assert_eq!(tuple_step(4, 4), 24);
    }

    #[test]
    fn test_pack_replaces_same_key() {
        let id = TxnId::new(0, 7);
        let b1 = pack_bucket(1, 0, id, None, b"k", Some(b"v1"))
            .unwrap()
            .unwrap();
        let b2 = pack_bucket(1, 0, id, Some(&b1), b"k", Some(b"v2"))
            .unwrap()
            .unwrap();
        let tuples = bucket_tuples(1, 0, &b2).unwrap();
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].value, b"v2");
        assert_eq!(b1.len(), b2.len());
    }

    #[test]
    fn test_pack_delete_empties_bucket() {
        let id = TxnId::new(0, 7);
        let b1 = pack_bucket(1, 0, id, None, b"k", Some(b"v"))
            .unwrap()
            .unwrap();
        assert!(pack_bucket(1, 0, id, Some(&b1), b"k", None)
            .unwrap()
            .is_none());
        // deleting an absent key keeps the others
        let kept = pack_bucket(1, 0, id, Some(&b1), b"other", None)
            .unwrap()
            .unwrap();
        assert_eq!(bucket_tuples(1, 0, &kept).unwrap().len(), 1);
    }

    #[test]
    fn test_bucket_keeps_colliding_keys_apart() {
        let id = TxnId::new(0, 7);
        let b1 = pack_bucket(1, 0, id, None, b"one", Some(b"1"))
            .unwrap()
            .unwrap();
        let b2 = pack_bucket(1, 0, id, Some(&b1), b"two", Some(b"2"))
            .unwrap()
            .unwrap();
        assert_eq!(
            find_tuple(1, 0, Some(&b2), b"one").unwrap().unwrap().1,
            b"1"
        );
        assert_eq!(
            find_tuple(1, 0, Some(&b2), b"two").unwrap().unwrap().1,
            b"2"
        );
        assert!(find_tuple(1, 0, Some(&b2), b"three").unwrap().is_none());
    }

    #[test]
    fn test_truncated_bucket_rejected() {
        let id = TxnId::new(0, 7);
        let b = pack_bucket(1, 0, id, None, b"key", Some(b"value"))
            .unwrap()
            .unwrap();
        assert!(matches!(
            bucket_tuples(1, 0, &b[..b.len() - 4]),
            Err(Error::CorruptBucket { .. })
        ));
    }
}
