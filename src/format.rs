//! On-disk format primitives.
//!
//! Every word on disk is a big-endian `u32`. A database file is an
//! array of equally sized blocks; block 0 and every block at index
//! `4^n - 1` is a superblock. All other blocks begin with a common
//! header and end with a checksum word:
//!
//! ```text
//! +--------+--------+--------+--------+-- ... --+----------+
//! | owner  | owner  | type   | table  | payload | checksum |
//! | msb    | lsb    | tag    | id     |         | (CRC-32) |
//! +--------+--------+--------+--------+-- ... --+----------+
//! ```
//!
//! The owner words name the transaction that last wrote the block,
//! which is what makes copy-on-write ownership checks possible without
//! any in-memory bookkeeping surviving a crash.

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

pub const MAGIC: u32 = 0x4D49_5244; // "MIRD"
pub const DB_VERSION: u32 = 2;
pub const FREELIST_VERSION: u32 = 1;

pub const BLOCK_SUPER: u32 = 0x5355_5052; // "SUPR"
pub const BLOCK_FREELIST: u32 = 0x4652_4545; // "FREE"
pub const BLOCK_FRAG: u32 = 0x4652_4147; // "FRAG"
pub const BLOCK_FRAG_PROGRESS: u32 = 0x5052_4F46; // "PROF"
pub const BLOCK_BIG: u32 = 0x4242_4947; // "BBIG"

pub const CHUNK_HASHTRIE: u32 = 0x6861_7368; // "hash"
pub const CHUNK_CELL: u32 = 0x6365_6C6C; // "cell"
pub const CHUNK_CONT: u32 = 0x636F_6E74; // "cont"
pub const CHUNK_ROOT: u32 = 0x726F_6F74; // "root"

pub const TABLE_HASHKEY: u32 = 0x686B_6579; // "hkey"
pub const TABLE_STRINGKEY: u32 = 0x736B_6579; // "skey"
pub const TABLE_MASTER: u32 = 0x6D61_7374; // "mast"

/// The master table mapping table ids to their root cells.
pub const MASTER_TABLE_ID: u32 = 0;

/// A 32-bit key is exhausted after this many trie levels at minimum
/// fan-out; deeper recursion means a cycle in the index.
pub const TOO_DEEP: u32 = 31;

pub const CELL_OVERHEAD: usize = 12;
pub const CONT_OVERHEAD: usize = 8;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub fn get_word(data: &[u8], n: usize) -> u32 {
    BigEndian::read_u32(&data[n * 4..n * 4 + 4])
}

pub fn put_word(data: &mut [u8], n: usize, v: u32) {
    BigEndian::write_u32(&mut data[n * 4..n * 4 + 4], v);
}

/// Superblocks live at indices 0, 3, 15, 63, ... so the spacing grows
/// with the file and the first one is always present.
pub fn is_superblock(block: u32) -> bool {
    let mut i: u64 = 1;
    while i - 1 <= block as u64 {
        if i - 1 == block as u64 {
            return true;
        }
        i <<= 2;
    }
    false
}

/// A transaction id; a 64-bit counter split into two disk words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct TxnId {
    pub msb: u32,
    pub lsb: u32,
}

impl TxnId {
    pub const ZERO: TxnId = TxnId { msb: 0, lsb: 0 };

    pub fn new(msb: u32, lsb: u32) -> Self {
        TxnId { msb, lsb }
    }

    pub fn is_zero(&self) -> bool {
        self.msb == 0 && self.lsb == 0
    }

    pub fn increment(&mut self) {
        self.lsb = self.lsb.wrapping_add(1);
        if self.lsb == 0 {
            self.msb = self.msb.wrapping_add(1);
        }
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.msb, self.lsb)
    }
}

/// Locator of a stored chunk: a block number and a fragment slot,
/// packed into the single word that goes on disk. Slot 0 addresses a
/// big block (the whole block is one chunk); zero is "no chunk".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(u32);

impl ChunkId {
    pub const NONE: ChunkId = ChunkId(0);

    pub fn from_raw(raw: u32) -> Self {
        ChunkId(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// The fixed shape of one database: block size and the two split
/// factors. Established at creation time and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: usize,
    pub frag_bits: u32,
    pub hashtrie_bits: u32,
}

impl Geometry {
    pub fn words(&self) -> usize {
        self.block_size / 4
    }

    /// Highest usable fragment slot in a fragment block.
    pub fn max_frags(&self) -> u32 {
        (1 << self.frag_bits) - 1
    }

    pub fn chunk(&self, block: u32, slot: u32) -> ChunkId {
        ChunkId((block << self.frag_bits) | slot)
    }

    pub fn chunk_block(&self, id: ChunkId) -> u32 {
        id.0 >> self.frag_bits
    }

    pub fn chunk_slot(&self, id: ChunkId) -> u32 {
        id.0 & self.max_frags()
    }

    pub fn is_big(&self, id: ChunkId) -> bool {
        self.chunk_slot(id) == 0
    }

    /// Byte offset of the first fragment in a fragment block: the four
    /// header words plus the `max_frags + 1` offset-table words.
    pub fn frag_data_start(&self) -> usize {
        4 * (self.max_frags() as usize + 5)
    }

    /// Payload bytes a fresh fragment block can hold.
    pub fn frag_free_bytes(&self) -> usize {
        self.block_size - self.frag_data_start() - 4
    }

    /// Payload capacity of a big block.
    pub fn data_in_big(&self) -> usize {
        self.block_size - 7 * 4
    }

    /// Chunks at or above this size go to big blocks instead of
    /// fragments, so a fragment block always has room for several.
    pub fn big_threshold(&self) -> usize {
        self.block_size - (4 << self.frag_bits) - 64
    }

    /// Byte size of an index node chunk: tag word, key word, children.
    pub fn node_size(&self) -> usize {
        8 + (4 << self.hashtrie_bits)
    }

    pub fn fanout(&self) -> usize {
        1 << self.hashtrie_bits
    }

    pub fn level_mask(&self) -> u32 {
        (1 << self.hashtrie_bits) - 1
    }
}

/// Computes the trailer checksum over every word but the last.
pub fn block_checksum(data: &[u8]) -> u32 {
    CRC32.checksum(&data[..data.len() - 4])
}

/// Stamps the trailer checksum into the last word.
pub fn seal_block(data: &mut [u8]) {
    let sum = block_checksum(data);
    let n = data.len() / 4 - 1;
    put_word(data, n, sum);
}

/// Verifies the trailer checksum.
pub fn verify_block(data: &[u8], block: u32) -> Result<()> {
    let n = data.len() / 4 - 1;
    if get_word(data, n) != block_checksum(data) {
        return Err(Error::ChecksumMismatch { block });
    }
    Ok(())
}

// Superblock word layout. Words 9..=14 and 20..=23 come in pairs: the
// running value and the value as of the last clean sync. A crashed
// database is recovered from the clean copies plus the journal.
const SB_MAGIC: usize = 0;
const SB_VERSION: usize = 1;
const SB_TYPE: usize = 2;
const SB_CLEAN: usize = 3;
const SB_BLOCK_SIZE: usize = 4;
const SB_FRAG_BITS: usize = 5;
const SB_HASHTRIE_BITS: usize = 6;
const SB_LAST_USED: usize = 9;
const SB_CLEAN_LAST_USED: usize = 10;
const SB_TABLES: usize = 11;
const SB_CLEAN_TABLES: usize = 12;
const SB_FREE_NEXT: usize = 13;
const SB_CLEAN_FREE_NEXT: usize = 14;
const SB_NEXT_TXN_MSB: usize = 20;
const SB_NEXT_TXN_LSB: usize = 21;
const SB_CLEAN_NEXT_TXN_MSB: usize = 22;
const SB_CLEAN_NEXT_TXN_LSB: usize = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub clean: bool,
    pub geometry: Geometry,
    pub last_used: u32,
    pub clean_last_used: u32,
    pub tables: u32,
    pub clean_tables: u32,
    pub free_next: u32,
    pub clean_free_next: u32,
    pub next_txn: TxnId,
    pub clean_next_txn: TxnId,
}

impl Superblock {
    pub fn encode(&self, data: &mut [u8]) {
        data.fill(0);
        put_word(data, SB_MAGIC, MAGIC);
        put_word(data, SB_VERSION, DB_VERSION);
        put_word(data, SB_TYPE, BLOCK_SUPER);
        put_word(data, SB_CLEAN, self.clean as u32);
        put_word(data, SB_BLOCK_SIZE, self.geometry.block_size as u32);
        put_word(data, SB_FRAG_BITS, self.geometry.frag_bits);
        put_word(data, SB_HASHTRIE_BITS, self.geometry.hashtrie_bits);
        put_word(data, SB_LAST_USED, self.last_used);
        put_word(data, SB_CLEAN_LAST_USED, self.clean_last_used);
        put_word(data, SB_TABLES, self.tables);
        put_word(data, SB_CLEAN_TABLES, self.clean_tables);
        put_word(data, SB_FREE_NEXT, self.free_next);
        put_word(data, SB_CLEAN_FREE_NEXT, self.clean_free_next);
        put_word(data, SB_NEXT_TXN_MSB, self.next_txn.msb);
        put_word(data, SB_NEXT_TXN_LSB, self.next_txn.lsb);
        put_word(data, SB_CLEAN_NEXT_TXN_MSB, self.clean_next_txn.msb);
        put_word(data, SB_CLEAN_NEXT_TXN_LSB, self.clean_next_txn.lsb);
        let n = data.len() / 4;
        put_word(data, n - 2, rand::random::<u32>());
        seal_block(data);
    }

    pub fn decode(data: &[u8], block: u32) -> Result<Superblock> {
        verify_block(data, block)?;
        if get_word(data, SB_MAGIC) != MAGIC
            || get_word(data, SB_VERSION) != DB_VERSION
            || get_word(data, SB_TYPE) != BLOCK_SUPER
        {
            return Err(Error::NotADatabase);
        }
        let geometry = Geometry {
            block_size: get_word(data, SB_BLOCK_SIZE) as usize,
            frag_bits: get_word(data, SB_FRAG_BITS),
            hashtrie_bits: get_word(data, SB_HASHTRIE_BITS),
        };
        Ok(Superblock {
            clean: get_word(data, SB_CLEAN) != 0,
            geometry,
            last_used: get_word(data, SB_LAST_USED),
            clean_last_used: get_word(data, SB_CLEAN_LAST_USED),
            tables: get_word(data, SB_TABLES),
            clean_tables: get_word(data, SB_CLEAN_TABLES),
            free_next: get_word(data, SB_FREE_NEXT),
            clean_free_next: get_word(data, SB_CLEAN_FREE_NEXT),
            next_txn: TxnId::new(
                get_word(data, SB_NEXT_TXN_MSB),
                get_word(data, SB_NEXT_TXN_LSB),
            ),
            clean_next_txn: TxnId::new(
                get_word(data, SB_CLEAN_NEXT_TXN_MSB),
                get_word(data, SB_CLEAN_NEXT_TXN_LSB),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry {
            block_size: 1024,
            frag_bits: 5,
            hashtrie_bits: 5,
        }
    }

    #[test]
    fn test_superblock_positions() {
        for n in [0u32, 3, 15, 63, 255, 1023] {
            assert!(is_superblock(n), "{} should be a superblock", n);
        }
        for n in [1u32, 2, 4, 14, 16, 62, 64, 1000] {
            assert!(!is_superblock(n), "{} should not be a superblock", n);
        }
    }

    #[test]
    fn test_chunk_id_packing() {
        let g = geo();
        let id = g.chunk(42, 7);
        assert_eq!(g.chunk_block(id), 42);
        assert_eq!(g.chunk_slot(id), 7);
        assert!(!g.is_big(id));
        let big = g.chunk(42, 0);
        assert!(g.is_big(big));
        assert!(ChunkId::NONE.is_none());
    }

    #[test]
    fn test_txn_id_carry() {
        let mut id = TxnId::new(0, u32::MAX);
        id.increment();
        assert_eq!(id, TxnId::new(1, 0));
        assert!(TxnId::new(1, 0) > TxnId::new(0, u32::MAX));
    }

    #[test]
    fn test_block_seal_and_verify() {
        let mut data = vec![0u8; 1024];
        put_word(&mut data, 2, BLOCK_FRAG);
        seal_block(&mut data);
        verify_block(&data, 5).expect("sealed block must verify");
        data[100] ^= 1;
        assert!(matches!(
            verify_block(&data, 5),
            Err(Error::ChecksumMismatch { block: 5 })
        ));
    }

    #[test]
    fn test_superblock_round_trip() {
        let sb = Superblock {
            clean: true,
            geometry: geo(),
            last_used: 17,
            clean_last_used: 17,
            tables: 99,
            clean_tables: 99,
            free_next: 3,
            clean_free_next: 3,
            next_txn: TxnId::new(0, 12),
            clean_next_txn: TxnId::new(0, 12),
        };
        let mut data = vec![0u8; 1024];
        sb.encode(&mut data);
        let back = Superblock::decode(&data, 0).expect("decode");
        assert_eq!(back, sb);
    }

    #[test]
    fn test_geometry_derived_sizes() {
        let g = geo();
        assert_eq!(g.max_frags(), 31);
        assert_eq!(g.frag_data_start(), 4 * 36);
        assert_eq!(g.frag_free_bytes(), 1024 - 144 - 4);
        assert_eq!(g.big_threshold(), 1024 - 128 - 64);
        assert_eq!(g.node_size(), 8 + 128);
        assert_eq!(g.fanout(), 32);
    }
}
