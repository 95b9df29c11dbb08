use crate::error::{Error, Result};

/// Configuration for a database.
///
/// The geometry fields (`block_size`, `frag_bits`, `hashtrie_bits`) are
/// written into the superblocks on creation and read back on open; on an
/// existing database the on-disk values win. The cache and journal
/// fields only shape in-memory behaviour and may differ between opens.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of every block in bytes; a power of two (default: 1024)
    pub block_size: usize,

    /// Bits per fragment slot number; a fragment block holds
    /// `(1 << frag_bits) - 1` fragments (default: 5)
    pub frag_bits: u32,

    /// Bits consumed per index level; an index node fans out to
    /// `1 << hashtrie_bits` children (default: 5)
    pub hashtrie_bits: u32,

    /// Number of block cache slots (default: 128)
    pub cache_size: usize,

    /// How many slots past the home slot the cache probes (default: 8)
    pub cache_search_length: usize,

    /// Open fragment blocks kept per transaction (default: 8)
    pub max_open_frag_blocks: usize,

    /// Journal entries read per batch during replay (default: 64)
    pub journal_readback: usize,

    /// Journal entries buffered before an append is forced (default: 64)
    pub journal_writecache: usize,
}

/// How to open the database file.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Open for reading only; mutators fail with `ReadOnly`.
    pub read_only: bool,

    /// Fail instead of creating a missing database.
    pub no_create: bool,

    /// Fail if the database already exists.
    pub exclusive: bool,

    /// Treat a missing journal on a dirty database as an error instead
    /// of assuming a clean shutdown lost only the journal file.
    pub complain_journal: bool,

    /// Datasync the database and journal at the end of every commit,
    /// not only at sync.
    pub sync_at_end: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 1024,
            frag_bits: 5,
            hashtrie_bits: 5,
            cache_size: 128,
            cache_search_length: 8,
            max_open_frag_blocks: 8,
            journal_readback: 64,
            journal_writecache: 64,
        }
    }
}

impl Config {
    /// Set block size in bytes
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set bits per fragment slot number
    pub fn frag_bits(mut self, bits: u32) -> Self {
        self.frag_bits = bits;
        self
    }

    /// Set bits consumed per index level
    pub fn hashtrie_bits(mut self, bits: u32) -> Self {
        self.hashtrie_bits = bits;
        self
    }

    /// Set number of block cache slots
    pub fn cache_size(mut self, slots: usize) -> Self {
        self.cache_size = slots;
        self
    }

    /// Set the cache probe window
    pub fn cache_search_length(mut self, len: usize) -> Self {
        self.cache_search_length = len;
        self
    }

    /// Set open fragment blocks kept per transaction
    pub fn max_open_frag_blocks(mut self, n: usize) -> Self {
        self.max_open_frag_blocks = n;
        self
    }

    /// Set journal replay batch size
    pub fn journal_readback(mut self, n: usize) -> Self {
        self.journal_readback = n;
        self
    }

    /// Set journal write buffer size in entries
    pub fn journal_writecache(mut self, n: usize) -> Self {
        self.journal_writecache = n;
        self
    }

    /// Checks that the geometry and cache parameters are usable.
    pub fn validate(&self) -> Result<()> {
        let legal_block = (7..31).any(|i| self.block_size == 1usize << i);
        if !legal_block {
            return Err(Error::InvalidConfig(format!(
                "block size {} is not a power of two in 128..=2^30",
                self.block_size
            )));
        }
        if self.frag_bits == 0 || (4usize << self.frag_bits) > self.block_size / 4 {
            return Err(Error::InvalidConfig(format!(
                "frag bits {} too large for block size {}",
                self.frag_bits, self.block_size
            )));
        }
        if self.hashtrie_bits == 0 || (4usize << self.hashtrie_bits) > self.block_size / 4 {
            return Err(Error::InvalidConfig(format!(
                "hashtrie bits {} too large for block size {}",
                self.hashtrie_bits, self.block_size
            )));
        }
        if self.cache_size == 0
            || self.cache_search_length == 0
            || self.cache_search_length > self.cache_size
        {
            return Err(Error::InvalidConfig(format!(
                "cache geometry {}/{} is unusable",
                self.cache_size, self.cache_search_length
            )));
        }
        if self.max_open_frag_blocks == 0
            || self.journal_readback == 0
            || self.journal_writecache == 0
        {
            return Err(Error::InvalidConfig(
                "batch sizes must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

impl OpenFlags {
    /// Open for reading only
    pub fn read_only(mut self, yes: bool) -> Self {
        self.read_only = yes;
        self
    }

    /// Fail instead of creating a missing database
    pub fn no_create(mut self, yes: bool) -> Self {
        self.no_create = yes;
        self
    }

    /// Fail if the database already exists
    pub fn exclusive(mut self, yes: bool) -> Self {
        self.exclusive = yes;
        self
    }

    /// Error on a missing journal when the database is dirty
    pub fn complain_journal(mut self, yes: bool) -> Self {
        self.complain_journal = yes;
        self
    }

    /// Datasync after every commit
    pub fn sync_at_end(mut self, yes: bool) -> Self {
        self.sync_at_end = yes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.frag_bits, 5);
        assert_eq!(config.hashtrie_bits, 5);
        config.validate().expect("default config must validate");
    }

    #[test]
    fn test_config_builder() {
        let config = Config::default()
            .block_size(4096)
            .frag_bits(6)
            .hashtrie_bits(4)
            .cache_size(64)
            .cache_search_length(4);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.frag_bits, 6);
        assert_eq!(config.hashtrie_bits, 4);
        config.validate().expect("built config must validate");
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(Config::default().block_size(1000).validate().is_err());
        assert!(Config::default().block_size(64).validate().is_err());
        assert!(Config::default().frag_bits(0).validate().is_err());
        // 4 << 9 = 2048 > 1024/4
        assert!(Config::default().frag_bits(9).validate().is_err());
        assert!(Config::default().hashtrie_bits(9).validate().is_err());
        assert!(Config::default().cache_size(0).validate().is_err());
        assert!(Config::default()
            .cache_size(4)
            .cache_search_length(8)
            .validate()
            .is_err());
    }
}
