//! Single-writer enforcement.
//!
//! A writable open takes an exclusive advisory lock on a sibling
//! `.lock` file. Read-only opens skip locking entirely; they only ever
//! see sealed blocks, so a concurrent writer cannot hand them torn
//! data.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

pub struct FileLock {
    _file: File,
}

/// The lock file sits next to the database file.
pub fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

impl FileLock {
    /// Takes the writer lock for `db_path`, failing with
    /// `DatabaseLocked` if another process holds it. The lock file
    /// records the holder's process id for debugging.
    pub fn lock(db_path: &Path) -> Result<FileLock> {
        let path = lock_path(db_path);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;

        Self::try_lock(&file).map_err(|e| {
            if e.kind() == io::ErrorKind::WouldBlock {
                Error::DatabaseLocked
            } else {
                Error::IoError(e)
            }
        })?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        debug!(path = %path.display(), "writer lock taken");

        Ok(FileLock { _file: file })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let rc = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if rc != 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, e));
            }
            return Err(e);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // No advisory locking on this platform; opens proceed unlocked.
        Ok(())
    }
}

// The kernel drops the lock when the file handle closes; the lock file
// itself stays behind to dodge unlink races between competing openers.

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_holder_pid() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("x.mird");

        let lock = FileLock::lock(&db).expect("first lock");
        assert!(lock_path(&db).exists());
        let content = fs::read_to_string(lock_path(&db)).unwrap();
        assert!(content.contains(&std::process::id().to_string()));

        // flock is held per open file description, so dropping the
        // handle must make the lock takable again.
        drop(lock);
        FileLock::lock(&db).expect("relock after drop");
    }

    #[test]
    fn test_lock_file_sits_next_to_database() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("data.mird");
        assert_eq!(lock_path(&db), dir.path().join("data.mird.lock"));
    }
}
