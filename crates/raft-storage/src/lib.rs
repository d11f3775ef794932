//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements the LogStore and VoteStore traits defined in raft-core
//! what: WriteAheadLog, FileVoteStore, FileStorage data-directory layout

pub mod vote;
pub mod wal;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use raft_core::{LogStore, StorageError, VoteStore};
use tracing::info;

pub use vote::FileVoteStore;
pub use wal::WriteAheadLog;

/// flush `dir`'s entries so a file created or renamed in it survives a crash
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// `create_dir_all`, then sync every directory that had to be created
/// along with the parent it was created in
pub(crate) fn create_dir_durable(dir: &Path) -> io::Result<()> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(path) = cursor {
        if path.as_os_str().is_empty() || path.exists() {
            break;
        }
        missing.push(path);
        cursor = path.parent();
    }

    fs::create_dir_all(dir)?;
    for created in missing.iter().rev() {
        if let Some(parent) = created.parent().filter(|p| !p.as_os_str().is_empty()) {
            sync_dir(parent)?;
        }
    }
    Ok(())
}

/// one node's data directory
///
/// layout:
/// - wal/wal.log: the write-ahead log
/// - persist.meta: current term and vote
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// use `dir` as the data directory, creating it if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        create_dir_durable(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn wal_path(&self) -> PathBuf {
        self.dir.join("wal").join("wal.log")
    }

    pub fn vote_path(&self) -> PathBuf {
        self.dir.join("persist.meta")
    }

    pub fn open_log(&self) -> Result<WriteAheadLog, StorageError> {
        WriteAheadLog::open(self.wal_path())
    }

    pub fn open_vote_store(&self) -> Result<FileVoteStore, StorageError> {
        FileVoteStore::open(self.vote_path())
    }

    /// both stores, boxed the way `RaftNode::new` takes them
    pub fn open(&self) -> Result<(Box<dyn LogStore>, Box<dyn VoteStore>), StorageError> {
        let log = self.open_log()?;
        let votes = self.open_vote_store()?;
        info!(dir = %self.dir.display(), last_index = log.last_index(), "opened node storage");
        Ok((Box::new(log), Box::new(votes)))
    }
}
