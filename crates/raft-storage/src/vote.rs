//! # vote
//!
//! why: never forget a term or a vote across a crash, and never half-write one
//! relations: implements raft_core::VoteStore; read once by StateManager::new
//! what: FileVoteStore (tmp + fsync + rename + dir fsync), binary encode/decode
//!
//! file layout, all big-endian:
//!
//! ```text
//! [magic: "RFTS"][version: u32][term: u64][has_vote: u32][voted_for: u64, only if has_vote]
//! ```

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use raft_core::{NodeId, PersistentVoteState, StorageError, VoteStore};

use crate::{create_dir_durable, sync_dir};

const MAGIC: &[u8; 4] = b"RFTS";
const VERSION: u32 = 1;
/// magic + version + term + has_vote
const FIXED_LEN: usize = 4 + 4 + 8 + 4;

fn encode(state: PersistentVoteState) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FIXED_LEN + 8);
    buf.put_slice(MAGIC);
    buf.put_u32(VERSION);
    buf.put_u64(state.current_term);
    match state.voted_for {
        Some(candidate) => {
            buf.put_u32(1);
            buf.put_u64(candidate);
        }
        None => buf.put_u32(0),
    }
    buf
}

fn decode(bytes: &[u8]) -> Result<PersistentVoteState, StorageError> {
    if bytes.len() < FIXED_LEN {
        return Err(StorageError::Corrupt(format!(
            "vote file too short: {} bytes",
            bytes.len()
        )));
    }

    let mut buf = bytes;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if &magic != MAGIC {
        return Err(StorageError::Corrupt(format!("bad magic {magic:02x?}")));
    }

    let version = buf.get_u32();
    if version != VERSION {
        return Err(StorageError::Corrupt(format!(
            "unsupported vote file version {version}"
        )));
    }

    let current_term = buf.get_u64();
    let voted_for = match buf.get_u32() {
        0 => None,
        1 if buf.remaining() >= 8 => Some(buf.get_u64()),
        1 => return Err(StorageError::Corrupt("vote file missing candidate id".into())),
        flag => return Err(StorageError::Corrupt(format!("bad vote flag {flag}"))),
    };

    Ok(PersistentVoteState {
        current_term,
        voted_for,
    })
}

/// term and vote in a single small file, replaced atomically on every write
pub struct FileVoteStore {
    path: PathBuf,
    /// serializes writers so two renames never race over the temp file
    write_lock: Mutex<()>,
}

impl FileVoteStore {
    /// use `path`, creating its directory. a temp file left by a crashed
    /// write is removed; the real file is untouched.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            create_dir_durable(parent)?;
        }

        let store = Self {
            path,
            write_lock: Mutex::new(()),
        };
        match fs::remove_file(store.tmp_path()) {
            Ok(()) => warn!(path = %store.path.display(), "removed stale vote temp file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("meta.tmp")
    }
}

impl VoteStore for FileVoteStore {
    fn read(&self) -> Result<PersistentVoteState, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => decode(&bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(PersistentVoteState::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, current_term: u64, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        let record = encode(PersistentVoteState {
            current_term,
            voted_for,
        });

        let _guard = self.write_lock.lock();
        let tmp = self.tmp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&record)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }

        debug!(path = %self.path.display(), current_term, ?voted_for, "vote state persisted");
        Ok(())
    }
}
