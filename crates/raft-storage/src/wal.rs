//! # wal
//!
//! why: make every log entry survive a crash before anyone is told it was appended
//! relations: implements raft_core::LogStore; opened through FileStorage; read back by LogManager::open
//! what: WriteAheadLog (framed, fsynced, gap-free append file with prefix recovery)
//!
//! record layout, all big-endian:
//!
//! ```text
//! [len: u32][term: u64][index: u64][payload: len - 16 bytes]
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use raft_core::{LogEntry, LogStore, StorageError};

use crate::{create_dir_durable, sync_dir};

/// term + index
const HEADER_LEN: usize = 16;
const LEN_PREFIX: usize = 4;
/// largest payload a single record may carry
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

struct Scanned {
    entry: LogEntry,
    /// byte offset just past this record
    end: u64,
}

struct Scan {
    records: Vec<Scanned>,
    valid_len: u64,
    damage: Option<String>,
}

/// walk `bytes` from offset 0 and keep the longest well-formed prefix
fn scan_records(bytes: &[u8]) -> Scan {
    let mut buf = bytes;
    let mut records = Vec::new();
    let mut valid_len = 0u64;
    let mut expected = 1u64;

    let damage = loop {
        if !buf.has_remaining() {
            break None;
        }
        if buf.remaining() < LEN_PREFIX {
            break Some("truncated length prefix".to_string());
        }
        let len = buf.get_u32() as usize;
        if !(HEADER_LEN..=HEADER_LEN + MAX_PAYLOAD_LEN).contains(&len) {
            break Some(format!("bad record length {len}"));
        }
        if buf.remaining() < len {
            break Some(format!("incomplete record, wanted {len} bytes, found {}", buf.remaining()));
        }

        let term = buf.get_u64();
        let index = buf.get_u64();
        let payload = buf[..len - HEADER_LEN].to_vec();
        buf.advance(len - HEADER_LEN);

        if index != expected {
            break Some(format!("expected index {expected}, found {index}"));
        }

        valid_len += (LEN_PREFIX + len) as u64;
        records.push(Scanned {
            entry: LogEntry::new(term, index, payload),
            end: valid_len,
        });
        expected += 1;
    };

    Scan {
        records,
        valid_len,
        damage,
    }
}

fn encode_record(term: u64, index: u64, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + HEADER_LEN + payload.len());
    buf.put_u32((HEADER_LEN + payload.len()) as u32);
    buf.put_u64(term);
    buf.put_u64(index);
    buf.put_slice(payload);
    buf
}

struct WalInner {
    file: File,
    /// length of the well-formed prefix; appends go here
    len: u64,
    last_index: u64,
    last_term: u64,
}

impl WalInner {
    fn read_file(&mut self) -> std::io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.len as usize);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn write_record(&mut self, record: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(record)?;
        self.file.sync_data()
    }
}

/// append-only log file, one record per entry
///
/// a successful `append` has been fsynced. on open, anything after the
/// first malformed, incomplete or out-of-sequence record is cut off.
pub struct WriteAheadLog {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl WriteAheadLog {
    /// open or create the log at `path`, recovering the valid prefix
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            create_dir_durable(parent)?;
        }

        let created = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if created {
            // the directory entry must be durable before any append is
            file.sync_all()?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                sync_dir(parent)?;
            }
            debug!(path = %path.display(), "created write-ahead log");
        }
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let scan = scan_records(&bytes);
        if let Some(reason) = &scan.damage {
            warn!(
                path = %path.display(),
                kept = scan.valid_len,
                dropped = bytes.len() as u64 - scan.valid_len,
                reason = %reason,
                "truncating write-ahead log at damaged record"
            );
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }

        let (last_index, last_term) = scan
            .records
            .last()
            .map(|r| (r.entry.index, r.entry.term))
            .unwrap_or((0, 0));
        debug!(path = %path.display(), last_index, last_term, "write-ahead log opened");

        Ok(Self {
            path,
            inner: Mutex::new(WalInner {
                file,
                len: scan.valid_len,
                last_index,
                last_term,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// size of the valid record prefix in bytes
    pub fn len_bytes(&self) -> u64 {
        self.inner.lock().len
    }
}

impl LogStore for WriteAheadLog {
    fn append(&self, term: u64, index: u64, payload: &[u8]) -> Result<u64, StorageError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(StorageError::RecordTooLarge { len: payload.len() });
        }

        let mut inner = self.inner.lock();
        let expected = inner.last_index + 1;
        if index != expected {
            return Err(StorageError::IndexMismatch {
                expected,
                got: index,
            });
        }

        let record = encode_record(term, index, payload);
        if let Err(err) = inner.write_record(&record) {
            // drop whatever part of the record made it out
            let len = inner.len;
            if let Err(rollback) = inner.file.set_len(len).and_then(|()| inner.file.sync_data()) {
                error!(path = %self.path.display(), %rollback, "failed to roll back partial record");
            }
            return Err(err.into());
        }

        inner.len += record.len() as u64;
        inner.last_index = index;
        inner.last_term = term;
        Ok(index)
    }

    fn read_all(&self) -> Result<Vec<LogEntry>, StorageError> {
        let mut inner = self.inner.lock();
        let bytes = inner.read_file()?;
        let scan = scan_records(&bytes[..inner.len.min(bytes.len() as u64) as usize]);
        Ok(scan.records.into_iter().map(|r| r.entry).collect())
    }

    fn truncate_suffix_from(&self, index_exclusive: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if index_exclusive >= inner.last_index {
            return Ok(());
        }

        let bytes = inner.read_file()?;
        let scan = scan_records(&bytes);
        let kept = scan
            .records
            .iter()
            .take_while(|r| r.entry.index <= index_exclusive)
            .last();
        let (len, last_index, last_term) = kept
            .map(|r| (r.end, r.entry.index, r.entry.term))
            .unwrap_or((0, 0, 0));

        inner.file.set_len(len)?;
        inner.file.sync_all()?;
        debug!(
            path = %self.path.display(),
            from = inner.last_index,
            to = last_index,
            "truncated write-ahead log"
        );
        inner.len = len;
        inner.last_index = last_index;
        inner.last_term = last_term;
        Ok(())
    }

    fn last_index(&self) -> u64 {
        self.inner.lock().last_index
    }

    fn last_term(&self) -> u64 {
        self.inner.lock().last_term
    }
}
