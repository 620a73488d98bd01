//! Durable backend: in-memory tables rebuilt from an append-only log.
//!
//! Every mutation is appended to `hub.log` (and optionally fsynced) before
//! it is applied to the tables, so a reopened backend replays to the same
//! state. Entries are length-prefixed MessagePack followed by a CRC32.

use super::table::Tables;
use super::{Deadline, Entry, ScanRange, StorageBackend};
use crate::config::FileBackendConfig;
use crate::error::{HubError, Result};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the operation log.
const LOG_MAGIC: &[u8; 4] = b"HUB\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

const HEADER_LEN: u64 = 5;

const LOG_FILE: &str = "hub.log";
const COMPACT_FILE: &str = "hub.log.compact";
const LOCK_FILE: &str = "LOCK";

/// Sanity bound on a single entry.
const MAX_ENTRY_SIZE: usize = 256 * 1024 * 1024;

/// One logged mutation.
#[derive(Debug, Serialize, Deserialize)]
enum LogOp {
    Put {
        partition: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        partition: String,
        key: Vec<u8>,
    },
    DeleteRange {
        partition: String,
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
    },
}

impl LogOp {
    fn apply(&self, tables: &Tables) {
        match self {
            LogOp::Put {
                partition,
                key,
                value,
            } => tables.put(partition, key, value.clone()),
            LogOp::Delete { partition, key } => {
                tables.delete(partition, key);
            }
            LogOp::DeleteRange {
                partition,
                start,
                end,
            } => {
                let range = ScanRange {
                    start: start.clone(),
                    end: end.clone(),
                };
                tables.delete_range(partition, &range);
            }
        }
    }
}

/// File-backed storage.
pub struct FileBackend {
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    tables: Tables,

    /// Serializes log appends; every mutation holds it while it logs and applies.
    writer: Mutex<BufWriter<File>>,

    sync_every_write: bool,
}

impl FileBackend {
    /// Open the log at `config.path`, replaying it into memory.
    pub fn open(config: FileBackendConfig) -> Result<Self> {
        let path = config.path;
        if !path.exists() {
            if !config.create_if_missing {
                return Err(HubError::InvalidFormat(format!(
                    "no hub data at {}",
                    path.display()
                )));
            }
            fs::create_dir_all(&path)?;
        }

        let lock_file = Self::acquire_lock(&path)?;
        let log_path = path.join(LOG_FILE);
        let tables = Tables::new();

        if log_path.exists() && fs::metadata(&log_path)?.len() > 0 {
            let replayed = Self::replay(&log_path, &tables)?;
            debug!(path = %log_path.display(), entries = replayed, "replayed hub log");
        } else {
            Self::write_header(&log_path)?;
        }

        let file = OpenOptions::new().append(true).open(&log_path)?;

        Ok(Self {
            path,
            _lock_file: lock_file,
            tables,
            writer: Mutex::new(BufWriter::new(file)),
            sync_every_write: config.sync_every_write,
        })
    }

    /// Directory holding the log and lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the log so it holds only live entries.
    pub fn compact(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let tmp_path = self.path.join(COMPACT_FILE);
        let log_path = self.path.join(LOG_FILE);
        {
            let mut out = BufWriter::new(File::create(&tmp_path)?);
            out.write_all(LOG_MAGIC)?;
            out.write_all(&[LOG_VERSION])?;
            for (partition, entries) in self.tables.dump() {
                for (key, value) in entries {
                    let op = LogOp::Put {
                        partition: partition.clone(),
                        key,
                        value,
                    };
                    Self::write_entry(&mut out, &op)?;
                }
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &log_path)?;

        *writer = BufWriter::new(OpenOptions::new().append(true).open(&log_path)?);
        debug!(path = %log_path.display(), "compacted hub log");
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|_| HubError::Locked)?;
        Ok(lock_file)
    }

    fn write_header(log_path: &Path) -> Result<()> {
        let mut file = File::create(log_path)?;
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    /// Apply every intact entry. A torn or corrupt tail is cut off.
    fn replay(log_path: &Path, tables: &Tables) -> Result<u64> {
        let file = File::open(log_path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(HubError::InvalidFormat("Invalid hub log magic".into()));
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(HubError::InvalidFormat(format!(
                "Unsupported hub log version: {}",
                version[0]
            )));
        }

        let mut offset = HEADER_LEN;
        let mut count = 0u64;
        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some((op, len))) => {
                    op.apply(tables);
                    offset += len;
                    count += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(offset, error = %e, "truncating damaged hub log tail");
                    let file = OpenOptions::new().write(true).open(log_path)?;
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
            }
        }
        Ok(count)
    }

    fn write_entry<W: Write>(writer: &mut W, op: &LogOp) -> Result<()> {
        let encoded = rmp_serde::to_vec(op)?;

        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;

        let checksum = crc32fast::hash(&encoded);
        writer.write_all(&checksum.to_le_bytes())?;

        Ok(())
    }

    /// Returns the entry and its size on disk; `None` at a clean end of file.
    fn read_entry(reader: &mut BufReader<File>) -> Result<Option<(LogOp, u64)>> {
        if reader.fill_buf()?.is_empty() {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_ENTRY_SIZE {
            return Err(HubError::Corruption("hub log entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(HubError::Corruption("hub log checksum mismatch".into()));
        }

        let op = rmp_serde::from_slice(&encoded)?;
        Ok(Some((op, (4 + len + 4) as u64)))
    }

    /// Log `op`, then apply it. Caller holds the writer lock.
    fn commit(
        &self,
        writer: &mut BufWriter<File>,
        op_name: &'static str,
        op: LogOp,
        partition: &str,
    ) -> Result<()> {
        let io_failed = |e: HubError| match e {
            HubError::Io(io) => HubError::unavailable(op_name, partition, io.to_string()),
            other => other,
        };

        Self::write_entry(writer, &op).map_err(io_failed)?;
        writer.flush().map_err(|e| io_failed(e.into()))?;
        if self.sync_every_write {
            writer
                .get_ref()
                .sync_data()
                .map_err(|e| io_failed(e.into()))?;
        }
        op.apply(&self.tables);
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, partition: &str, key: &[u8], deadline: Deadline) -> Result<Option<Vec<u8>>> {
        deadline.check("get", partition)?;
        Ok(self.tables.get(partition, key))
    }

    fn put(&self, partition: &str, key: &[u8], value: Vec<u8>, deadline: Deadline) -> Result<()> {
        let mut writer = self.writer.lock();
        deadline.check("put", partition)?;
        let op = LogOp::Put {
            partition: partition.to_string(),
            key: key.to_vec(),
            value,
        };
        self.commit(&mut writer, "put", op, partition)
    }

    fn compare_and_swap(
        &self,
        partition: &str,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Vec<u8>,
        deadline: Deadline,
    ) -> Result<bool> {
        let mut writer = self.writer.lock();
        deadline.check("compare_and_swap", partition)?;
        if !self.tables.matches(partition, key, expected) {
            return Ok(false);
        }
        let op = LogOp::Put {
            partition: partition.to_string(),
            key: key.to_vec(),
            value: new,
        };
        self.commit(&mut writer, "compare_and_swap", op, partition)?;
        Ok(true)
    }

    fn delete(&self, partition: &str, key: &[u8], deadline: Deadline) -> Result<bool> {
        let mut writer = self.writer.lock();
        deadline.check("delete", partition)?;
        if self.tables.get(partition, key).is_none() {
            return Ok(false);
        }
        let op = LogOp::Delete {
            partition: partition.to_string(),
            key: key.to_vec(),
        };
        self.commit(&mut writer, "delete", op, partition)?;
        Ok(true)
    }

    fn delete_range(&self, partition: &str, range: &ScanRange, deadline: Deadline) -> Result<u64> {
        let mut writer = self.writer.lock();
        deadline.check("delete_range", partition)?;
        let doomed = self.tables.count(partition, range);
        if doomed == 0 {
            return Ok(0);
        }
        let op = LogOp::DeleteRange {
            partition: partition.to_string(),
            start: range.start.clone(),
            end: range.end.clone(),
        };
        self.commit(&mut writer, "delete_range", op, partition)?;
        Ok(doomed)
    }

    fn scan(
        &self,
        partition: &str,
        range: &ScanRange,
        reverse: bool,
        limit: Option<usize>,
        deadline: Deadline,
    ) -> Result<Vec<Entry>> {
        deadline.check("scan", partition)?;
        Ok(self.tables.scan(partition, range, reverse, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> FileBackend {
        FileBackend::open(FileBackendConfig {
            path: dir.path().join("hub"),
            sync_every_write: true,
            create_if_missing: true,
        })
        .unwrap()
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = open(&dir);
            backend.put("p", b"a", b"1".to_vec(), Deadline::none()).unwrap();
            backend.put("p", b"b", b"2".to_vec(), Deadline::none()).unwrap();
            backend.delete("p", b"a", Deadline::none()).unwrap();
            assert!(backend
                .compare_and_swap("p", b"c", None, b"3".to_vec(), Deadline::none())
                .unwrap());
        }

        let backend = open(&dir);
        assert_eq!(backend.get("p", b"a", Deadline::none()).unwrap(), None);
        assert_eq!(backend.get("p", b"b", Deadline::none()).unwrap(), Some(b"2".to_vec()));
        assert_eq!(backend.get("p", b"c", Deadline::none()).unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let _first = open(&dir);
        let second = FileBackend::open(FileBackendConfig {
            path: dir.path().join("hub"),
            ..Default::default()
        });
        assert!(matches!(second, Err(HubError::Locked)));
    }

    #[test]
    fn test_missing_dir_without_create() {
        let dir = TempDir::new().unwrap();
        let result = FileBackend::open(FileBackendConfig {
            path: dir.path().join("absent"),
            sync_every_write: false,
            create_if_missing: false,
        });
        assert!(matches!(result, Err(HubError::InvalidFormat(_))));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let backend = open(&dir);
            backend.put("p", b"a", b"1".to_vec(), Deadline::none()).unwrap();
        }

        // Half-written entry at the end of the log.
        let log_path = dir.path().join("hub").join(LOG_FILE);
        let intact_len = fs::metadata(&log_path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        let backend = open(&dir);
        assert_eq!(backend.get("p", b"a", Deadline::none()).unwrap(), Some(b"1".to_vec()));
        assert_eq!(fs::metadata(&log_path).unwrap().len(), intact_len);

        backend.put("p", b"b", b"2".to_vec(), Deadline::none()).unwrap();
        drop(backend);
        let backend = open(&dir);
        assert_eq!(backend.get("p", b"b", Deadline::none()).unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_compact_keeps_live_state() {
        let dir = TempDir::new().unwrap();
        {
            let backend = open(&dir);
            for i in 0..50u8 {
                backend.put("p", &[i], vec![i], Deadline::none()).unwrap();
            }
            backend
                .delete_range("p", &ScanRange::between(vec![0u8], vec![40u8]), Deadline::none())
                .unwrap();

            let before = fs::metadata(dir.path().join("hub").join(LOG_FILE)).unwrap().len();
            backend.compact().unwrap();
            let after = fs::metadata(dir.path().join("hub").join(LOG_FILE)).unwrap().len();
            assert!(after < before);

            backend.put("p", &[99], vec![99], Deadline::none()).unwrap();
        }

        let backend = open(&dir);
        let keys: Vec<_> = backend
            .scan("p", &ScanRange::all(), false, None, Deadline::none())
            .unwrap()
            .into_iter()
            .map(|(k, _)| k[0])
            .collect();
        assert_eq!(keys, vec![40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 99]);
    }
}
