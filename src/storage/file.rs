//! File-backed bucket storage.
//!
//! Each key is stored as one JSON file named `{prefix}{sha256(key)}.json`,
//! so the key itself never reaches the filesystem. Reads take a shared
//! `flock(2)` lock and writes an exclusive one, then truncate and rewrite the
//! whole record, so a reader never sees a half-written file. Suitable for a
//! single server; the bucket's read-compute-write cycle is still not atomic
//! across processes.

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::unistd::{access, AccessFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{BucketState, BucketStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{AegisError, Result};

/// Default file name prefix for bucket records.
pub const DEFAULT_PREFIX: &str = "ratelimit_";
/// Default time to wait for a file lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const RECORD_EXTENSION: &str = ".json";
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// On-disk record format.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    tokens: f64,
    last_refill: i64,
    expires_at: i64,
}

/// Bucket storage in a directory of JSON files.
pub struct FileStore {
    directory: PathBuf,
    prefix: String,
    lock_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl FileStore {
    /// Open a store in `directory` with the default file prefix.
    ///
    /// The directory is created if missing. Fails if it cannot be created or
    /// is not writable.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        Self::with_prefix(directory, DEFAULT_PREFIX)
    }

    /// Open a store in `directory` whose files start with `prefix`.
    pub fn with_prefix(directory: impl Into<PathBuf>, prefix: &str) -> Result<Self> {
        let directory = directory.into();

        if prefix.is_empty() || prefix.contains(&['/', '\\'][..]) || prefix.contains("..") {
            return Err(AegisError::Config(format!(
                "Invalid file prefix {:?}: must be non-empty and contain no path components",
                prefix
            )));
        }

        if !directory.exists() {
            debug!(directory = %directory.display(), "Creating rate limit directory");
            fs::create_dir_all(&directory).map_err(|e| {
                AegisError::Config(format!(
                    "Cannot create directory {}: {}",
                    directory.display(),
                    e
                ))
            })?;
        }

        if !directory.is_dir() {
            return Err(AegisError::Config(format!(
                "Not a directory: {}",
                directory.display()
            )));
        }

        access(&directory, AccessFlags::W_OK).map_err(|e| {
            AegisError::Config(format!(
                "Directory not writable: {}: {}",
                directory.display(),
                e
            ))
        })?;

        info!(
            directory = %directory.display(),
            prefix = %prefix,
            "Opened file rate limit store"
        );

        Ok(Self {
            directory,
            prefix: prefix.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            clock: Arc::new(SystemClock),
        })
    }

    /// Set how long to wait for a file lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Use the given clock for expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Path of the record file for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.directory.join(format!(
            "{}{}{}",
            self.prefix,
            hex::encode(digest),
            RECORD_EXTENSION
        ))
    }

    fn owns(&self, name: &OsStr) -> bool {
        name.to_str()
            .map(|n| n.starts_with(&self.prefix) && n.ends_with(RECORD_EXTENSION))
            .unwrap_or(false)
    }

    /// All record files belonging to this store.
    fn record_files(&self) -> Result<Vec<PathBuf>> {
        let entries =
            fs::read_dir(&self.directory).map_err(|e| AegisError::storage(&self.directory, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| AegisError::storage(&self.directory, e))?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if is_file && self.owns(&entry.file_name()) {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    /// Read a record file under a shared lock. `None` if the file is missing.
    fn read_contents(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let Some(file) = open_existing(path)? else {
            return Ok(None);
        };

        let _lock = FileLock::acquire(&file, path, false, self.lock_timeout)?;
        read_all(&file, path).map(Some)
    }

    /// Delete a record file if `stale` still holds once it is re-read under
    /// an exclusive lock. A file replaced after it was opened is left alone.
    fn remove_if<F>(&self, path: &Path, stale: F) -> Result<bool>
    where
        F: FnOnce(&fs::Metadata, &[u8]) -> bool,
    {
        let Some(file) = open_existing(path)? else {
            return Ok(false);
        };

        let _lock = FileLock::acquire(&file, path, true, self.lock_timeout)?;
        let metadata = file.metadata().map_err(|e| AegisError::storage(path, e))?;
        if !is_linked_at(&metadata, path) {
            return Ok(false);
        }

        let contents = read_all(&file, path)?;
        if !stale(&metadata, &contents) {
            return Ok(false);
        }
        Self::remove(path)
    }

    fn remove(path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AegisError::storage(path, e)),
        }
    }
}

fn open_existing(path: &Path) -> Result<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AegisError::storage(path, e)),
    }
}

fn read_all(file: &File, path: &Path) -> Result<Vec<u8>> {
    let mut contents = Vec::new();
    let mut reader = file;
    reader
        .read_to_end(&mut contents)
        .map_err(|e| AegisError::storage(path, e))?;
    Ok(contents)
}

/// Whether `path` still names the file `metadata` was taken from.
fn is_linked_at(metadata: &fs::Metadata, path: &Path) -> bool {
    fs::metadata(path)
        .map(|current| current.dev() == metadata.dev() && current.ino() == metadata.ino())
        .unwrap_or(false)
}

fn is_blank(contents: &[u8]) -> bool {
    contents.iter().all(u8::is_ascii_whitespace)
}

/// Decode a record body. Empty bodies are a writer between create and lock.
fn decode(path: &Path, contents: &[u8]) -> Option<StoredRecord> {
    if is_blank(contents) {
        return None;
    }

    match serde_json::from_slice(contents) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring corrupt rate limit record");
            None
        }
    }
}

impl BucketStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<BucketState>> {
        let path = self.path_for(key);

        let Some(contents) = self.read_contents(&path)? else {
            return Ok(None);
        };
        let Some(record) = decode(&path, &contents) else {
            return Ok(None);
        };

        let now = self.clock.now();
        if record.expires_at < now {
            debug!(key = %key, "Evicting expired bucket");
            let still_expired = |_: &fs::Metadata, contents: &[u8]| {
                serde_json::from_slice::<StoredRecord>(contents)
                    .map(|record| record.expires_at < now)
                    .unwrap_or(false)
            };
            if let Err(e) = self.remove_if(&path, still_expired) {
                warn!(error = %e, "Failed to remove expired rate limit record");
            }
            return Ok(None);
        }

        Ok(Some(BucketState::new(record.tokens, record.last_refill)))
    }

    fn set(&self, key: &str, state: BucketState, ttl_secs: u64) -> Result<()> {
        let path = self.path_for(key);
        let record = StoredRecord {
            tokens: state.tokens,
            last_refill: state.last_refill,
            expires_at: self.clock.now().saturating_add_unsigned(ttl_secs),
        };
        let body = serde_json::to_vec(&record)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| AegisError::storage(&path, e))?;

        let _lock = FileLock::acquire(&file, &path, true, self.lock_timeout)?;

        let write = || -> io::Result<()> {
            let mut writer = &file;
            file.set_len(0)?;
            writer.seek(SeekFrom::Start(0))?;
            writer.write_all(&body)?;
            writer.flush()?;
            file.sync_data()
        };
        write().map_err(|e| AegisError::storage(&path, e))
    }

    fn delete(&self, key: &str) -> Result<()> {
        Self::remove(&self.path_for(key)).map(|_| ())
    }

    fn clear(&self) -> Result<()> {
        let mut removed = 0;
        for path in self.record_files()? {
            if Self::remove(&path)? {
                removed += 1;
            }
        }
        info!(directory = %self.directory.display(), removed, "Cleared rate limit store");
        Ok(())
    }

    fn gc(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut removed = 0;

        for path in self.record_files()? {
            // Empty files are left to an in-flight writer until the lock timeout passes
            let stale = |metadata: &fs::Metadata, contents: &[u8]| {
                if is_blank(contents) {
                    return metadata
                        .modified()
                        .ok()
                        .and_then(|modified| modified.elapsed().ok())
                        .map(|age| age > self.lock_timeout)
                        .unwrap_or(false);
                }
                match decode(&path, contents) {
                    Some(record) => record.expires_at < now,
                    None => true,
                }
            };

            match self.remove_if(&path, stale) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable rate limit record"),
            }
        }

        if removed > 0 {
            info!(directory = %self.directory.display(), removed, "Garbage collected rate limit records");
        }
        Ok(removed)
    }
}

/// An advisory `flock(2)` lock, released on drop.
struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn acquire(file: &'a File, path: &Path, exclusive: bool, timeout: Duration) -> Result<Self> {
        let arg = if exclusive {
            FlockArg::LockExclusiveNonblock
        } else {
            FlockArg::LockSharedNonblock
        };
        let deadline = Instant::now() + timeout;

        loop {
            match flock(file.as_raw_fd(), arg) {
                Ok(()) => return Ok(Self { file }),
                Err(errno) if errno == Errno::EWOULDBLOCK || errno == Errno::EINTR => {
                    if Instant::now() >= deadline {
                        return Err(AegisError::LockTimeout {
                            path: path.to_path_buf(),
                            timeout,
                        });
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(errno) => return Err(AegisError::storage(path, io::Error::from(errno))),
            }
        }
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}
