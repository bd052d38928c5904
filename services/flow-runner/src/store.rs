//! Persisted state files
//!
//! Every persisted JSON document goes through [`StateFile`]: lock, load,
//! mutate, write to a temp file, fsync, rename. Readers take a shared lock
//! and never observe a partial write. Unparseable files are moved aside and
//! replaced by defaults.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Advisory lock on a sidecar `<file>.lock`, released on drop
pub(crate) struct FileLock {
    #[allow(dead_code)]
    file: File,
}

impl FileLock {
    pub(crate) fn shared(target: &Path) -> Result<Self, StoreError> {
        Self::acquire(target, false)
    }

    pub(crate) fn exclusive(target: &Path) -> Result<Self, StoreError> {
        Self::acquire(target, true)
    }

    fn acquire(target: &Path, exclusive: bool) -> Result<Self, StoreError> {
        let lock_path = sidecar(target, ".lock");
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;
        flock(&file, exclusive).map_err(|e| StoreError::io(&lock_path, e))?;
        Ok(Self { file })
    }
}

#[cfg(unix)]
fn flock(file: &File, exclusive: bool) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let op = if exclusive {
        libc::LOCK_EX
    } else {
        libc::LOCK_SH
    };
    // SAFETY: the descriptor is owned by `file` and stays open for the call
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _exclusive: bool) -> io::Result<()> {
    Ok(())
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// A JSON document persisted with atomic replace semantics
#[derive(Debug, Clone)]
pub struct StateFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load under a shared lock; missing or corrupt files yield the default
    pub fn load(&self) -> Result<T, StoreError> {
        let _lock = FileLock::shared(&self.path)?;
        self.read_unlocked()
    }

    /// Replace the document
    pub fn store(&self, value: &T) -> Result<(), StoreError> {
        let _lock = FileLock::exclusive(&self.path)?;
        self.write_unlocked(value)
    }

    /// Read-modify-write under one exclusive lock
    pub fn update<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> Result<R, StoreError> {
        let _lock = FileLock::exclusive(&self.path)?;
        let mut value = self.read_unlocked()?;
        let result = mutate(&mut value);
        self.write_unlocked(&value)?;
        Ok(result)
    }

    fn read_unlocked(&self) -> Result<T, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} not found, using defaults", self.path.display());
                return Ok(T::default());
            }
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(e) => {
                let aside = sidecar(
                    &self.path,
                    &format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")),
                );
                fs::rename(&self.path, &aside).map_err(|err| StoreError::io(&self.path, err))?;
                warn!(
                    "Quarantined unreadable state file {} -> {} ({}); loading defaults",
                    self.path.display(),
                    aside.display(),
                    e
                );
                Ok(T::default())
            }
        }
    }

    fn write_unlocked(&self, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        let json = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialize {
            path: self.path.clone(),
            source: e,
        })?;

        let tmp = sidecar(&self.path, ".tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
            file.write_all(&json).map_err(|e| StoreError::io(&tmp, e))?;
            file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }
}

/// Append-only JSON-lines log
#[derive(Debug, Clone)]
pub struct JsonlLog<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonlLog<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &T) -> Result<(), StoreError> {
        let _lock = FileLock::exclusive(&self.path)?;
        let mut line = serde_json::to_string(record).map_err(|e| StoreError::Serialize {
            path: self.path.clone(),
            source: e,
        })?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.sync_data().map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }

    /// Read every well-formed record; malformed lines are skipped
    pub fn read_all(&self) -> Result<Vec<T>, StoreError> {
        let _lock = FileLock::shared(&self.path)?;
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| StoreError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(
                "Skipped {} malformed line(s) in {}",
                skipped,
                self.path.display()
            );
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
        label: String,
    }

    #[test]
    fn test_missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let file: StateFile<Counter> = StateFile::new(dir.path().join("counter.json"));
        assert_eq!(file.load().unwrap(), Counter::default());
    }

    #[test]
    fn test_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let file: StateFile<Counter> = StateFile::new(dir.path().join("counter.json"));

        let seen = file.update(|c| {
            c.value += 1;
            c.value
        });
        assert_eq!(seen.unwrap(), 1);
        file.update(|c| c.value += 1).unwrap();

        assert_eq!(file.load().unwrap().value, 2);
        assert!(!dir.path().join("counter.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        fs::write(&path, b"{\"value\": 3, \"label\":").unwrap();

        let file: StateFile<Counter> = StateFile::new(&path);
        assert_eq!(file.load().unwrap(), Counter::default());

        let quarantined: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("weights.json.corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_concurrent_updates_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let file: StateFile<Counter> = StateFile::new(path);
                    for _ in 0..10 {
                        file.update(|c| c.value += 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let file: StateFile<Counter> = StateFile::new(&path);
        assert_eq!(file.load().unwrap().value, 80);
    }

    #[test]
    fn test_jsonl_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log: JsonlLog<Counter> = JsonlLog::new(dir.path().join("outcomes.jsonl"));

        log.append(&Counter {
            value: 1,
            label: "a".into(),
        })
        .unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(log.path()).unwrap();
            writeln!(f, "{{not json").unwrap();
        }
        log.append(&Counter {
            value: 2,
            label: "b".into(),
        })
        .unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value, 2);
    }
}
