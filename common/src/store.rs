use std::{
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};

use log::warn;
use thiserror::Error;

use crate::types::PersistedRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode schedule record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("store backend failed: {0}")]
    Backend(String),
}

pub trait ScheduleStore: Send + Sync {
    /// Missing or unreadable state is `None`, never an error.
    fn load(&self) -> Option<PersistedRecord>;

    /// Must never leave a half-written record behind.
    fn save(&self, record: &PersistedRecord) -> Result<(), StoreError>;
}

pub fn decode_record(raw: &[u8]) -> Option<PersistedRecord> {
    if let Ok(record) = serde_json::from_slice::<PersistedRecord>(raw) {
        return Some(record);
    }

    let text = std::str::from_utf8(raw).ok()?.trim();
    let next_fire_time = text
        .parse::<i64>()
        .ok()
        .or_else(|| text.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v as i64))?;
    Some(PersistedRecord {
        next_fire_time,
        duration_secs: None,
        delay_interval_secs: None,
    })
}

#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomic(&self, payload: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(payload)?;
            file.sync_all()?;
        }
        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        Ok(())
    }
}

impl ScheduleStore for FileStore {
    fn load(&self) -> Option<PersistedRecord> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("failed to read schedule from {}: {err}", self.path.display());
                return None;
            }
        };

        let record = decode_record(&raw);
        if record.is_none() {
            warn!(
                "ignoring unparseable schedule record at {}",
                self.path.display()
            );
        }
        record
    }

    fn save(&self, record: &PersistedRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(record)?;
        self.write_atomic(&payload)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) use memory::MemoryStore;

#[cfg(test)]
mod memory {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct MemoryStore {
        record: Mutex<Option<PersistedRecord>>,
        fail_saves: AtomicBool,
        saves: AtomicUsize,
    }

    impl MemoryStore {
        pub(crate) fn with_record(record: PersistedRecord) -> Self {
            let store = Self::default();
            *store.record.lock().unwrap() = Some(record);
            store
        }

        pub(crate) fn set_fail_saves(&self, fail: bool) {
            self.fail_saves.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn saves(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }

        pub(crate) fn record(&self) -> Option<PersistedRecord> {
            *self.record.lock().unwrap()
        }
    }

    impl ScheduleStore for MemoryStore {
        fn load(&self) -> Option<PersistedRecord> {
            self.record()
        }

        fn save(&self, record: &PersistedRecord) -> Result<(), StoreError> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("flash write refused".to_string()));
            }
            *self.record.lock().unwrap() = Some(*record);
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
