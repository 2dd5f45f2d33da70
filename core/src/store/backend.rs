// Storage abstraction for beacon persistence
//
// Byte-keyed, ordered stores. Prefix scans are lazy and forward-only so the
// record cursor on top of them never holds the whole table in memory (sled),
// or holds a point-in-time snapshot of it (memory).

use crate::context::AppContext;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lazy, forward-only sequence of key/value pairs
pub type ScanIter = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), BackendError>>>;

/// Unified storage trait for beacon persistence
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), BackendError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError>;
    fn remove(&self, key: &[u8]) -> Result<(), BackendError>;
    /// Entries whose key starts with `prefix`, in ascending key order
    fn scan_prefix(&self, prefix: &[u8]) -> ScanIter;
    fn flush(&self) -> Result<(), BackendError>;
}

/// Opens the named store for a host context.
///
/// The registry opens its store once per lifetime. Openers need not hand out
/// a second live handle to the same store; `SledOpener` cannot while the first
/// is alive, because sled holds a file lock.
pub trait BackendOpener: Send + Sync {
    fn open(
        &self,
        context: &AppContext,
        name: &str,
    ) -> Result<Arc<dyn StorageBackend>, BackendError>;
}

/// In-memory storage for tests and hosts without a writable data directory.
/// Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), BackendError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<(), BackendError> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> ScanIter {
        // Snapshot so the cursor does not hold the lock while the caller iterates
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Box::new(snapshot.into_iter().map(Ok))
    }

    fn flush(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

impl BackendOpener for MemoryStorage {
    fn open(
        &self,
        _context: &AppContext,
        _name: &str,
    ) -> Result<Arc<dyn StorageBackend>, BackendError> {
        Ok(Arc::new(self.clone()))
    }
}

pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn new(path: impl AsRef<std::path::Path>) -> Result<Self, BackendError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), BackendError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError> {
        let value = self.db.get(key)?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<(), BackendError> {
        self.db.remove(key)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> ScanIter {
        Box::new(self.db.scan_prefix(prefix).map(|item| {
            let (k, v) = item?;
            Ok((k.to_vec(), v.to_vec()))
        }))
    }

    fn flush(&self) -> Result<(), BackendError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Opens `<data_dir>/<name>` as a sled database
#[derive(Debug, Clone, Copy, Default)]
pub struct SledOpener;

impl BackendOpener for SledOpener {
    fn open(
        &self,
        context: &AppContext,
        name: &str,
    ) -> Result<Arc<dyn StorageBackend>, BackendError> {
        std::fs::create_dir_all(context.data_dir())?;
        let path = context.data_dir().join(name);
        tracing::debug!("Opening beacon store at {}", path.display());
        Ok(Arc::new(SledStorage::new(path)?))
    }
}
