// Beacon record store
//
// Layout:
//   beacon/<u64 BE storage id>  ->  [status byte] ++ JSON BeaconRecord
//   meta/next_id                ->  u64 BE
//
// Big-endian ids keep prefix scans in insertion order. The status byte sits
// outside the JSON body so active/stopped filtering never parses records.

use super::backend::{BackendError, BackendOpener, ScanIter, StorageBackend};
use crate::context::AppContext;
use crate::model::{ActiveState, Beacon, BeaconRecord};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

const BEACON_PREFIX: &[u8] = b"beacon/";
const NEXT_ID_KEY: &[u8] = b"meta/next_id";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Record encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("No beacon with storage id {0}")]
    NotFound(i64),
    #[error("Invalid storage id {0}")]
    InvalidId(i64),
}

fn record_key(storage_id: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(BEACON_PREFIX.len() + 8);
    key.extend_from_slice(BEACON_PREFIX);
    key.extend_from_slice(&(storage_id as u64).to_be_bytes());
    key
}

/// One undecoded row as read from the backend
#[derive(Debug, Clone)]
pub struct RawRecord {
    key: Vec<u8>,
    value: Vec<u8>,
}

impl RawRecord {
    /// Storage id encoded in the key, if well-formed and positive
    pub fn storage_id(&self) -> Option<i64> {
        let suffix = self.key.strip_prefix(BEACON_PREFIX)?;
        let bytes: [u8; 8] = suffix.try_into().ok()?;
        let id = u64::from_be_bytes(bytes);
        i64::try_from(id).ok().filter(|id| *id > 0)
    }

    /// Status byte, if it is a known one
    pub fn status(&self) -> Option<ActiveState> {
        self.value.first().copied().and_then(ActiveState::from_byte)
    }

    fn is_stopped(&self) -> bool {
        self.value.first().copied() == Some(ActiveState::Stopped.to_byte())
    }

    fn body(&self) -> &[u8] {
        self.value.get(1..).unwrap_or(&[])
    }
}

/// Forward-only, non-restartable cursor over raw beacon records.
///
/// Release it with [`RecordCursor::close`] once consumed.
pub struct RecordCursor {
    inner: Option<ScanIter>,
    stopped: Option<bool>,
    yielded: usize,
}

impl RecordCursor {
    fn new(inner: ScanIter, stopped: Option<bool>) -> Self {
        Self {
            inner: Some(inner),
            stopped,
            yielded: 0,
        }
    }

    pub fn empty() -> Self {
        Self::new(Box::new(std::iter::empty()), None)
    }

    fn accepts(&self, raw: &RawRecord) -> bool {
        match self.stopped {
            Some(stopped) => raw.is_stopped() == stopped,
            None => true,
        }
    }

    /// Records handed out so far
    pub fn position(&self) -> usize {
        self.yielded
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Release the underlying scan; returns how many records were read
    pub fn close(mut self) -> usize {
        self.inner = None;
        self.yielded
    }
}

impl Iterator for RecordCursor {
    type Item = Result<RawRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, value) = match self.inner.as_mut()?.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            let raw = RawRecord { key, value };
            if self.accepts(&raw) {
                self.yielded += 1;
                return Some(Ok(raw));
            }
        }
    }
}

impl Drop for RecordCursor {
    fn drop(&mut self) {
        if self.inner.is_some() {
            tracing::debug!(
                "Record cursor released without close after {} record(s)",
                self.yielded
            );
        }
    }
}

/// Durable store of beacon definitions
pub struct BeaconStore {
    name: String,
    backend: Arc<dyn StorageBackend>,
    id_lock: Mutex<()>,
}

impl BeaconStore {
    pub fn new(backend: Arc<dyn StorageBackend>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend,
            id_lock: Mutex::new(()),
        }
    }

    /// Open (or attach to) the store called `name` for this context
    pub fn open(
        opener: &dyn BackendOpener,
        context: &AppContext,
        name: &str,
    ) -> Result<Self, StoreError> {
        let backend = opener.open(context, name)?;
        Ok(Self::new(backend, name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All records whose stopped-ness equals `stopped`, in storage order
    pub fn query_all(&self, stopped: bool) -> RecordCursor {
        RecordCursor::new(self.backend.scan_prefix(BEACON_PREFIX), Some(stopped))
    }

    /// Zero or one record with the given storage id
    pub fn query(&self, storage_id: i64) -> Result<RecordCursor, StoreError> {
        if storage_id <= 0 {
            return Ok(RecordCursor::empty());
        }
        let key = record_key(storage_id);
        let found = self.backend.get(&key)?.map(|value| (key, value));
        Ok(RecordCursor::new(Box::new(found.into_iter().map(Ok)), None))
    }

    /// Decode a raw record. Malformed records yield `None`.
    pub fn materialize(&self, raw: &RawRecord) -> Option<Beacon> {
        let Some(storage_id) = raw.storage_id() else {
            tracing::warn!("Skipping beacon record with malformed key in {}", self.name);
            return None;
        };
        let Some(status) = raw.status() else {
            tracing::warn!("Skipping beacon {} with unknown status byte", storage_id);
            return None;
        };
        let record: BeaconRecord = match serde_json::from_slice(raw.body()) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Skipping unreadable beacon {}: {}", storage_id, e);
                return None;
            }
        };
        let payload = match hex::decode(&record.payload_hex) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Skipping beacon {} with bad payload: {}", storage_id, e);
                return None;
            }
        };
        Some(Beacon::restore(storage_id, record, payload, status))
    }

    fn allocate_id(&self) -> Result<i64, StoreError> {
        let _guard = self.id_lock.lock();
        let stored = self
            .backend
            .get(NEXT_ID_KEY)?
            .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok())
            .map(u64::from_be_bytes);
        let next = match stored {
            Some(next) => next.max(1),
            None => {
                // Counter lost or unreadable: resume after the highest record
                match self.highest_id()? {
                    Some(highest) => {
                        tracing::warn!(
                            "Beacon id counter missing in {}, resuming after {}",
                            self.name,
                            highest
                        );
                        highest as u64 + 1
                    }
                    None => 1,
                }
            }
        };

        // Bounds next + 1 as well
        let id = i64::try_from(next).map_err(|_| StoreError::InvalidId(i64::MAX))?;
        self.backend.put(NEXT_ID_KEY, &(next + 1).to_be_bytes())?;
        Ok(id)
    }

    fn highest_id(&self) -> Result<Option<i64>, StoreError> {
        let mut highest = None;
        for entry in self.backend.scan_prefix(BEACON_PREFIX) {
            let (key, value) = entry?;
            let id = RawRecord { key, value }.storage_id();
            highest = highest.max(id);
        }
        Ok(highest)
    }

    /// Persist a beacon, assigning a storage id if it has none
    pub fn save(&self, beacon: &mut Beacon) -> Result<i64, StoreError> {
        let storage_id = if beacon.is_saved() {
            beacon.saved_id()
        } else {
            self.allocate_id()?
        };

        let mut value = vec![beacon.active_state().to_byte()];
        value.extend_from_slice(&serde_json::to_vec(&beacon.to_record())?);
        self.backend.put(&record_key(storage_id), &value)?;
        self.backend.flush()?;

        beacon.set_saved_id(storage_id);
        Ok(storage_id)
    }

    /// Rewrite the status byte of a saved beacon
    pub fn set_status(&self, storage_id: i64, status: ActiveState) -> Result<(), StoreError> {
        if storage_id <= 0 {
            return Err(StoreError::InvalidId(storage_id));
        }
        let key = record_key(storage_id);
        let mut value = self
            .backend
            .get(&key)?
            .ok_or(StoreError::NotFound(storage_id))?;
        match value.first_mut() {
            Some(byte) => *byte = status.to_byte(),
            None => value.push(status.to_byte()),
        }
        self.backend.put(&key, &value)?;
        self.backend.flush()?;
        Ok(())
    }

    /// Remove a record; returns whether it existed
    pub fn delete(&self, storage_id: i64) -> Result<bool, StoreError> {
        if storage_id <= 0 {
            return Err(StoreError::InvalidId(storage_id));
        }
        let key = record_key(storage_id);
        let existed = self.backend.get(&key)?.is_some();
        if existed {
            self.backend.remove(&key)?;
            self.backend.flush()?;
        }
        Ok(existed)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush()?;
        Ok(())
    }

    /// Write raw bytes under a storage id, bypassing encoding. Test hook for
    /// corrupt-record handling.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, storage_id: i64, value: &[u8]) -> Result<(), StoreError> {
        self.backend.put(&record_key(storage_id), value)?;
        Ok(())
    }
}
