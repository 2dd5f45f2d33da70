// Store module: durable beacon records

pub mod backend;
pub mod beacons;

pub use backend::{BackendError, BackendOpener, MemoryStorage, SledOpener, SledStorage, StorageBackend};
pub use beacons::{BeaconStore, RawRecord, RecordCursor, StoreError};
