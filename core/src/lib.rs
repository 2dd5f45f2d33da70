// Beacons Core: lifecycle coordination for BLE beacon definitions
//
// The registry restores active beacons from storage, answers lookups, and
// drives the background advertising service. Radio drivers, platform
// services and payload encoding plug in through the traits exported here.

pub mod config;
pub mod context;
pub mod events;
pub mod model;
pub mod registry;
pub mod service;
pub mod store;

use thiserror::Error;

pub use config::{ConfigError, RegistryConfig};
pub use context::{AppContext, ContextHandle};
pub use events::{BeaconEvent, EventKind, EventNotifier, LocalBroadcaster};
pub use model::{
    ActiveState, AdvertiseMode, AdvertiseSettings, AdvertiseState, Beacon, BeaconKind,
    TxPowerLevel,
};
pub use registry::{ActiveList, BeaconRegistry};
pub use service::{
    Advertiser, AdvertisingService, BleService, ServiceError, ServiceState, ServiceStats,
};
pub use store::{
    BackendOpener, BeaconStore, MemoryStorage, RawRecord, RecordCursor, SledOpener, StoreError,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum BeaconsError {
    #[error("Beacon registry not initialized")]
    NotInitialized,
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
