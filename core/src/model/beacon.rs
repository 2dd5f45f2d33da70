// Beacon definitions tracked by the registry
//
// A beacon carries a persistent storage id (0 until saved) and a process-local
// uuid that is regenerated every time the beacon is materialized. Runtime state
// (active/advertise) is interior-mutable so the registry, the advertising
// service and the host can share one `Arc<Beacon>`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a beacon definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveState {
    /// Held by the registry and advertising (or waiting to)
    Enabled,
    /// Held by the registry but not advertising
    Paused,
    /// Exists only in storage
    Stopped,
}

impl ActiveState {
    /// Status byte used by the storage layout
    pub fn to_byte(self) -> u8 {
        match self {
            ActiveState::Enabled => 0,
            ActiveState::Paused => 1,
            ActiveState::Stopped => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ActiveState::Enabled),
            1 => Some(ActiveState::Paused),
            2 => Some(ActiveState::Stopped),
            _ => None,
        }
    }

    /// Enabled or paused
    pub fn is_active(self) -> bool {
        !matches!(self, ActiveState::Stopped)
    }
}

impl fmt::Display for ActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveState::Enabled => write!(f, "Enabled"),
            ActiveState::Paused => write!(f, "Paused"),
            ActiveState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Radio-level state, owned by the advertising service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertiseState {
    Idle,
    Advertising,
    Failed(String),
}

impl fmt::Display for AdvertiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvertiseState::Idle => write!(f, "Idle"),
            AdvertiseState::Advertising => write!(f, "Advertising"),
            AdvertiseState::Failed(reason) => write!(f, "Failed ({})", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeaconKind {
    IBeacon,
    EddystoneUid,
    EddystoneUrl,
    AltBeacon,
    Raw,
}

impl fmt::Display for BeaconKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BeaconKind::IBeacon => write!(f, "iBeacon"),
            BeaconKind::EddystoneUid => write!(f, "Eddystone-UID"),
            BeaconKind::EddystoneUrl => write!(f, "Eddystone-URL"),
            BeaconKind::AltBeacon => write!(f, "AltBeacon"),
            BeaconKind::Raw => write!(f, "Raw"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertiseMode {
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPowerLevel {
    UltraLow,
    Low,
    Medium,
    High,
}

/// Radio parameters handed to the advertiser driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    pub tx_power: TxPowerLevel,
    pub connectable: bool,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::Balanced,
            tx_power: TxPowerLevel::Medium,
            connectable: false,
        }
    }
}

#[derive(Debug)]
struct RuntimeState {
    active: ActiveState,
    advertise: AdvertiseState,
}

/// A BLE beacon definition
#[derive(Debug)]
pub struct Beacon {
    uuid: Uuid,
    saved_id: i64,
    name: Option<String>,
    kind: BeaconKind,
    settings: AdvertiseSettings,
    payload: Vec<u8>,
    created_at: u64,
    state: RwLock<RuntimeState>,
}

impl Beacon {
    /// Create an unsaved, enabled beacon
    pub fn new(kind: BeaconKind, payload: Vec<u8>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            saved_id: 0,
            name: None,
            kind,
            settings: AdvertiseSettings::default(),
            payload,
            created_at: current_timestamp(),
            state: RwLock::new(RuntimeState {
                active: ActiveState::Enabled,
                advertise: AdvertiseState::Idle,
            }),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_settings(mut self, settings: AdvertiseSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_active_state(self, state: ActiveState) -> Self {
        self.state.write().active = state;
        self
    }

    pub(crate) fn restore(
        saved_id: i64,
        record: super::BeaconRecord,
        payload: Vec<u8>,
        active: ActiveState,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            saved_id,
            name: record.name,
            kind: record.kind,
            settings: record.settings,
            payload,
            created_at: record.created_at,
            state: RwLock::new(RuntimeState {
                active,
                advertise: AdvertiseState::Idle,
            }),
        }
    }

    pub(crate) fn set_saved_id(&mut self, saved_id: i64) {
        self.saved_id = saved_id;
    }

    /// Process-local identifier; not stable across restarts
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Persistent storage id, 0 if never saved
    pub fn saved_id(&self) -> i64 {
        self.saved_id
    }

    pub fn is_saved(&self) -> bool {
        self.saved_id > 0
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{} #{}", self.kind, self.saved_id),
        }
    }

    pub fn kind(&self) -> BeaconKind {
        self.kind
    }

    pub fn settings(&self) -> AdvertiseSettings {
        self.settings
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn active_state(&self) -> ActiveState {
        self.state.read().active
    }

    pub fn set_active_state(&self, state: ActiveState) {
        self.state.write().active = state;
    }

    pub fn advertise_state(&self) -> AdvertiseState {
        self.state.read().advertise.clone()
    }

    pub fn set_advertise_state(&self, state: AdvertiseState) {
        self.state.write().advertise = state;
    }

    /// Persisted body of this beacon
    pub fn to_record(&self) -> super::BeaconRecord {
        super::BeaconRecord {
            name: self.name.clone(),
            kind: self.kind,
            settings: self.settings,
            payload_hex: hex::encode(&self.payload),
            created_at: self.created_at,
        }
    }
}

pub(crate) fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
