// Beacon model: definitions and their persisted form

pub mod beacon;

use serde::{Deserialize, Serialize};

pub use beacon::{
    ActiveState, AdvertiseMode, AdvertiseSettings, AdvertiseState, Beacon, BeaconKind,
    TxPowerLevel,
};

/// JSON body stored for each beacon. Status and storage id live outside the
/// body (status byte and key) so they can be filtered without parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconRecord {
    pub name: Option<String>,
    pub kind: BeaconKind,
    pub settings: AdvertiseSettings,
    pub payload_hex: String,
    pub created_at: u64,
}
