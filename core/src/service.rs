//! Background advertising service
//!
//! [`AdvertisingService`] is what the registry drives: fire-and-forget start
//! and stop requests. [`BleService`] is the reference implementation. It keeps
//! the radio (an [`Advertiser`] driver supplied by the platform) in step with
//! the registry's active set and reports its own teardown back to the registry.

use crate::context::AppContext;
use crate::events::{BeaconEvent, EventKind, EventNotifier};
use crate::model::{ActiveState, AdvertiseState, Beacon};
use crate::registry::BeaconRegistry;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Starting => write!(f, "Starting"),
            ServiceState::Running => write!(f, "Running"),
            ServiceState::Stopping => write!(f, "Stopping"),
            ServiceState::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum ServiceError {
    #[error("Invalid state transition from {0}")]
    InvalidStateTransition(ServiceState),
    #[error("Background services unsupported at api level {0}")]
    Unsupported(u32),
}

/// Requests the registry issues to the advertising service
pub trait AdvertisingService: Send + Sync {
    fn request_start(&self, context: &AppContext) -> Result<(), ServiceError>;
    fn request_stop(&self, context: &AppContext) -> Result<(), ServiceError>;
}

/// Platform radio driver
pub trait Advertiser: Send + Sync {
    fn start_advertising(&self, beacon: &Beacon) -> Result<(), String>;
    fn stop_advertising(&self, beacon: &Beacon) -> Result<(), String>;
}

/// Service statistics
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    pub starts: u64,
    pub stops: u64,
    pub advertise_failures: u64,
}

/// Reference advertising service
pub struct BleService {
    state: RwLock<ServiceState>,
    advertiser: Arc<dyn Advertiser>,
    notifier: Arc<dyn EventNotifier>,
    registry: RwLock<Weak<BeaconRegistry>>,
    advertising: Mutex<Vec<Arc<Beacon>>>,
    stats: RwLock<ServiceStats>,
}

impl BleService {
    pub fn new(advertiser: Arc<dyn Advertiser>, notifier: Arc<dyn EventNotifier>) -> Self {
        Self {
            state: RwLock::new(ServiceState::Stopped),
            advertiser,
            notifier,
            registry: RwLock::new(Weak::new()),
            advertising: Mutex::new(Vec::new()),
            stats: RwLock::new(ServiceStats::default()),
        }
    }

    /// Point the service at the registry it serves
    pub fn attach(&self, registry: &Arc<BeaconRegistry>) {
        *self.registry.write() = Arc::downgrade(registry);
    }

    pub fn get_state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn get_stats(&self) -> ServiceStats {
        self.stats.read().clone()
    }

    /// Beacons currently on air
    pub fn advertising(&self) -> Vec<Arc<Beacon>> {
        self.advertising.lock().clone()
    }

    /// Bring the radio in line with the registry's active set
    pub fn reconcile(&self) {
        let desired: Vec<Arc<Beacon>> = match self.registry.read().upgrade() {
            Some(registry) => match registry.get_active_if_any() {
                Ok(Some(active)) => active
                    .snapshot()
                    .into_iter()
                    .filter(|b| b.active_state() == ActiveState::Enabled)
                    .collect(),
                Ok(None) | Err(_) => Vec::new(),
            },
            None => {
                tracing::debug!("Advertising service has no registry attached");
                Vec::new()
            }
        };

        let mut events = Vec::new();
        {
            let mut advertising = self.advertising.lock();

            advertising.retain(|beacon| {
                if desired.iter().any(|d| Arc::ptr_eq(d, beacon)) {
                    return true;
                }
                if let Err(e) = self.advertiser.stop_advertising(beacon) {
                    tracing::warn!("Failed to stop advertising {}: {}", beacon.saved_id(), e);
                }
                // Already announced by the registry as paused or stopped
                beacon.set_advertise_state(AdvertiseState::Idle);
                false
            });

            for beacon in desired {
                if advertising.iter().any(|a| Arc::ptr_eq(a, &beacon)) {
                    continue;
                }
                match self.advertiser.start_advertising(&beacon) {
                    Ok(()) => {
                        beacon.set_advertise_state(AdvertiseState::Advertising);
                        advertising.push(beacon.clone());
                        events.push(BeaconEvent::new(EventKind::Started, beacon));
                    }
                    Err(e) => {
                        tracing::warn!("Failed to advertise {}: {}", beacon.saved_id(), e);
                        self.stats.write().advertise_failures += 1;
                        beacon.set_advertise_state(AdvertiseState::Failed(e));
                        events.push(BeaconEvent::new(EventKind::Failed, beacon));
                    }
                }
            }
        }

        for event in events {
            self.notifier.publish(event);
        }
    }

    /// The host killed the service; tear down as if stopped
    pub fn on_host_terminated(&self) {
        tracing::info!("Advertising service terminated by host");
        self.teardown();
    }

    fn teardown(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, ServiceState::Stopped | ServiceState::Stopping) {
                return;
            }
            *state = ServiceState::Stopping;
        }

        let drained: Vec<Arc<Beacon>> = std::mem::take(&mut *self.advertising.lock());
        for beacon in &drained {
            if let Err(e) = self.advertiser.stop_advertising(beacon) {
                tracing::warn!("Failed to stop advertising {}: {}", beacon.saved_id(), e);
            }
            beacon.set_advertise_state(AdvertiseState::Idle);
        }
        for beacon in drained {
            // The registry announces its own stops
            if beacon.active_state() != ActiveState::Stopped {
                self.notifier.publish(BeaconEvent::new(EventKind::Stopped, beacon));
            }
        }

        *self.state.write() = ServiceState::Stopped;
        self.stats.write().stops += 1;
        tracing::info!("Advertising service stopped");

        let registry = self.registry.read().upgrade();
        if let Some(registry) = registry {
            registry.on_service_destroyed();
        }
    }
}

impl AdvertisingService for BleService {
    fn request_start(&self, context: &AppContext) -> Result<(), ServiceError> {
        if !context.supports_background_services() {
            return Err(ServiceError::Unsupported(context.api_level()));
        }

        {
            let mut state = self.state.write();
            match *state {
                ServiceState::Stopped => {
                    *state = ServiceState::Starting;
                    self.stats.write().starts += 1;
                    tracing::info!("Advertising service starting");
                }
                ServiceState::Starting | ServiceState::Running => {}
                ServiceState::Stopping => {
                    return Err(ServiceError::InvalidStateTransition(ServiceState::Stopping))
                }
            }
        }

        self.reconcile();

        let mut state = self.state.write();
        if *state == ServiceState::Starting {
            *state = ServiceState::Running;
            tracing::info!("Advertising service running");
        }
        Ok(())
    }

    fn request_stop(&self, _context: &AppContext) -> Result<(), ServiceError> {
        self.teardown();
        Ok(())
    }
}
