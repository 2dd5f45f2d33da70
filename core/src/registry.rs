//! Beacon registry: the in-memory set of active beacons
//!
//! The registry sits between the beacon store and the advertising service.
//! `initialize` attaches the store on first call and restores every
//! non-stopped beacon exactly once per session. A session ends when the
//! advertising service reports that it was destroyed, whether or not
//! `shutdown` asked for it.
//!
//! All registry state lives behind one mutex. Collaborators (service, event
//! notifier) are only called after it is released, because the service calls
//! back into the registry.

use crate::config::RegistryConfig;
use crate::context::{AppContext, ContextHandle};
use crate::events::{BeaconEvent, EventKind, EventNotifier};
use crate::model::{ActiveState, Beacon};
use crate::service::AdvertisingService;
use crate::store::{BackendOpener, BeaconStore, RecordCursor};
use crate::BeaconsError;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use uuid::Uuid;

/// Live, shared view of the active set.
///
/// Clones refer to the same list: changes made through the registry are
/// visible to every holder. Insertion order is preserved and uuids are unique.
#[derive(Debug, Clone, Default)]
pub struct ActiveList {
    items: Arc<RwLock<Vec<Arc<Beacon>>>>,
}

impl ActiveList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Copy of the current members, in order
    pub fn snapshot(&self) -> Vec<Arc<Beacon>> {
        self.items.read().clone()
    }

    pub fn find_by_uuid(&self, uuid: Uuid) -> Option<Arc<Beacon>> {
        self.items.read().iter().find(|b| b.uuid() == uuid).cloned()
    }

    pub fn find_by_storage_id(&self, storage_id: i64) -> Option<Arc<Beacon>> {
        self.items
            .read()
            .iter()
            .find(|b| b.saved_id() == storage_id)
            .cloned()
    }

    /// Whether this exact instance is a member
    pub fn contains(&self, beacon: &Arc<Beacon>) -> bool {
        self.items.read().iter().any(|b| Arc::ptr_eq(b, beacon))
    }

    /// Append unless a beacon with the same uuid is already present
    pub fn push(&self, beacon: Arc<Beacon>) -> bool {
        let mut items = self.items.write();
        if items.iter().any(|b| b.uuid() == beacon.uuid()) {
            return false;
        }
        items.push(beacon);
        true
    }

    pub fn remove(&self, uuid: Uuid) -> Option<Arc<Beacon>> {
        let mut items = self.items.write();
        let index = items.iter().position(|b| b.uuid() == uuid)?;
        Some(items.remove(index))
    }

    pub fn clear(&self) {
        self.items.write().clear();
    }

    fn remove_all(&self, beacons: &[Arc<Beacon>]) {
        self.items
            .write()
            .retain(|b| !beacons.iter().any(|r| Arc::ptr_eq(r, b)));
    }
}

#[derive(Default)]
struct RegistryState {
    store: Option<Arc<BeaconStore>>,
    context: ContextHandle,
    active: Option<ActiveList>,
    initialized: bool,
}

impl RegistryState {
    fn store(&self) -> Result<Arc<BeaconStore>, BeaconsError> {
        self.store.clone().ok_or(BeaconsError::NotInitialized)
    }

    fn active(&mut self) -> ActiveList {
        self.active.get_or_insert_with(ActiveList::new).clone()
    }
}

pub struct BeaconRegistry {
    config: RegistryConfig,
    opener: Arc<dyn BackendOpener>,
    service: Arc<dyn AdvertisingService>,
    notifier: Arc<dyn EventNotifier>,
    state: Mutex<RegistryState>,
}

impl BeaconRegistry {
    pub fn new(
        config: RegistryConfig,
        opener: Arc<dyn BackendOpener>,
        service: Arc<dyn AdvertisingService>,
        notifier: Arc<dyn EventNotifier>,
    ) -> Result<Self, BeaconsError> {
        config.validate()?;

        Ok(Self {
            config,
            opener,
            service,
            notifier,
            state: Mutex::new(RegistryState::default()),
        })
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Attach to `context`, restoring active beacons if this session has not yet.
    ///
    /// Safe to call repeatedly; later calls only refresh the context handle
    /// unless the advertising service was destroyed in between.
    pub fn initialize(&self, context: &Arc<AppContext>) -> Result<(), BeaconsError> {
        let restored = {
            let mut state = self.state.lock();

            if state.store.is_some() {
                state.context.replace(context);
                tracing::debug!("Beacon registry re-initialized");
            } else {
                tracing::debug!("Initializing beacon registry");
                context.purge_legacy_preferences(&self.config.legacy_preferences_name);
                let store =
                    BeaconStore::open(self.opener.as_ref(), context, &self.config.database_name)?;
                state.store = Some(Arc::new(store));
                state.context.replace(context);
            }

            if state.initialized {
                return Ok(());
            }
            state.initialized = true;

            match self.restore(&mut state) {
                Ok(restored) => restored,
                Err(e) => {
                    state.initialized = false;
                    return Err(e);
                }
            }
        };

        for beacon in &restored {
            self.notifier
                .publish(BeaconEvent::new(EventKind::Added, beacon.clone()));
        }

        if !restored.is_empty() {
            self.start_service(context);
        }
        Ok(())
    }

    fn restore(&self, state: &mut RegistryState) -> Result<Vec<Arc<Beacon>>, BeaconsError> {
        let store = state.store()?;
        let active = state.active();
        let mut restored = Vec::new();
        let mut failure = None;

        let mut cursor = store.query_all(false);
        loop {
            let raw = match cursor.next() {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                None => break,
            };
            let Some(beacon) = store.materialize(&raw) else {
                continue;
            };
            if active.find_by_storage_id(beacon.saved_id()).is_some() {
                tracing::debug!("Beacon {} already active, not restoring", beacon.saved_id());
                continue;
            }

            let beacon = Arc::new(beacon);
            tracing::debug!(
                "Restored beacon {} ({})",
                beacon.saved_id(),
                beacon.active_state()
            );
            active.push(beacon.clone());
            restored.push(beacon);
        }
        cursor.close();

        if let Some(e) = failure {
            tracing::error!("Beacon restore failed after {} record(s): {}", restored.len(), e);
            active.remove_all(&restored);
            return Err(e.into());
        }

        tracing::info!("Restored {} active beacon(s)", restored.len());
        Ok(restored)
    }

    fn start_service(&self, context: &AppContext) {
        if !context.supports_background_services() {
            tracing::debug!(
                "Api level {} cannot host the advertising service",
                context.api_level()
            );
            return;
        }
        if let Err(e) = self.service.request_start(context) {
            tracing::warn!("Advertising service start request failed: {}", e);
        }
    }

    /// Stop the advertising service and release the context.
    ///
    /// The active set survives until the service reports it was destroyed.
    pub fn shutdown(&self) {
        let context = {
            let mut state = self.state.lock();
            let context = state.context.get();
            state.context.clear();
            context
        };

        if let Some(context) = context {
            tracing::info!("Shutting down beacon registry");
            if let Err(e) = self.service.request_stop(&context) {
                tracing::warn!("Advertising service stop request failed: {}", e);
            }
        }
    }

    /// Called by the advertising service when it terminates, for any reason
    pub fn on_service_destroyed(&self) {
        let mut state = self.state.lock();
        if state.store.is_none() {
            return;
        }
        if let Some(active) = &state.active {
            active.clear();
        }
        state.initialized = false;
        tracing::info!("Advertising service destroyed; active beacons released");
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// The host context, if still available
    pub fn context(&self) -> Result<Option<Arc<AppContext>>, BeaconsError> {
        let state = self.state.lock();
        state.store()?;
        Ok(state.context.get())
    }

    // ------------------------------------------------------------------------
    // LOOKUPS
    // ------------------------------------------------------------------------

    /// Active beacon with this process-local id
    pub fn find_active_by_unique_id(
        &self,
        uuid: Option<Uuid>,
    ) -> Result<Option<Arc<Beacon>>, BeaconsError> {
        let Some(uuid) = uuid else {
            return Ok(None);
        };
        Ok(self.get_active()?.find_by_uuid(uuid))
    }

    /// Active beacon with this storage id; non-positive ids are never found
    pub fn find_active_by_storage_id(
        &self,
        storage_id: i64,
    ) -> Result<Option<Arc<Beacon>>, BeaconsError> {
        if storage_id <= 0 {
            return Ok(None);
        }
        Ok(self.get_active()?.find_by_storage_id(storage_id))
    }

    /// The active instance if there is one, otherwise a fresh copy from storage
    pub fn get_saved(&self, storage_id: i64) -> Result<Option<Arc<Beacon>>, BeaconsError> {
        if let Some(beacon) = self.find_active_by_storage_id(storage_id)? {
            return Ok(Some(beacon));
        }

        let store = self.state.lock().store()?;
        let mut cursor = store.query(storage_id)?;
        let beacon = match cursor.next() {
            Some(Ok(raw)) => store.materialize(&raw).map(Arc::new),
            Some(Err(e)) => {
                cursor.close();
                return Err(e.into());
            }
            None => None,
        };
        cursor.close();
        Ok(beacon)
    }

    /// The live active set, allocated on first use
    pub fn get_active(&self) -> Result<ActiveList, BeaconsError> {
        let mut state = self.state.lock();
        state.store()?;
        Ok(state.active())
    }

    /// The live active set, or `None` if it was never allocated
    pub fn get_active_if_any(&self) -> Result<Option<ActiveList>, BeaconsError> {
        let state = self.state.lock();
        state.store()?;
        Ok(state.active.clone())
    }

    /// Cursor over every stopped beacon record in storage
    pub fn get_stopped(&self) -> Result<RecordCursor, BeaconsError> {
        let store = self.state.lock().store()?;
        Ok(store.query_all(true))
    }

    /// Stopped beacons, materialized. Unreadable records are skipped.
    pub fn stopped_beacons(&self) -> Result<Vec<Beacon>, BeaconsError> {
        let store = self.state.lock().store()?;
        let mut cursor = store.query_all(true);
        let mut beacons = Vec::new();
        let mut failure = None;
        for item in cursor.by_ref() {
            match item {
                Ok(raw) => beacons.extend(store.materialize(&raw)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        cursor.close();
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(beacons),
        }
    }

    // ------------------------------------------------------------------------
    // MUTATIONS
    // ------------------------------------------------------------------------

    /// Persist a beacon and make it active.
    ///
    /// Stopped beacons are re-enabled; paused ones stay paused.
    pub fn add(&self, beacon: Beacon) -> Result<Arc<Beacon>, BeaconsError> {
        let mut beacon = beacon;
        if !beacon.active_state().is_active() {
            beacon.set_active_state(ActiveState::Enabled);
        }

        let (beacon, context) = {
            let mut state = self.state.lock();
            let store = state.store()?;
            let active = state.active();
            if beacon.is_saved() && active.find_by_storage_id(beacon.saved_id()).is_some() {
                return Err(BeaconsError::InvalidInput(format!(
                    "beacon {} is already active",
                    beacon.saved_id()
                )));
            }

            store.save(&mut beacon)?;
            let beacon = Arc::new(beacon);
            active.push(beacon.clone());
            tracing::info!("Beacon {} added", beacon.saved_id());
            (beacon, state.context.get())
        };

        self.notifier
            .publish(BeaconEvent::new(EventKind::Added, beacon.clone()));
        if let Some(context) = context {
            self.start_service(&context);
        }
        Ok(beacon)
    }

    /// Mark an active beacon stopped and drop it from the active set.
    ///
    /// Stops the advertising service once nothing is left active.
    pub fn stop(&self, uuid: Uuid) -> Result<Option<Arc<Beacon>>, BeaconsError> {
        let (beacon, now_empty, context) = {
            let mut state = self.state.lock();
            let store = state.store()?;
            let active = state.active();
            let Some(beacon) = active.find_by_uuid(uuid) else {
                return Ok(None);
            };

            if beacon.is_saved() {
                store.set_status(beacon.saved_id(), ActiveState::Stopped)?;
            }
            beacon.set_active_state(ActiveState::Stopped);
            active.remove(uuid);
            tracing::info!("Beacon {} stopped", beacon.saved_id());
            (beacon, active.is_empty(), state.context.get())
        };

        self.notifier
            .publish(BeaconEvent::new(EventKind::Stopped, beacon.clone()));
        if let Some(context) = context {
            if now_empty {
                if let Err(e) = self.service.request_stop(&context) {
                    tracing::warn!("Advertising service stop request failed: {}", e);
                }
            } else {
                self.start_service(&context);
            }
        }
        Ok(Some(beacon))
    }

    /// Pause or resume an active beacon
    pub fn set_paused(
        &self,
        uuid: Uuid,
        paused: bool,
    ) -> Result<Option<Arc<Beacon>>, BeaconsError> {
        let target = if paused {
            ActiveState::Paused
        } else {
            ActiveState::Enabled
        };

        let (beacon, context) = {
            let mut state = self.state.lock();
            let store = state.store()?;
            let Some(beacon) = state.active().find_by_uuid(uuid) else {
                return Ok(None);
            };
            if beacon.active_state() == target {
                return Ok(Some(beacon));
            }

            if beacon.is_saved() {
                store.set_status(beacon.saved_id(), target)?;
            }
            beacon.set_active_state(target);
            tracing::info!("Beacon {} {}", beacon.saved_id(), target);
            (beacon, state.context.get())
        };

        if paused {
            self.notifier
                .publish(BeaconEvent::new(EventKind::Paused, beacon.clone()));
        }
        if let Some(context) = context {
            self.start_service(&context);
        }
        Ok(Some(beacon))
    }

    /// Remove a stopped beacon from storage
    pub fn delete(&self, storage_id: i64) -> Result<bool, BeaconsError> {
        if self.find_active_by_storage_id(storage_id)?.is_some() {
            return Err(BeaconsError::InvalidInput(format!(
                "beacon {} is active; stop it before deleting",
                storage_id
            )));
        }
        if storage_id <= 0 {
            return Ok(false);
        }
        let store = self.state.lock().store()?;
        Ok(store.delete(storage_id)?)
    }
}
