// Registry lifecycle against the reference advertising service and an
// in-memory store.

use beacons_core::store::backend::{BackendError, ScanIter};
use beacons_core::store::StorageBackend;
use beacons_core::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

#[derive(Default)]
struct RecordingAdvertiser {
    on_air: Mutex<Vec<i64>>,
    fail_ids: Mutex<Vec<i64>>,
}

impl Advertiser for RecordingAdvertiser {
    fn start_advertising(&self, beacon: &Beacon) -> Result<(), String> {
        if self.fail_ids.lock().unwrap().contains(&beacon.saved_id()) {
            return Err("advertise data too large".to_string());
        }
        self.on_air.lock().unwrap().push(beacon.saved_id());
        Ok(())
    }

    fn stop_advertising(&self, beacon: &Beacon) -> Result<(), String> {
        self.on_air.lock().unwrap().retain(|id| *id != beacon.saved_id());
        Ok(())
    }
}

/// Memory storage that counts every read
#[derive(Clone, Default)]
struct CountingStorage {
    inner: MemoryStorage,
    reads: Arc<AtomicUsize>,
}

impl StorageBackend for CountingStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), BackendError> {
        self.inner.put(key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }

    fn remove(&self, key: &[u8]) -> Result<(), BackendError> {
        self.inner.remove(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> ScanIter {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.scan_prefix(prefix)
    }

    fn flush(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

impl BackendOpener for CountingStorage {
    fn open(
        &self,
        _context: &AppContext,
        _name: &str,
    ) -> Result<Arc<dyn StorageBackend>, BackendError> {
        Ok(Arc::new(self.clone()))
    }
}

struct Harness {
    storage: CountingStorage,
    radio: Arc<RecordingAdvertiser>,
    service: Arc<BleService>,
    registry: Arc<BeaconRegistry>,
    events: broadcast::Receiver<BeaconEvent>,
}

impl Harness {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let storage = CountingStorage::default();
        let bus = Arc::new(LocalBroadcaster::default());
        let events = bus.subscribe();
        let radio = Arc::new(RecordingAdvertiser::default());
        let service = Arc::new(BleService::new(radio.clone(), bus.clone()));
        let registry = Arc::new(
            BeaconRegistry::new(
                RegistryConfig::default(),
                Arc::new(storage.clone()),
                service.clone(),
                bus,
            )
            .unwrap(),
        );
        service.attach(&registry);

        Self {
            storage,
            radio,
            service,
            registry,
            events,
        }
    }

    /// Write a beacon straight into storage, as a previous run would have
    fn seed(&self, name: &str, state: ActiveState) -> i64 {
        let store = BeaconStore::new(Arc::new(self.storage.inner.clone()), "seed");
        let mut beacon = Beacon::new(BeaconKind::IBeacon, name.as_bytes().to_vec())
            .with_name(name)
            .with_active_state(state);
        store.save(&mut beacon).unwrap()
    }

    fn drain(&mut self) -> Vec<(EventKind, String)> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push((event.kind, event.beacon.display_name()));
        }
        out
    }

    fn active_names(&self) -> Vec<String> {
        self.registry
            .get_active()
            .unwrap()
            .snapshot()
            .iter()
            .map(|b| b.display_name())
            .collect()
    }

    fn on_air(&self) -> Vec<i64> {
        self.radio.on_air.lock().unwrap().clone()
    }
}

fn context(package: &str) -> Arc<AppContext> {
    Arc::new(AppContext::new(package, "/nonexistent", 30))
}

fn added(events: &[(EventKind, String)]) -> Vec<String> {
    events
        .iter()
        .filter(|(kind, _)| *kind == EventKind::Added)
        .map(|(_, name)| name.clone())
        .collect()
}

#[test]
fn test_restore_restores_only_non_stopped_in_storage_order() {
    let mut h = Harness::new();
    h.seed("alpha", ActiveState::Enabled);
    h.seed("old-1", ActiveState::Stopped);
    h.seed("beta", ActiveState::Paused);
    h.seed("old-2", ActiveState::Stopped);
    h.seed("gamma", ActiveState::Enabled);

    let ctx = context("app");
    h.registry.initialize(&ctx).unwrap();

    assert!(h.registry.is_initialized());
    assert_eq!(h.active_names(), vec!["alpha", "beta", "gamma"]);

    let events = h.drain();
    assert_eq!(added(&events), vec!["alpha", "beta", "gamma"]);

    // Paused beacons are held but not advertised
    assert_eq!(h.service.get_state(), ServiceState::Running);
    assert_eq!(h.on_air(), vec![1, 5]);
}

#[test]
fn test_initialize_twice_restores_once() {
    let mut h = Harness::new();
    h.seed("a", ActiveState::Enabled);
    h.seed("b", ActiveState::Enabled);

    let ctx = context("app");
    h.registry.initialize(&ctx).unwrap();
    let after_first = h.registry.get_active().unwrap().len();
    h.registry.initialize(&ctx).unwrap();

    assert_eq!(h.registry.get_active().unwrap().len(), after_first);
    // One restore scan, nothing read on the second call
    assert_eq!(h.storage.reads.load(Ordering::SeqCst), 1);
    assert_eq!(added(&h.drain()).len(), 2);
    assert_eq!(h.service.get_stats().starts, 1);
}

#[test]
fn test_reinitialize_swaps_context_without_duplicating() {
    let h = Harness::new();
    h.seed("a", ActiveState::Enabled);

    let first = context("first");
    let second = context("second");
    h.registry.initialize(&first).unwrap();
    h.registry.initialize(&second).unwrap();

    let current = h.registry.context().unwrap().unwrap();
    assert_eq!(current.package(), "second");
    assert!(Arc::ptr_eq(&current, &second));
    assert_eq!(h.active_names(), vec!["a"]);
}

#[test]
fn test_get_saved_prefers_active_instance() {
    let h = Harness::new();
    let active_id = h.seed("live", ActiveState::Enabled);
    let stopped_id = h.seed("archived", ActiveState::Stopped);

    let ctx = context("app");
    h.registry.initialize(&ctx).unwrap();

    let live = h.registry.get_saved(active_id).unwrap().unwrap();
    let in_set = h.registry.find_active_by_storage_id(active_id).unwrap().unwrap();
    assert!(Arc::ptr_eq(&live, &in_set));
    let by_uuid = h.registry.find_active_by_unique_id(Some(live.uuid())).unwrap().unwrap();
    assert!(Arc::ptr_eq(&live, &by_uuid));

    let archived = h.registry.get_saved(stopped_id).unwrap().unwrap();
    assert_eq!(archived.name(), Some("archived"));
    assert_eq!(archived.active_state(), ActiveState::Stopped);
    assert!(!h.registry.get_active().unwrap().contains(&archived));
    assert!(h.registry.find_active_by_storage_id(stopped_id).unwrap().is_none());

    // Every load from storage materializes a new transient instance
    let again = h.registry.get_saved(stopped_id).unwrap().unwrap();
    assert!(!Arc::ptr_eq(&archived, &again));
    assert_ne!(archived.uuid(), again.uuid());

    assert!(h.registry.get_saved(999).unwrap().is_none());
}

#[test]
fn test_invalid_ids_do_not_touch_storage() {
    let h = Harness::new();
    h.seed("a", ActiveState::Enabled);
    let ctx = context("app");
    h.registry.initialize(&ctx).unwrap();

    let reads = h.storage.reads.load(Ordering::SeqCst);
    assert!(h.registry.find_active_by_storage_id(0).unwrap().is_none());
    assert!(h.registry.find_active_by_storage_id(-1).unwrap().is_none());
    assert!(h.registry.find_active_by_unique_id(None).unwrap().is_none());
    assert!(h.registry.get_saved(0).unwrap().is_none());
    assert_eq!(h.storage.reads.load(Ordering::SeqCst), reads);
}

#[test]
fn test_service_destroyed_resets_session() {
    let mut h = Harness::new();
    h.seed("a", ActiveState::Enabled);
    h.seed("b", ActiveState::Enabled);
    h.seed("c", ActiveState::Enabled);

    let ctx = context("app");
    h.registry.initialize(&ctx).unwrap();
    let active = h.registry.get_active().unwrap();
    assert_eq!(added(&h.drain()).len(), 3);

    h.registry.shutdown();
    assert_eq!(h.service.get_state(), ServiceState::Stopped);
    assert!(h.on_air().is_empty());
    assert!(!h.registry.is_initialized());
    // The handle held before shutdown observes the clear
    assert!(active.is_empty());
    assert!(h.registry.context().unwrap().is_none());

    let events = h.drain();
    assert_eq!(
        events.iter().filter(|(k, _)| *k == EventKind::Stopped).count(),
        3
    );

    h.registry.initialize(&ctx).unwrap();
    assert_eq!(added(&h.drain()).len(), 3);
    assert_eq!(h.active_names(), vec!["a", "b", "c"]);
    assert_eq!(h.service.get_state(), ServiceState::Running);
    assert_eq!(h.service.get_stats().starts, 2);
}

#[test]
fn test_host_termination_clears_registry() {
    let h = Harness::new();
    h.seed("a", ActiveState::Enabled);
    let ctx = context("app");
    h.registry.initialize(&ctx).unwrap();

    h.service.on_host_terminated();

    assert!(!h.registry.is_initialized());
    assert!(h.registry.get_active().unwrap().is_empty());
    // Context survives: only shutdown releases it
    assert!(h.registry.context().unwrap().is_some());
}

#[test]
fn test_empty_restore_does_not_start_service() {
    let h = Harness::new();
    h.seed("old", ActiveState::Stopped);

    let ctx = context("app");
    h.registry.initialize(&ctx).unwrap();

    assert!(h.registry.is_initialized());
    assert!(h.registry.get_active().unwrap().is_empty());
    assert_eq!(h.service.get_state(), ServiceState::Stopped);
    assert_eq!(h.service.get_stats().starts, 0);
}

#[test]
fn test_old_platform_restores_without_service() {
    let h = Harness::new();
    h.seed("a", ActiveState::Enabled);

    let ctx = Arc::new(AppContext::new("app", "/nonexistent", 19));
    h.registry.initialize(&ctx).unwrap();

    assert_eq!(h.active_names(), vec!["a"]);
    assert_eq!(h.service.get_state(), ServiceState::Stopped);
}

#[test]
fn test_active_if_any_distinguishes_untouched() {
    let h = Harness::new();
    let ctx = context("app");
    h.registry.initialize(&ctx).unwrap();
    // Restore allocates the set even when nothing is restored
    assert!(h.registry.get_active_if_any().unwrap().is_some());

    let fresh = Harness::new();
    assert!(matches!(
        fresh.registry.get_active_if_any(),
        Err(BeaconsError::NotInitialized)
    ));
}

#[test]
fn test_get_stopped_lists_only_stopped_records() {
    let h = Harness::new();
    h.seed("a", ActiveState::Enabled);
    h.seed("x", ActiveState::Stopped);
    h.seed("y", ActiveState::Stopped);
    let ctx = context("app");
    h.registry.initialize(&ctx).unwrap();

    let mut cursor = h.registry.get_stopped().unwrap();
    let store = BeaconStore::new(Arc::new(h.storage.inner.clone()), "check");
    let names: Vec<String> = cursor
        .by_ref()
        .filter_map(|raw| store.materialize(&raw.unwrap()))
        .map(|b| b.display_name())
        .collect();
    assert_eq!(cursor.close(), 2);
    assert_eq!(names, vec!["x", "y"]);

    let stopped = h.registry.stopped_beacons().unwrap();
    assert_eq!(stopped.len(), 2);
}

#[test]
fn test_add_pause_resume_stop() {
    let mut h = Harness::new();
    let ctx = context("app");
    h.registry.initialize(&ctx).unwrap();

    let beacon = h
        .registry
        .add(Beacon::new(BeaconKind::EddystoneUrl, vec![0x03]).with_name("door"))
        .unwrap();
    assert!(beacon.is_saved());
    assert_eq!(h.service.get_state(), ServiceState::Running);
    assert_eq!(h.on_air(), vec![beacon.saved_id()]);
    assert_eq!(beacon.advertise_state(), AdvertiseState::Advertising);
    assert_eq!(
        h.drain(),
        vec![
            (EventKind::Added, "door".to_string()),
            (EventKind::Started, "door".to_string()),
        ]
    );

    h.registry.set_paused(beacon.uuid(), true).unwrap();
    assert_eq!(beacon.active_state(), ActiveState::Paused);
    assert!(h.on_air().is_empty());
    assert_eq!(h.drain(), vec![(EventKind::Paused, "door".to_string())]);

    h.registry.set_paused(beacon.uuid(), false).unwrap();
    assert_eq!(h.on_air(), vec![beacon.saved_id()]);
    assert_eq!(h.drain(), vec![(EventKind::Started, "door".to_string())]);

    let stopped = h.registry.stop(beacon.uuid()).unwrap().unwrap();
    assert!(Arc::ptr_eq(&stopped, &beacon));
    assert_eq!(beacon.active_state(), ActiveState::Stopped);
    assert_eq!(h.service.get_state(), ServiceState::Stopped);
    assert!(h.on_air().is_empty());
    assert_eq!(h.drain(), vec![(EventKind::Stopped, "door".to_string())]);

    let reloaded = h.registry.get_saved(beacon.saved_id()).unwrap().unwrap();
    assert_eq!(reloaded.active_state(), ActiveState::Stopped);
}

#[test]
fn test_stop_keeps_service_for_remaining_beacons() {
    let h = Harness::new();
    let first = h.seed("first", ActiveState::Enabled);
    let second = h.seed("second", ActiveState::Enabled);
    let ctx = context("app");
    h.registry.initialize(&ctx).unwrap();

    let beacon = h.registry.find_active_by_storage_id(first).unwrap().unwrap();
    h.registry.stop(beacon.uuid()).unwrap();

    assert_eq!(h.service.get_state(), ServiceState::Running);
    assert_eq!(h.on_air(), vec![second]);
    assert_eq!(h.active_names(), vec!["second"]);
    assert!(h.registry.is_initialized());
}

#[test]
fn test_advertise_failure_is_reported() {
    let mut h = Harness::new();
    let good = h.seed("good", ActiveState::Enabled);
    let bad = h.seed("bad", ActiveState::Enabled);
    h.radio.fail_ids.lock().unwrap().push(bad);

    let ctx = context("app");
    h.registry.initialize(&ctx).unwrap();

    assert_eq!(h.on_air(), vec![good]);
    let failed = h.registry.find_active_by_storage_id(bad).unwrap().unwrap();
    assert!(matches!(failed.advertise_state(), AdvertiseState::Failed(_)));
    assert_eq!(h.service.get_stats().advertise_failures, 1);

    let events = h.drain();
    assert!(events.contains(&(EventKind::Failed, "bad".to_string())));
    assert!(events.contains(&(EventKind::Started, "good".to_string())));
}

#[test]
fn test_unknown_uuid_mutations_are_not_found() {
    let h = Harness::new();
    let ctx = context("app");
    h.registry.initialize(&ctx).unwrap();

    let stranger = uuid::Uuid::new_v4();
    assert!(h.registry.stop(stranger).unwrap().is_none());
    assert!(h.registry.set_paused(stranger, true).unwrap().is_none());
}
