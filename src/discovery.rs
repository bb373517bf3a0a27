//! Discovery Manager (C4, `spec.md` §4.4): tracks this gateway's own
//! publisher/subscriber inventory, reconciles the set of known remote
//! peers from the records they gossip, and resolves which device(s) on
//! which transport a given outbound topic should reach.
//!
//! Grounded on `original_source/include/p3com/generic/discovery.hpp` and
//! `discovery.cpp`. The original guards essentially all of its state
//! (`LocalState_t`, `RemoteState_t`, the device-indices cache) plus some
//! network sends behind one `std::recursive_mutex`. `std::sync::Mutex` is
//! not re-entrant, so state here is split across two locks — `state`
//! (inventory + remote records + cache) and `update_callback` — and every
//! method that both mutates state and triggers a resend computes the
//! payload to send *before* the state guard is dropped, then performs the
//! actual broadcast once it no longer holds the lock (see DESIGN.md).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use log::{error, info, warn};

use crate::codec::DiscoveryRecord;
use crate::ipc::{Introspection, Notification, PublisherUid, WaitSet};
use crate::transport::registry::TransportRegistry;
use crate::types::{DeviceIndex, GatewayHash, InfoHash, ServiceHash, ServiceId, TransportKind, MAX_DEVICE_COUNT, MAX_TOPICS, REACTOR_TICK};

/// Identifies the port-introspection subscription within the wait-set
/// this manager attaches to. There is exactly one attached endpoint, so
/// a fixed id is sufficient.
const INTROSPECTION_ENDPOINT_ID: u64 = 0;

pub type UpdateCallback = Box<dyn Fn(&[ServiceId]) + Send + Sync>;

#[derive(Default)]
struct LocalInventory {
    publishers: Vec<ServiceId>,
    subscribers: Vec<ServiceId>,
    publisher_ports: Vec<PublisherUid>,
}

struct DeviceRecord {
    info: DiscoveryRecord,
    device_indices: Vec<DeviceIndex>,
}

#[derive(Default)]
struct RemoteState {
    records: Vec<DeviceRecord>,
    device_indices_cache: HashMap<ServiceHash, Vec<DeviceIndex>>,
}

#[derive(Default)]
struct State {
    local: LocalInventory,
    remote: RemoteState,
    /// Publisher ports created by the R→L adapter itself, to be ignored
    /// as egress sources (otherwise data injected locally from a remote
    /// peer would loop straight back onto the network).
    gateway_publisher_uids: HashSet<PublisherUid>,
    last_sent_subscribers: Vec<ServiceId>,
}

pub struct DiscoveryManager {
    gateway_hash: GatewayHash,
    preferred_transport: Option<TransportKind>,
    registry: Arc<TransportRegistry>,
    introspection: Arc<dyn Introspection>,
    waitset: Arc<dyn WaitSet>,
    state: Mutex<State>,
    update_callback: Mutex<Option<UpdateCallback>>,
    terminated: AtomicBool,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryManager {
    /// Mints a fresh `GatewayHash`, registers a discovery callback on
    /// every currently-enabled transport, and installs a Registry
    /// failure callback that clears the device-indices cache and
    /// resends our own record (`spec.md` §4.9, §4.4).
    pub fn new(
        registry: Arc<TransportRegistry>,
        introspection: Arc<dyn Introspection>,
        waitset: Arc<dyn WaitSet>,
        preferred_transport: Option<TransportKind>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            gateway_hash: GatewayHash::generate(),
            preferred_transport,
            registry: Arc::clone(&registry),
            introspection,
            waitset,
            state: Mutex::new(State::default()),
            update_callback: Mutex::new(None),
            terminated: AtomicBool::new(false),
            reactor: Mutex::new(None),
        });
        info!("discovery: initializing with gateway hash {:#010x}", manager.gateway_hash.0);

        let weak: Weak<DiscoveryManager> = Arc::downgrade(&manager);
        registry.for_each_enabled(|transport| {
            let weak = weak.clone();
            transport.register_discovery_callback(Box::new(move |bytes, device| {
                if let Some(manager) = weak.upgrade() {
                    manager.handle_inbound_discovery(bytes, device);
                }
            }));
        });

        let weak_fail: Weak<DiscoveryManager> = Arc::downgrade(&manager);
        registry.set_failure_callback(Box::new(move |_kind| {
            let Some(manager) = weak_fail.upgrade() else { return };
            let record = {
                let mut state = manager.state.lock().unwrap();
                state.remote.device_indices_cache.clear();
                manager.build_record(&state.local.subscribers, false)
            };
            if !manager.terminated.load(Ordering::Acquire) {
                manager.broadcast(&record);
            }
        }));

        manager
    }

    /// Installs the needed-topics callback, attaches the introspection
    /// wait-set, spawns the reactor thread, and sends the initial
    /// (empty, at this point) discovery record.
    pub fn start(self: &Arc<Self>, update_callback: UpdateCallback) {
        *self.update_callback.lock().unwrap() = Some(update_callback);
        self.waitset.attach(INTROSPECTION_ENDPOINT_ID);

        let manager = Arc::clone(self);
        let handle = std::thread::spawn(move || manager.reactor_loop());
        *self.reactor.lock().unwrap() = Some(handle);

        let record = {
            let state = self.state.lock().unwrap();
            self.build_record(&state.local.subscribers, false)
        };
        self.broadcast(&record);
    }

    /// Stops the reactor thread, detaches the wait-set, clears the
    /// update callback (so a late-firing discovery event cannot call
    /// into an already-tearing-down adapter), and broadcasts a
    /// termination record so peers drop us immediately rather than
    /// waiting for us to simply go quiet.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        if let Some(handle) = self.reactor.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.waitset.detach(INTROSPECTION_ENDPOINT_ID);
        *self.update_callback.lock().unwrap() = None;

        let record = {
            let state = self.state.lock().unwrap();
            self.build_record(&state.local.subscribers, true)
        };
        self.broadcast(&record);
        info!("discovery: terminated gateway hash {:#010x}", self.gateway_hash.0);
    }

    /// Resend our current record over exactly one transport kind.
    /// Called periodically by the top-level reactor for every lossy
    /// transport (`spec.md` §4.4 "periodic rebroadcast"), independent of
    /// this manager's own change-triggered resends.
    pub fn resend_discovery_info_to_transport(&self, kind: TransportKind) {
        let record = {
            let state = self.state.lock().unwrap();
            self.build_record(&state.local.subscribers, false)
        };
        let mut bytes = Vec::new();
        if let Err(e) = record.serialize(&mut bytes) {
            error!("discovery: failed to serialize record for resend: {e}");
            return;
        }
        self.registry.for_one(kind, |transport| transport.send_broadcast(&bytes));
    }

    pub fn add_gateway_publisher(&self, uid: PublisherUid) {
        self.state.lock().unwrap().gateway_publisher_uids.insert(uid);
    }

    pub fn discard_gateway_publisher(&self, uid: PublisherUid) {
        self.state.lock().unwrap().gateway_publisher_uids.remove(&uid);
    }

    /// Destinations for a message published locally by `publisher_uid`
    /// on `service_hash`. Empty if `publisher_uid` is one of our own
    /// gateway-injected publishers, or is not (yet) a discovered local
    /// publisher port (`spec.md` §4.4 step 2).
    pub fn device_indices_for_egress(&self, publisher_uid: PublisherUid, service_hash: ServiceHash) -> Vec<DeviceIndex> {
        let mut state = self.state.lock().unwrap();
        if state.gateway_publisher_uids.contains(&publisher_uid) {
            return Vec::new();
        }
        if !state.local.publisher_ports.contains(&publisher_uid) {
            return Vec::new();
        }
        if let Some(cached) = state.remote.device_indices_cache.get(&service_hash) {
            return cached.clone();
        }
        let computed = compute_device_indices(&state, &self.registry, self.preferred_transport, service_hash);
        if state.remote.device_indices_cache.len() < MAX_TOPICS {
            state.remote.device_indices_cache.insert(service_hash, computed.clone());
        } else {
            warn!("discovery: device-indices cache at capacity ({MAX_TOPICS}), not caching {service_hash:?}");
        }
        computed
    }

    /// Destinations for a message forwarded by the Forwarder from
    /// `from_device`: every peer subscribed to `service_hash` that does
    /// not already share an enabled transport with the source peer
    /// (`spec.md` §4.4 forwarding).
    pub fn device_indices_for_forwarding(&self, service_hash: ServiceHash, from_device: DeviceIndex) -> Vec<DeviceIndex> {
        let state = self.state.lock().unwrap();
        let Some(from_bitset) = state.remote.records.iter().find(|r| r.device_indices.contains(&from_device)).map(|r| r.info.gateway_bitset)
        else {
            warn!("discovery: could not find source device for a forwarded message, discarding");
            return Vec::new();
        };

        let mut result = Vec::new();
        for record in &state.remote.records {
            let shares_a_transport = from_bitset.intersects(record.info.gateway_bitset);
            if shares_a_transport {
                continue;
            }
            if !record.info.subscribers.iter().any(|s| s.hash() == service_hash) {
                continue;
            }
            if let Some(kind) = self.registry.find_matching(record.info.gateway_bitset, self.preferred_transport) {
                if let Some(idx) = record.device_indices.iter().find(|i| i.kind == kind) {
                    result.push(*idx);
                }
            }
        }
        result
    }

    fn reactor_loop(self: Arc<Self>) {
        while !self.terminated.load(Ordering::Acquire) {
            for notification in self.waitset.timed_wait(REACTOR_TICK) {
                let Notification::HasData(id) = notification;
                if id == INTROSPECTION_ENDPOINT_ID {
                    self.read_port_subscriber();
                }
            }
        }
    }

    /// One port-introspection sample: diff against the previous local
    /// inventory, log additions/removals, recompute needed topics on any
    /// change, and resend our record only if the gossiped subscriber set
    /// actually changed (`spec.md` §4.4 step 1, mirroring the source's
    /// "only the subscriber list is ever gossiped" comment).
    fn read_port_subscriber(&self) {
        let Some(sample) = self.introspection.take_sample() else {
            return;
        };

        let mut state = self.state.lock().unwrap();
        let old_publishers: HashSet<&ServiceId> = state.local.publishers.iter().collect();
        let old_subscribers: HashSet<&ServiceId> = state.local.subscribers.iter().collect();
        let new_publishers: HashSet<&ServiceId> = sample.publishers.iter().collect();
        let new_subscribers: HashSet<&ServiceId> = sample.subscribers.iter().collect();

        for s in old_publishers.difference(&new_publishers) {
            info!("discovery: destroyed user publisher {s}");
        }
        for s in old_subscribers.difference(&new_subscribers) {
            info!("discovery: destroyed user subscriber {s}");
        }
        for s in new_publishers.difference(&old_publishers) {
            info!("discovery: new user publisher {s}");
        }
        for s in new_subscribers.difference(&old_subscribers) {
            info!("discovery: new user subscriber {s}");
        }

        let changed = old_publishers != new_publishers || old_subscribers != new_subscribers;
        state.local.publishers = sample.publishers;
        state.local.subscribers = sample.subscribers;
        state.local.publisher_ports = sample.publisher_ports;

        if !changed {
            return;
        }

        let needed = compute_needed_topics(&state);
        self.notify_update(&needed);

        let current = self.build_record(&state.local.subscribers, false);
        let should_resend = current.subscribers != state.last_sent_subscribers;
        if should_resend {
            state.last_sent_subscribers = current.subscribers.clone();
        }
        let published_ports = state.local.publisher_ports.clone();
        drop(state);

        if should_resend {
            self.broadcast(&current);
        }
        self.introspection.publish_registered_publishers(&published_ports);
    }

    /// One inbound discovery record, from any transport. Dedupes by
    /// `gateway_hash`; a termination record removes the peer outright;
    /// a not-yet-seen peer triggers an immediate resend of our own
    /// record so it learns about us without waiting for its own next
    /// periodic rebroadcast (`spec.md` §4.4 step 3).
    fn handle_inbound_discovery(&self, bytes: &[u8], device_index: DeviceIndex) {
        let record = match DiscoveryRecord::deserialize(bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!("discovery: dropping malformed inbound record: {e}");
                return;
            }
        };

        let mut state = self.state.lock().unwrap();

        if record.is_termination {
            if let Some(pos) = state.remote.records.iter().position(|r| r.info.gateway_hash == record.gateway_hash) {
                state.remote.records.remove(pos);
                info!("discovery: deleted device record for gateway hash {:#010x}", record.gateway_hash.0);
            }
            state.remote.device_indices_cache.clear();
            let needed = compute_needed_topics(&state);
            drop(state);
            self.notify_update(&needed);
            return;
        }

        let is_new = !state.remote.records.iter().any(|r| r.info.gateway_hash == record.gateway_hash);
        if is_new {
            if state.remote.records.len() >= MAX_DEVICE_COUNT {
                warn!("discovery: device table full ({MAX_DEVICE_COUNT}), ignoring new peer {:#010x}", record.gateway_hash.0);
                return;
            }
            info!("discovery: registered device record for gateway hash {:#010x}", record.gateway_hash.0);
            state.remote.records.push(DeviceRecord { info: record.clone(), device_indices: Vec::new() });
        }

        let slot = state
            .remote
            .records
            .iter_mut()
            .find(|r| r.info.gateway_hash == record.gateway_hash)
            .expect("just found or inserted above");
        slot.info = record.clone();
        match slot.device_indices.iter().find(|i| i.kind == device_index.kind) {
            Some(existing) if existing.device != device_index.device => {
                error!("discovery: internal discovery system error (device index mismatch for gateway hash {:#010x})", record.gateway_hash.0);
            }
            Some(_) => {}
            None => slot.device_indices.push(device_index),
        }

        state.remote.device_indices_cache.clear();
        let needed = compute_needed_topics(&state);
        let resend = if is_new && !self.terminated.load(Ordering::Acquire) {
            Some(self.build_record(&state.local.subscribers, false))
        } else {
            None
        };
        drop(state);

        self.notify_update(&needed);
        if let Some(record) = resend {
            self.broadcast(&record);
        }
    }

    fn build_record(&self, subscribers: &[ServiceId], is_termination: bool) -> DiscoveryRecord {
        DiscoveryRecord {
            subscribers: subscribers.to_vec(),
            gateway_bitset: self.registry.bitset(),
            gateway_hash: self.gateway_hash,
            info_hash: InfoHash::generate(),
            is_termination,
        }
    }

    fn broadcast(&self, record: &DiscoveryRecord) {
        let mut bytes = Vec::new();
        if let Err(e) = record.serialize(&mut bytes) {
            error!("discovery: failed to serialize own record: {e}");
            return;
        }
        self.registry.for_each_enabled(|transport| transport.send_broadcast(&bytes));
    }

    fn notify_update(&self, needed: &[ServiceId]) {
        if let Some(callback) = self.update_callback.lock().unwrap().as_ref() {
            callback(needed);
        }
    }
}

fn compute_device_indices(state: &State, registry: &TransportRegistry, preferred: Option<TransportKind>, service_hash: ServiceHash) -> Vec<DeviceIndex> {
    let mut result = Vec::new();
    for record in &state.remote.records {
        if !record.info.subscribers.iter().any(|s| s.hash() == service_hash) {
            continue;
        }
        if let Some(kind) = registry.find_matching(record.info.gateway_bitset, preferred) {
            if let Some(idx) = record.device_indices.iter().find(|i| i.kind == kind) {
                result.push(*idx);
            }
        }
    }
    result
}

fn compute_needed_topics(state: &State) -> Vec<ServiceId> {
    let mut needed: Vec<ServiceId> = Vec::new();
    for s in state.local.subscribers.iter().chain(state.local.publishers.iter()) {
        if !needed.contains(s) {
            needed.push(s.clone());
        }
    }
    for record in &state.remote.records {
        for s in &record.info.subscribers {
            if !needed.contains(s) {
                needed.push(s.clone());
            }
        }
    }
    needed
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::ipc::testing::{TestIntrospection, TestWaitSet};
    use crate::ipc::PortIntrospectionSample;
    use crate::transport::{BufferHandle, DiscoveryCallback, StatusCell, Transport, TransportStatus, UserDataCallback};

    struct FakeTransport {
        kind: TransportKind,
        status: StatusCell,
        discovery_cb: StdMutex<Option<DiscoveryCallback>>,
        broadcasts: StdMutex<Vec<Vec<u8>>>,
    }

    impl FakeTransport {
        fn new(kind: TransportKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                status: StatusCell::new(),
                discovery_cb: StdMutex::new(None),
                broadcasts: StdMutex::new(Vec::new()),
            })
        }

        fn last_broadcast(&self) -> DiscoveryRecord {
            let bytes = self.broadcasts.lock().unwrap().last().cloned().expect("no broadcast sent");
            DiscoveryRecord::deserialize(&bytes).unwrap()
        }

        /// Feed an inbound datagram through the callback the manager
        /// registered on construction, the way the real reader thread
        /// would.
        fn deliver_discovery(&self, bytes: &[u8], device: DeviceIndex) {
            let guard = self.discovery_cb.lock().unwrap();
            (guard.as_ref().expect("manager did not register a discovery callback"))(bytes, device);
        }
    }

    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }
        fn status(&self) -> TransportStatus {
            self.status.get()
        }
        fn register_discovery_callback(&self, callback: DiscoveryCallback) {
            *self.discovery_cb.lock().unwrap() = Some(callback);
        }
        fn register_user_data_callback(&self, _callback: UserDataCallback) {}
        fn send_broadcast(&self, bytes: &[u8]) {
            self.broadcasts.lock().unwrap().push(bytes.to_vec());
        }
        fn send_user_data(&self, _header: &[u8], _payload: &[u8], _device: u32, _handle: BufferHandle) -> bool {
            false
        }
        fn max_message_size(&self) -> usize {
            1200
        }
    }

    fn harness() -> (Arc<DiscoveryManager>, Arc<FakeTransport>, Arc<TestIntrospection>, Arc<TestWaitSet>) {
        let registry = Arc::new(TransportRegistry::new());
        let transport = FakeTransport::new(TransportKind::Datagram);
        registry.enable(transport.clone());
        let introspection = TestIntrospection::new();
        let waitset = TestWaitSet::new();
        let manager = DiscoveryManager::new(registry, introspection.clone(), waitset.clone(), None);
        (manager, transport, introspection, waitset)
    }

    #[test]
    fn start_sends_initial_empty_record() {
        let (manager, transport, _introspection, _waitset) = harness();
        manager.start(Box::new(|_needed| {}));
        let record = transport.last_broadcast();
        assert_eq!(record.gateway_hash, manager.gateway_hash);
        assert!(record.subscribers.is_empty());
        assert!(!record.is_termination);
        manager.terminate();
    }

    #[test]
    fn terminate_sends_termination_record() {
        let (manager, transport, _introspection, _waitset) = harness();
        manager.start(Box::new(|_needed| {}));
        manager.terminate();
        assert!(transport.last_broadcast().is_termination);
    }

    #[test]
    fn inbound_new_peer_triggers_immediate_resend_and_is_tracked() {
        let (manager, transport, _introspection, _waitset) = harness();
        manager.start(Box::new(|_needed| {}));
        transport.broadcasts.lock().unwrap().clear();

        let mut remote_bitset = crate::types::TransportBitset::EMPTY;
        remote_bitset.set(TransportKind::Datagram);
        let remote = DiscoveryRecord {
            subscribers: vec![ServiceId::new("svc", "inst", "evt")],
            gateway_bitset: remote_bitset,
            gateway_hash: GatewayHash(0xabcd_ef01),
            info_hash: InfoHash(1),
            is_termination: false,
        };
        let mut bytes = Vec::new();
        remote.serialize(&mut bytes).unwrap();
        transport.deliver_discovery(&bytes, DeviceIndex::new(TransportKind::Datagram, 7));

        assert_eq!(transport.last_broadcast().gateway_hash, manager.gateway_hash);

        let hash = ServiceId::new("svc", "inst", "evt").hash();
        manager.add_gateway_publisher(PublisherUid(99)); // not yet a discovered local port
        let dest = manager.device_indices_for_egress(PublisherUid(1), hash);
        // publisher 1 was never discovered locally either, so still empty:
        assert!(dest.is_empty());
        manager.terminate();
    }

    #[test]
    fn egress_resolves_to_subscribing_peer_once_publisher_is_discovered() {
        let (manager, transport, introspection, waitset) = harness();
        manager.start(Box::new(|_needed| {}));
        transport.broadcasts.lock().unwrap().clear();

        let mut remote_bitset = crate::types::TransportBitset::EMPTY;
        remote_bitset.set(TransportKind::Datagram);
        let remote = DiscoveryRecord {
            subscribers: vec![ServiceId::new("svc", "inst", "evt")],
            gateway_bitset: remote_bitset,
            gateway_hash: GatewayHash(0x1111_2222),
            info_hash: InfoHash(1),
            is_termination: false,
        };
        let mut bytes = Vec::new();
        remote.serialize(&mut bytes).unwrap();
        manager.handle_inbound_discovery(&bytes, DeviceIndex::new(TransportKind::Datagram, 3));

        introspection.push_sample(PortIntrospectionSample {
            publishers: vec![ServiceId::new("svc", "inst", "evt")],
            subscribers: vec![],
            publisher_ports: vec![PublisherUid(1)],
        });
        waitset.notify(INTROSPECTION_ENDPOINT_ID);
        // Give the reactor thread a moment to drain the notification.
        std::thread::sleep(std::time::Duration::from_millis(100));

        let hash = ServiceId::new("svc", "inst", "evt").hash();
        let dest = manager.device_indices_for_egress(PublisherUid(1), hash);
        assert_eq!(dest, vec![DeviceIndex::new(TransportKind::Datagram, 3)]);

        manager.terminate();
    }

    #[test]
    fn termination_record_removes_peer() {
        let (manager, _transport, _introspection, _waitset) = harness();
        manager.start(Box::new(|_needed| {}));

        let mut bytes = Vec::new();
        let remote = DiscoveryRecord {
            subscribers: vec![],
            gateway_bitset: crate::types::TransportBitset::EMPTY,
            gateway_hash: GatewayHash(5),
            info_hash: InfoHash(1),
            is_termination: false,
        };
        remote.serialize(&mut bytes).unwrap();
        manager.handle_inbound_discovery(&bytes, DeviceIndex::new(TransportKind::Datagram, 0));
        assert_eq!(manager.state.lock().unwrap().remote.records.len(), 1);

        bytes.clear();
        let term = DiscoveryRecord { is_termination: true, ..remote };
        term.serialize(&mut bytes).unwrap();
        manager.handle_inbound_discovery(&bytes, DeviceIndex::new(TransportKind::Datagram, 0));
        assert_eq!(manager.state.lock().unwrap().remote.records.len(), 0);

        manager.terminate();
    }
}
