//! The local shared-memory IPC fabric boundary (`spec.md` §6): endpoint
//! objects, chunk headers, and service descriptors are consumed here as
//! opaque interfaces. The concrete fabric (a real iceoryx-style shared
//! memory runtime) is explicitly out of scope for this crate (`spec.md`
//! §1) — it is an external collaborator the gateway is linked against.
//!
//! `testing` below provides a bounded in-memory stand-in implementing the
//! same traits, used by the integration tests and the binary's
//! `--self-test` mode.

use std::sync::Arc;
use std::time::Duration;

use crate::types::ServiceId;

/// Opaque handle to one loaned/taken chunk. Never dereferenced outside the
/// adapter that owns it; callers treat it as a capability token, not a
/// pointer (`spec.md` §9 "raw pointers keyed in maps").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkToken(pub u64);

/// Opaque identifier for a local publisher port, used to filter the
/// gateway's own loop-back traffic out of local inventory snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublisherUid(pub u64);

#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub origin_id: PublisherUid,
    pub user_header_size: u32,
    pub user_payload_size: u32,
    pub user_payload_alignment: u32,
    pub has_user_header: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeResult {
    Chunk(ChunkToken),
    NoChunk,
    TooManyHeld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoanError {
    TooManyInParallel,
    OutOfChunks,
}

/// A local subscriber endpoint (egress source for L→R, forwarder source).
pub trait Subscriber: Send + Sync {
    fn service(&self) -> &ServiceId;
    fn take(&self) -> TakeResult;
    fn release(&self, chunk: ChunkToken);
    fn unsubscribe(&self);
}

/// A local publisher endpoint (ingress sink for R→L).
pub trait Publisher: Send + Sync {
    fn service(&self) -> &ServiceId;
    fn uid(&self) -> PublisherUid;
    fn loan(
        &self,
        payload_size: u32,
        payload_align: u32,
        header_size: u32,
        header_align: u32,
    ) -> Result<ChunkToken, LoanError>;
    fn publish(&self, chunk: ChunkToken);
    fn release(&self, chunk: ChunkToken);
}

/// Read/write access to a chunk's header and body bytes. Adapters go
/// through this rather than touching chunk memory directly, keeping the
/// unsafe shared-memory access confined to one implementation.
pub trait ChunkAccess: Send + Sync {
    fn header(&self, chunk: ChunkToken) -> ChunkHeader;
    fn read_header(&self, chunk: ChunkToken) -> Vec<u8>;
    fn read_payload(&self, chunk: ChunkToken) -> Vec<u8>;
    fn write_header_slice(&self, chunk: ChunkToken, offset: u32, bytes: &[u8]);
    fn write_payload_slice(&self, chunk: ChunkToken, offset: u32, bytes: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    HasData(u64),
}

/// The wait-set abstraction a reactor thread blocks on (`spec.md` §4.8,
/// §5). `timed_wait` returning an empty vector is a normal timeout tick,
/// not an error.
pub trait WaitSet: Send + Sync {
    fn attach(&self, endpoint_id: u64);
    fn detach(&self, endpoint_id: u64);
    fn timed_wait(&self, timeout: Duration) -> Vec<Notification>;
}

/// One sample from the `(RouDi_ID, RegisteredPublishers)` / port
/// introspection topic (`spec.md` §4.4, §6).
#[derive(Debug, Clone, Default)]
pub struct PortIntrospectionSample {
    pub publishers: Vec<ServiceId>,
    pub subscribers: Vec<ServiceId>,
    pub publisher_ports: Vec<PublisherUid>,
}

pub trait Introspection: Send + Sync {
    fn take_sample(&self) -> Option<PortIntrospectionSample>;
    /// Publish the gateway's own registered-publisher set for external
    /// liveness probes (`spec.md` §4.4 step 4).
    fn publish_registered_publishers(&self, ports: &[PublisherUid]);
}

/// Constructs local publisher/subscriber endpoints by topic, the Rust
/// analogue of the original's `Gateway<Endpoint>::addChannel` (`gateway.hpp`),
/// which asks the iceoryx runtime to mint an endpoint for a given
/// `ServiceDescription`. The real fabric binding is out of scope here
/// (`spec.md` §1); the Direction Adapters are written against this trait so
/// the in-memory `testing::TestFabric` can drive them end to end.
pub trait Fabric: Send + Sync {
    fn subscriber_for(&self, service: &ServiceId) -> Arc<dyn Subscriber>;
    fn publisher_for(&self, service: &ServiceId) -> Arc<dyn Publisher>;
    fn chunk_access(&self) -> Arc<dyn ChunkAccess>;
    /// Mint a fresh, independent wait-set. The Discovery Manager, the L→R
    /// adapter and the Forwarder each attach to their own instance rather
    /// than sharing one, mirroring the original where each owns its own
    /// `popo::WaitSet` member.
    fn new_waitset(&self) -> Arc<dyn WaitSet>;
    /// A fresh port-introspection handle for the Discovery Manager.
    fn introspection(&self) -> Arc<dyn Introspection>;
}

/// In-memory reference implementation of the IPC boundary, bounded and
/// simple enough to drive the gateway end to end without a real
/// shared-memory fabric.
pub mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct StoredChunk {
        pub header_bytes: Vec<u8>,
        pub payload_bytes: Vec<u8>,
        pub payload_alignment: u32,
        pub origin: PublisherUid,
    }

    #[derive(Default)]
    struct Registry {
        chunks: Mutex<std::collections::HashMap<u64, StoredChunk>>,
        next_token: AtomicU64,
    }

    impl Registry {
        fn alloc(&self, header_size: u32, payload_size: u32, payload_align: u32, origin: PublisherUid) -> ChunkToken {
            let id = self.next_token.fetch_add(1, Ordering::Relaxed);
            self.chunks.lock().unwrap().insert(
                id,
                StoredChunk {
                    header_bytes: vec![0u8; header_size as usize],
                    payload_bytes: vec![0u8; payload_size as usize],
                    payload_alignment: payload_align,
                    origin,
                },
            );
            ChunkToken(id)
        }
    }

    /// An in-memory publisher: `loan` allocates a `StoredChunk`, `publish`
    /// pushes it onto a bounded queue that a paired `TestSubscriber` can
    /// `take()` from.
    pub struct TestPublisher {
        service: ServiceId,
        uid: PublisherUid,
        registry: Arc<Registry>,
        outbox: Arc<Mutex<VecDeque<(ChunkToken, StoredChunk)>>>,
        capacity: usize,
    }

    impl TestPublisher {
        pub fn new(service: ServiceId, uid: PublisherUid, capacity: usize) -> Arc<Self> {
            Arc::new(Self {
                service,
                uid,
                registry: Arc::new(Registry::default()),
                outbox: Arc::new(Mutex::new(VecDeque::new())),
                capacity,
            })
        }

        /// Create a subscriber that reads from this publisher's outbox —
        /// models one shared-memory topic with one writer, one reader.
        pub fn subscribe(self: &Arc<Self>) -> Arc<TestSubscriber> {
            Arc::new(TestSubscriber {
                service: self.service.clone(),
                outbox: Arc::clone(&self.outbox),
                registry: Arc::clone(&self.registry),
                held: Mutex::new(0),
            })
        }

        /// Like `new`, but shares an externally-owned chunk registry instead
        /// of minting a fresh one — used by `TestFabric` so every topic's
        /// chunks live in one token space, matching a real shared-memory
        /// segment.
        fn with_registry(service: ServiceId, uid: PublisherUid, capacity: usize, registry: Arc<Registry>) -> Arc<Self> {
            Arc::new(Self {
                service,
                uid,
                registry,
                outbox: Arc::new(Mutex::new(VecDeque::new())),
                capacity,
            })
        }
    }

    impl Publisher for TestPublisher {
        fn service(&self) -> &ServiceId {
            &self.service
        }

        fn uid(&self) -> PublisherUid {
            self.uid
        }

        fn loan(
            &self,
            payload_size: u32,
            payload_align: u32,
            header_size: u32,
            _header_align: u32,
        ) -> Result<ChunkToken, LoanError> {
            if self.outbox.lock().unwrap().len() >= self.capacity {
                return Err(LoanError::OutOfChunks);
            }
            Ok(self.registry.alloc(header_size, payload_size, payload_align, self.uid))
        }

        fn publish(&self, chunk: ChunkToken) {
            if let Some(stored) = self.registry.chunks.lock().unwrap().remove(&chunk.0) {
                self.outbox.lock().unwrap().push_back((chunk, stored));
            }
        }

        fn release(&self, chunk: ChunkToken) {
            self.registry.chunks.lock().unwrap().remove(&chunk.0);
        }
    }

    pub struct TestSubscriber {
        service: ServiceId,
        outbox: Arc<Mutex<VecDeque<(ChunkToken, StoredChunk)>>>,
        registry: Arc<Registry>,
        held: Mutex<u32>,
    }

    impl Subscriber for TestSubscriber {
        fn service(&self) -> &ServiceId {
            &self.service
        }

        fn take(&self) -> TakeResult {
            let mut held = self.held.lock().unwrap();
            if *held >= 16 {
                return TakeResult::TooManyHeld;
            }
            let Some((token, stored)) = self.outbox.lock().unwrap().pop_front() else {
                return TakeResult::NoChunk;
            };
            self.registry.chunks.lock().unwrap().insert(token.0, stored);
            *held += 1;
            TakeResult::Chunk(token)
        }

        fn release(&self, chunk: ChunkToken) {
            self.registry.chunks.lock().unwrap().remove(&chunk.0);
            let mut held = self.held.lock().unwrap();
            *held = held.saturating_sub(1);
        }

        fn unsubscribe(&self) {}
    }

    impl ChunkAccess for Registry {
        fn header(&self, chunk: ChunkToken) -> ChunkHeader {
            let chunks = self.chunks.lock().unwrap();
            let stored = chunks.get(&chunk.0).expect("unknown chunk token");
            ChunkHeader {
                origin_id: stored.origin,
                user_header_size: stored.header_bytes.len() as u32,
                user_payload_size: stored.payload_bytes.len() as u32,
                user_payload_alignment: stored.payload_alignment,
                has_user_header: !stored.header_bytes.is_empty(),
            }
        }

        fn read_header(&self, chunk: ChunkToken) -> Vec<u8> {
            self.chunks.lock().unwrap().get(&chunk.0).map(|c| c.header_bytes.clone()).unwrap_or_default()
        }

        fn read_payload(&self, chunk: ChunkToken) -> Vec<u8> {
            self.chunks.lock().unwrap().get(&chunk.0).map(|c| c.payload_bytes.clone()).unwrap_or_default()
        }

        fn write_header_slice(&self, chunk: ChunkToken, offset: u32, bytes: &[u8]) {
            if let Some(stored) = self.chunks.lock().unwrap().get_mut(&chunk.0) {
                let start = offset as usize;
                stored.header_bytes[start..start + bytes.len()].copy_from_slice(bytes);
            }
        }

        fn write_payload_slice(&self, chunk: ChunkToken, offset: u32, bytes: &[u8]) {
            if let Some(stored) = self.chunks.lock().unwrap().get_mut(&chunk.0) {
                let start = offset as usize;
                stored.payload_bytes[start..start + bytes.len()].copy_from_slice(bytes);
            }
        }
    }

    /// Exposes the shared chunk registry behind a publisher for direct
    /// use as a `ChunkAccess` implementation in tests.
    pub fn chunk_access(publisher: &TestPublisher) -> Arc<dyn ChunkAccess> {
        Arc::clone(&publisher.registry) as Arc<dyn ChunkAccess>
    }

    /// A trivial wait-set: `timed_wait` blocks on a condition variable
    /// signalled whenever any attached endpoint gets data, or returns
    /// empty after the timeout.
    #[derive(Default)]
    pub struct TestWaitSet {
        state: Mutex<WaitState>,
        cv: Condvar,
    }

    #[derive(Default)]
    struct WaitState {
        attached: std::collections::HashSet<u64>,
        pending: VecDeque<u64>,
    }

    impl TestWaitSet {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn notify(&self, endpoint_id: u64) {
            let mut state = self.state.lock().unwrap();
            if state.attached.contains(&endpoint_id) {
                state.pending.push_back(endpoint_id);
                self.cv.notify_all();
            }
        }
    }

    impl WaitSet for TestWaitSet {
        fn attach(&self, endpoint_id: u64) {
            self.state.lock().unwrap().attached.insert(endpoint_id);
        }

        fn detach(&self, endpoint_id: u64) {
            self.state.lock().unwrap().attached.remove(&endpoint_id);
        }

        fn timed_wait(&self, timeout: Duration) -> Vec<Notification> {
            let state = self.state.lock().unwrap();
            let (mut state, _) = self
                .cv
                .wait_timeout_while(state, timeout, |s| s.pending.is_empty())
                .unwrap();
            state.pending.drain(..).map(Notification::HasData).collect()
        }
    }

    #[derive(Default)]
    pub struct TestIntrospection {
        samples: Mutex<VecDeque<PortIntrospectionSample>>,
        published: Mutex<Vec<PublisherUid>>,
    }

    impl TestIntrospection {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn push_sample(&self, sample: PortIntrospectionSample) {
            self.samples.lock().unwrap().push_back(sample);
        }

        pub fn last_published(&self) -> Vec<PublisherUid> {
            self.published.lock().unwrap().clone()
        }
    }

    impl Introspection for TestIntrospection {
        fn take_sample(&self) -> Option<PortIntrospectionSample> {
            self.samples.lock().unwrap().pop_front()
        }

        fn publish_registered_publishers(&self, ports: &[PublisherUid]) {
            *self.published.lock().unwrap() = ports.to_vec();
        }
    }

    /// One `TestPublisher` per distinct topic, lazily minted on first
    /// reference and shared by every subsequent `subscriber_for`/
    /// `publisher_for` call for that topic — the same way a real fabric
    /// would hand back a handle onto the one shared-memory segment for a
    /// given `ServiceDescription`.
    #[derive(Default)]
    pub struct TestFabric {
        registry: Arc<Registry>,
        publishers: Mutex<HashMap<ServiceId, Arc<TestPublisher>>>,
        next_uid: AtomicU64,
        capacity: usize,
    }

    impl TestFabric {
        pub fn new(capacity: usize) -> Arc<Self> {
            Arc::new(Self {
                registry: Arc::new(Registry::default()),
                publishers: Mutex::new(HashMap::new()),
                next_uid: AtomicU64::new(1),
                capacity,
            })
        }

        fn publisher(&self, service: &ServiceId) -> Arc<TestPublisher> {
            let mut publishers = self.publishers.lock().unwrap();
            publishers
                .entry(service.clone())
                .or_insert_with(|| {
                    let uid = PublisherUid(self.next_uid.fetch_add(1, Ordering::Relaxed));
                    TestPublisher::with_registry(service.clone(), uid, self.capacity, Arc::clone(&self.registry))
                })
                .clone()
        }
    }

    impl Fabric for TestFabric {
        fn subscriber_for(&self, service: &ServiceId) -> Arc<dyn Subscriber> {
            self.publisher(service).subscribe() as Arc<dyn Subscriber>
        }

        fn publisher_for(&self, service: &ServiceId) -> Arc<dyn Publisher> {
            self.publisher(service) as Arc<dyn Publisher>
        }

        fn chunk_access(&self) -> Arc<dyn ChunkAccess> {
            Arc::clone(&self.registry) as Arc<dyn ChunkAccess>
        }

        fn new_waitset(&self) -> Arc<dyn WaitSet> {
            TestWaitSet::new() as Arc<dyn WaitSet>
        }

        fn introspection(&self) -> Arc<dyn Introspection> {
            TestIntrospection::new() as Arc<dyn Introspection>
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn publisher_subscriber_loan_publish_take_release() {
        let publisher = TestPublisher::new(ServiceId::new("s", "i", "e"), PublisherUid(1), 4);
        let subscriber = publisher.subscribe();
        let access = chunk_access(&publisher);

        let token = publisher.loan(10, 8, 0, 8).unwrap();
        access.write_payload_slice(token, 0, b"0123456789");
        publisher.publish(token);

        match subscriber.take() {
            TakeResult::Chunk(t) => {
                assert_eq!(access.read_payload(t), b"0123456789");
                subscriber.release(t);
            }
            other => panic!("expected chunk, got {other:?}"),
        }
        assert_eq!(subscriber.take(), TakeResult::NoChunk);
    }

    #[test]
    fn publisher_out_of_chunks_when_outbox_full() {
        let publisher = TestPublisher::new(ServiceId::new("s", "i", "e"), PublisherUid(1), 1);
        let t1 = publisher.loan(1, 1, 0, 1).unwrap();
        publisher.publish(t1);
        assert_eq!(publisher.loan(1, 1, 0, 1), Err(LoanError::OutOfChunks));
    }

    #[test]
    fn waitset_times_out_with_no_notifications() {
        let ws = TestWaitSet::new();
        ws.attach(1);
        let notifications = ws.timed_wait(std::time::Duration::from_millis(5));
        assert!(notifications.is_empty());
    }

    #[test]
    fn waitset_delivers_notification() {
        let ws = TestWaitSet::new();
        ws.attach(7);
        ws.notify(7);
        let notifications = ws.timed_wait(std::time::Duration::from_millis(50));
        assert_eq!(notifications, vec![Notification::HasData(7)]);
    }

    #[test]
    fn fabric_shares_one_publisher_per_topic() {
        let fabric = TestFabric::new(4);
        let service = ServiceId::new("s", "i", "e");

        let publisher = fabric.publisher_for(&service);
        let subscriber = fabric.subscriber_for(&service);
        let access = fabric.chunk_access();

        let token = publisher.loan(4, 4, 0, 4).unwrap();
        access.write_payload_slice(token, 0, b"abcd");
        publisher.publish(token);

        match subscriber.take() {
            TakeResult::Chunk(t) => assert_eq!(access.read_payload(t), b"abcd"),
            other => panic!("expected chunk, got {other:?}"),
        }

        // A second reference to the same topic reuses the same publisher
        // (and therefore the same chunk registry), not a fresh one.
        assert_eq!(fabric.publisher_for(&service).uid(), publisher.uid());
    }
}
