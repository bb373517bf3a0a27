//! Local → Remote adapter (L→R, `spec.md` §4.8): subscribes to the local
//! topics the Discovery Manager says are needed, and on each new sample
//! resolves destinations and segments it onto the network.
//!
//! Grounded on `original_source/include/p3com/gateway/iox_to_transport.hpp`
//! and `.cpp` (`Iceoryx2Transport`). The original guards subscriber
//! attach/detach against its own concurrently-running wait-set thread with
//! a `m_suspendFlag` + `m_waitsetMutex` pair; here `WaitSet::attach`/
//! `detach`/`timed_wait` are required by their trait contract to already be
//! safe to call from another thread while a `timed_wait` is in flight
//! (`spec.md` §6), so no extra suspend dance is needed on this side — see
//! DESIGN.md.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::info;

use crate::adapters::ChannelMap;
use crate::discovery::DiscoveryManager;
use crate::ipc::{ChunkToken, Fabric, Notification, Subscriber, TakeResult, WaitSet};
use crate::pending::PendingTracker;
use crate::segmenter::write_segmented;
use crate::transport::registry::TransportRegistry;
use crate::types::{MessageHash, ServiceId, REACTOR_TICK};

/// Bound on how long `update_channels` waits for a discarded subscriber's
/// in-flight pending sends to drain before dropping it. The original spins
/// forever (`spec.md` §9 "busy-wait drains"); a bounded wait keeps teardown
/// from hanging the whole gateway on one wedged transport.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Channel {
    subscriber: Arc<dyn Subscriber>,
}

pub struct LocalToRemote {
    fabric: Arc<dyn Fabric>,
    registry: Arc<TransportRegistry>,
    pending: Arc<PendingTracker>,
    discovery: Arc<DiscoveryManager>,
    waitset: Arc<dyn WaitSet>,
    channels: ChannelMap<Channel>,
    terminated: AtomicBool,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl LocalToRemote {
    pub fn new(
        fabric: Arc<dyn Fabric>,
        registry: Arc<TransportRegistry>,
        pending: Arc<PendingTracker>,
        discovery: Arc<DiscoveryManager>,
        waitset: Arc<dyn WaitSet>,
    ) -> Arc<Self> {
        Arc::new(Self {
            fabric,
            registry,
            pending,
            discovery,
            waitset,
            channels: ChannelMap::new(),
            terminated: AtomicBool::new(false),
            reactor: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let adapter = Arc::clone(self);
        *self.reactor.lock().unwrap() = Some(std::thread::spawn(move || adapter.reactor_loop()));
    }

    pub fn join(&self) {
        self.terminated.store(true, Ordering::Release);
        if let Some(handle) = self.reactor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Reconcile the set of subscribed topics to exactly `needed`
    /// (`updateChannels`, called from the Discovery Manager's update
    /// callback whenever local or remote inventory changes).
    pub fn update_channels(&self, needed: &[ServiceId]) {
        let fabric = &self.fabric;
        let waitset = &self.waitset;
        let pending = &self.pending;
        self.channels.update(
            needed,
            |service| {
                let subscriber = fabric.subscriber_for(service);
                waitset.attach(service.hash().0);
                info!("local_to_remote: subscribed to {service}");
                Some(Channel { subscriber })
            },
            |service, channel| {
                waitset.detach(service.hash().0);
                channel.subscriber.unsubscribe();
                pending.wait_for_drain(&service, DRAIN_TIMEOUT);
                info!("local_to_remote: unsubscribed from {service}");
            },
        );
    }

    fn reactor_loop(self: Arc<Self>) {
        while !self.terminated.load(Ordering::Acquire) {
            for notification in self.waitset.timed_wait(REACTOR_TICK) {
                let Notification::HasData(endpoint_id) = notification;
                self.drain_notified(endpoint_id);
            }
        }
    }

    fn drain_notified(&self, endpoint_id: u64) {
        let Some(hash) = self.channels.hash_for_endpoint(endpoint_id) else {
            return;
        };
        self.channels.with(hash, |service, channel| loop {
            match channel.subscriber.take() {
                TakeResult::Chunk(chunk) => self.forward_chunk(service, &channel.subscriber, chunk),
                TakeResult::NoChunk | TakeResult::TooManyHeld => break,
            }
        });
    }

    fn forward_chunk(&self, service: &ServiceId, subscriber: &Arc<dyn Subscriber>, chunk: ChunkToken) {
        let access = self.fabric.chunk_access();
        let header = access.header(chunk);
        let service_hash = service.hash();
        let destinations = self.discovery.device_indices_for_egress(header.origin_id, service_hash);
        if destinations.is_empty() {
            subscriber.release(chunk);
            return;
        }
        write_segmented(
            &self.registry,
            &self.pending,
            access.as_ref(),
            subscriber,
            chunk,
            service_hash,
            MessageHash::generate(),
            &destinations,
        );
    }
}
