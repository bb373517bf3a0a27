//! Cross-transport Forwarder (`spec.md` §4.8): re-segments a message that
//! just arrived from one remote peer onto transports that reach peers the
//! originating peer could not reach directly.
//!
//! Grounded on `original_source/include/p3com/generic/transport_forwarder.hpp`
//! and `.cpp` (`TransportForwarder`). Only services explicitly configured
//! for forwarding (bounded by `MAX_FORWARDED_SERVICES`) get a local
//! subscriber here; the reactor thread is only spawned if that list is
//! non-empty, matching the original's `if (!forwardedServices.empty())`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::warn;

use crate::discovery::DiscoveryManager;
use crate::ipc::{ChunkToken, Fabric, Notification, Subscriber, TakeResult, WaitSet};
use crate::pending::PendingTracker;
use crate::segmenter::write_segmented;
use crate::transport::registry::TransportRegistry;
use crate::types::{DeviceIndex, MessageHash, ServiceHash, ServiceId, TransportKind, MAX_FORWARDED_SERVICES, REACTOR_TICK};

struct ForwardedChannel {
    service: ServiceId,
    subscriber: Arc<dyn Subscriber>,
}

pub struct TransportForwarder {
    fabric: Arc<dyn Fabric>,
    registry: Arc<TransportRegistry>,
    pending: Arc<PendingTracker>,
    discovery: Arc<DiscoveryManager>,
    waitset: Arc<dyn WaitSet>,
    channels: Vec<ForwardedChannel>,
    messages_to_forward: Mutex<HashMap<ChunkToken, DeviceIndex>>,
    terminated: AtomicBool,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl TransportForwarder {
    pub fn new(
        fabric: Arc<dyn Fabric>,
        registry: Arc<TransportRegistry>,
        pending: Arc<PendingTracker>,
        discovery: Arc<DiscoveryManager>,
        waitset: Arc<dyn WaitSet>,
        forwarded_services: &[ServiceId],
    ) -> Arc<Self> {
        if forwarded_services.len() > MAX_FORWARDED_SERVICES {
            warn!(
                "forwarder: {} forwarded services configured, truncating to {MAX_FORWARDED_SERVICES}",
                forwarded_services.len()
            );
        }

        let channels: Vec<ForwardedChannel> = forwarded_services
            .iter()
            .take(MAX_FORWARDED_SERVICES)
            .map(|service| {
                let subscriber = fabric.subscriber_for(service);
                waitset.attach(service.hash().0);
                ForwardedChannel { service: service.clone(), subscriber }
            })
            .collect();

        let forwarder = Arc::new(Self {
            fabric,
            registry,
            pending,
            discovery,
            waitset,
            channels,
            messages_to_forward: Mutex::new(HashMap::new()),
            terminated: AtomicBool::new(false),
            reactor: Mutex::new(None),
        });

        if !forwarder.channels.is_empty() {
            let me = Arc::clone(&forwarder);
            let handle = std::thread::spawn(move || me.reactor_loop());
            *forwarder.reactor.lock().unwrap() = Some(handle);
        }

        forwarder
    }

    /// Record the source device of a just-published or just-forwarded
    /// message, if `service_hash` is one of the explicitly-forwarded
    /// topics. Called by the R→L adapter right after a reassembly
    /// completes, before the chunk is handed to the local publisher.
    pub fn push(&self, chunk: ChunkToken, service_hash: ServiceHash, from_device: DeviceIndex) {
        if !self.channels.iter().any(|c| c.service.hash() == service_hash) {
            return;
        }
        self.messages_to_forward.lock().unwrap().insert(chunk, from_device);
    }

    pub fn join(&self) {
        self.terminated.store(true, Ordering::Release);
        if let Some(handle) = self.reactor.lock().unwrap().take() {
            let _ = handle.join();
        }
        for channel in &self.channels {
            self.waitset.detach(channel.service.hash().0);
        }
    }

    fn reactor_loop(self: Arc<Self>) {
        while !self.terminated.load(Ordering::Acquire) {
            for notification in self.waitset.timed_wait(REACTOR_TICK) {
                let Notification::HasData(endpoint_id) = notification;
                if let Some(channel) = self.channels.iter().find(|c| c.service.hash().0 == endpoint_id) {
                    self.drain_channel(channel);
                }
            }
        }
    }

    fn drain_channel(&self, channel: &ForwardedChannel) {
        loop {
            match channel.subscriber.take() {
                TakeResult::Chunk(chunk) => self.forward_chunk(channel, chunk),
                TakeResult::NoChunk | TakeResult::TooManyHeld => break,
            }
        }
    }

    fn forward_chunk(&self, channel: &ForwardedChannel, chunk: ChunkToken) {
        let from_device = self
            .messages_to_forward
            .lock()
            .unwrap()
            .remove(&chunk)
            .unwrap_or(DeviceIndex::new(TransportKind::None, 0));

        let service_hash = channel.service.hash();
        let destinations = self.discovery.device_indices_for_forwarding(service_hash, from_device);
        if destinations.is_empty() {
            channel.subscriber.release(chunk);
            return;
        }

        let access = self.fabric.chunk_access();
        write_segmented(
            &self.registry,
            &self.pending,
            access.as_ref(),
            &channel.subscriber,
            chunk,
            service_hash,
            MessageHash::generate(),
            &destinations,
        );
    }
}
