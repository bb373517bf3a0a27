//! Remote → Local adapter (R→L, `spec.md` §4.8): reassembles inbound
//! submessages and publishes completed messages into local topics.
//!
//! Grounded on `original_source/include/p3com/gateway/transport_to_iox.hpp`
//! and `.cpp` (`Transport2Iceoryx`). Unlike L→R and the Forwarder, this
//! adapter runs no reactor thread of its own: it is purely callback-driven,
//! registering on every enabled transport exactly as the original does.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::adapters::forwarder::TransportForwarder;
use crate::adapters::ChannelMap;
use crate::codec::{DatagramHeader, DATAGRAM_HEADER_SERIALIZATION_SIZE};
use crate::discovery::DiscoveryManager;
use crate::ipc::{ChunkAccess, ChunkToken, Fabric, Publisher};
use crate::reassembler::{DecrementOutcome, Reassembler};
use crate::transport::registry::TransportRegistry;
use crate::transport::BufferHandle;
use crate::types::{DeviceIndex, MessageHash, ServiceHash, ServiceId, USER_HEADER_ALIGNMENT};

pub struct RemoteToLocal {
    fabric: Arc<dyn Fabric>,
    discovery: Arc<DiscoveryManager>,
    reassembler: Arc<Reassembler>,
    forwarder: Arc<TransportForwarder>,
    channels: ChannelMap<Arc<dyn Publisher>>,
    /// Chunks loaned early by `buffer_needed`, ahead of the body bytes
    /// arriving, keyed the same way a DMA transport would key the
    /// destination address: by the topic and message the header names.
    /// Consumed by `handle_submessage` on the matching first submessage,
    /// or released back unpublished if the transfer aborts.
    preloaded: Mutex<HashMap<(ServiceHash, MessageHash), ChunkToken>>,
}

impl RemoteToLocal {
    pub fn new(
        fabric: Arc<dyn Fabric>,
        registry: Arc<TransportRegistry>,
        discovery: Arc<DiscoveryManager>,
        reassembler: Arc<Reassembler>,
        forwarder: Arc<TransportForwarder>,
    ) -> Arc<Self> {
        let adapter = Arc::new(Self {
            fabric,
            discovery,
            reassembler,
            forwarder,
            channels: ChannelMap::new(),
            preloaded: Mutex::new(HashMap::new()),
        });

        let weak: Weak<RemoteToLocal> = Arc::downgrade(&adapter);
        registry.for_each_enabled(|transport| {
            let user_data_weak = weak.clone();
            transport.register_user_data_callback(Box::new(move |bytes, device| {
                if let Some(adapter) = user_data_weak.upgrade() {
                    adapter.receive(bytes, device);
                }
            }));

            let buffer_needed_weak = weak.clone();
            transport.register_buffer_needed_callback(Box::new(move |header_bytes| {
                buffer_needed_weak.upgrade().and_then(|adapter| adapter.buffer_needed(header_bytes))
            }));

            let buffer_released_weak = weak.clone();
            transport.register_buffer_released_callback(Box::new(move |header_bytes, success, device| {
                if let Some(adapter) = buffer_released_weak.upgrade() {
                    adapter.buffer_released(header_bytes, success, device);
                }
            }));
        });

        adapter
    }

    /// Reconcile the set of local publishers to exactly `needed`.
    pub fn update_channels(&self, needed: &[ServiceId]) {
        let fabric = &self.fabric;
        let discovery = &self.discovery;
        let reassembler = &self.reassembler;
        self.channels.update(
            needed,
            |service| {
                let publisher = fabric.publisher_for(service);
                discovery.add_gateway_publisher(publisher.uid());
                log::info!("remote_to_local: publishing into {service}");
                Some(publisher)
            },
            |service, publisher| {
                reassembler.release_all(publisher.uid());
                discovery.discard_gateway_publisher(publisher.uid());
                log::info!("remote_to_local: stopped publishing into {service}");
            },
        );
    }

    fn receive(&self, bytes: &[u8], device: DeviceIndex) {
        let header = match DatagramHeader::deserialize(bytes) {
            Ok(header) => header,
            Err(e) => {
                warn!("remote_to_local: dropping malformed datagram header: {e}");
                return;
            }
        };
        let body = &bytes[DATAGRAM_HEADER_SERIALIZATION_SIZE..];
        if body.len() != header.submessage_size as usize {
            warn!("remote_to_local: submessage size mismatch ({} != {}), dropping", body.len(), header.submessage_size);
            return;
        }

        let completed = self
            .channels
            .with(header.service_hash, |_service, publisher| {
                self.handle_submessage(publisher, &header, body).map(|chunk| (chunk, Arc::clone(publisher)))
            })
            .flatten();

        if let Some((chunk, publisher)) = completed {
            self.forwarder.push(chunk, header.service_hash, device);
            publisher.publish(chunk);
        }
    }

    /// Returns `Some(chunk)` once the message this submessage belongs to is
    /// complete and ready to publish.
    fn handle_submessage(&self, publisher: &Arc<dyn Publisher>, header: &DatagramHeader, body: &[u8]) -> Option<ChunkToken> {
        let access = self.fabric.chunk_access();

        if header.submessage_offset == 0 {
            let preloaded = self.preloaded.lock().unwrap().remove(&(header.service_hash, header.message_hash));
            let chunk = match preloaded {
                Some(chunk) => chunk,
                None => match publisher.loan(header.user_payload_size, header.user_payload_alignment, header.user_header_size, USER_HEADER_ALIGNMENT) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("remote_to_local: loan failed ({e:?}), dropping submessage for message {:?}", header.message_hash);
                        return None;
                    }
                },
            };
            copy_submessage(access.as_ref(), chunk, header.user_header_size, header.submessage_offset, body);

            if header.submessage_count <= 1 {
                return Some(chunk);
            }
            let deadline = Reassembler::deadline_for(header.user_header_size + header.user_payload_size);
            self.reassembler.push(header.message_hash, header.submessage_count - 1, chunk, Arc::clone(publisher), deadline);
            None
        } else {
            let Some(chunk) = self.reassembler.find(header.message_hash) else {
                debug!("remote_to_local: no reassembly entry for message {:?} (likely torn down mid-flight)", header.message_hash);
                return None;
            };
            copy_submessage(access.as_ref(), chunk, header.user_header_size, header.submessage_offset, body);

            match self.reassembler.find_and_decrement(header.message_hash) {
                DecrementOutcome::Complete { chunk, .. } => Some(chunk),
                DecrementOutcome::Continuing | DecrementOutcome::NotFound => None,
            }
        }
    }

    /// DMA-capable transports call this ahead of the body bytes arriving,
    /// so the destination chunk exists before the transfer starts. Only
    /// the first submessage of a message needs a fresh chunk; later
    /// submessages land in the one the Reassembler is already holding.
    fn buffer_needed(&self, header_bytes: &[u8]) -> Option<BufferHandle> {
        let header = DatagramHeader::deserialize(header_bytes).ok()?;
        if header.submessage_offset != 0 {
            return None;
        }
        let chunk = self
            .channels
            .with(header.service_hash, |_service, publisher| {
                publisher
                    .loan(header.user_payload_size, header.user_payload_alignment, header.user_header_size, USER_HEADER_ALIGNMENT)
                    .ok()
            })
            .flatten()?;
        self.preloaded.lock().unwrap().insert((header.service_hash, header.message_hash), chunk);
        Some(BufferHandle(header.message_hash.0 as u64))
    }

    /// Fires once the transfer a prior `buffer_needed` primed has finished
    /// or aborted. On success the chunk was already consumed by
    /// `handle_submessage`; on failure it is still sitting in `preloaded`
    /// and must be released back unpublished.
    fn buffer_released(&self, header_bytes: &[u8], success: bool, _device: DeviceIndex) {
        if success {
            return;
        }
        let Ok(header) = DatagramHeader::deserialize(header_bytes) else {
            return;
        };
        let key = (header.service_hash, header.message_hash);
        if let Some(chunk) = self.preloaded.lock().unwrap().remove(&key) {
            self.channels.with(header.service_hash, |_service, publisher| publisher.release(chunk));
            warn!("remote_to_local: buffer transfer aborted for message {:?}, releasing preloaned chunk", header.message_hash);
        }
    }
}

/// Copy one submessage's bytes into the loaned chunk at the right region:
/// offsets below `total_header` land in the user header, the rest in the
/// payload at `offset - total_header` (mirrors the Segmenter's own
/// header-then-payload iteration order).
fn copy_submessage(access: &dyn ChunkAccess, chunk: ChunkToken, total_header: u32, offset: u32, body: &[u8]) {
    if offset < total_header {
        access.write_header_slice(chunk, offset, body);
    } else {
        access.write_payload_slice(chunk, offset - total_header, body);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ipc::testing::{TestFabric, TestWaitSet};
    use crate::pending::PendingTracker;
    use crate::transport::registry::TransportRegistry;
    use crate::types::{MessageHash, ServiceId, TransportKind};

    fn header_for(service: ServiceId, message_hash: MessageHash, count: u32, offset: u32, payload: &[u8]) -> (DatagramHeader, Vec<u8>) {
        let header = DatagramHeader {
            service_hash: service.hash(),
            message_hash,
            submessage_count: count,
            submessage_offset: offset,
            submessage_size: payload.len() as u32,
            user_payload_size: 8,
            user_payload_alignment: 4,
            user_header_size: 0,
        };
        let mut bytes = [0u8; DATAGRAM_HEADER_SERIALIZATION_SIZE];
        header.serialize(&mut bytes);
        let mut framed = bytes.to_vec();
        framed.extend_from_slice(payload);
        (header, framed)
    }

    fn harness(service: ServiceId) -> (Arc<RemoteToLocal>, Arc<TestFabric>) {
        let fabric = TestFabric::new(8);
        let registry = Arc::new(TransportRegistry::new());
        let introspection = crate::ipc::testing::TestIntrospection::new();
        let discovery = DiscoveryManager::new(Arc::clone(&registry), introspection, TestWaitSet::new(), None);
        let reassembler = Arc::new(Reassembler::new());
        let pending = Arc::new(PendingTracker::new());
        let forwarder_waitset = TestWaitSet::new();
        let forwarder = TransportForwarder::new(fabric.clone(), Arc::clone(&registry), pending, Arc::clone(&discovery), forwarder_waitset, &[]);
        let adapter = RemoteToLocal::new(fabric.clone(), registry, discovery, reassembler, forwarder);
        adapter.update_channels(&[service]);
        (adapter, fabric)
    }

    #[test]
    fn single_submessage_message_publishes_immediately() {
        let service = ServiceId::new("s", "i", "e");
        let (adapter, fabric) = harness(service.clone());
        let subscriber = fabric.subscriber_for(&service);

        let (_header, framed) = header_for(service.clone(), MessageHash(1), 1, 0, b"12345678");
        adapter.receive(&framed, DeviceIndex::new(TransportKind::Datagram, 3));

        match subscriber.take() {
            crate::ipc::TakeResult::Chunk(chunk) => {
                assert_eq!(fabric.chunk_access().read_payload(chunk), b"12345678");
            }
            other => panic!("expected a published chunk, got {other:?}"),
        }
    }

    #[test]
    fn two_submessage_message_publishes_only_once_complete() {
        let service = ServiceId::new("s", "i", "e");
        let (adapter, fabric) = harness(service.clone());
        let subscriber = fabric.subscriber_for(&service);

        let (_h1, first) = header_for(service.clone(), MessageHash(2), 2, 0, b"1234");
        adapter.receive(&first, DeviceIndex::new(TransportKind::Datagram, 0));
        assert_eq!(subscriber.take(), crate::ipc::TakeResult::NoChunk);

        let (_h2, second) = header_for(service.clone(), MessageHash(2), 2, 4, b"5678");
        adapter.receive(&second, DeviceIndex::new(TransportKind::Datagram, 0));

        match subscriber.take() {
            crate::ipc::TakeResult::Chunk(chunk) => {
                assert_eq!(fabric.chunk_access().read_payload(chunk), b"12345678");
            }
            other => panic!("expected a published chunk, got {other:?}"),
        }
    }

    #[test]
    fn unknown_topic_is_dropped_without_panicking() {
        let service = ServiceId::new("s", "i", "e");
        let (adapter, _fabric) = harness(service.clone());
        let other = ServiceId::new("other", "i", "e");
        let (_header, framed) = header_for(other, MessageHash(9), 1, 0, b"12345678");
        adapter.receive(&framed, DeviceIndex::new(TransportKind::Datagram, 0));
    }
}
