//! Segmenter (C5, egress path, `spec.md` §4.5): splits one local message
//! into transport-sized submessages per destination, registering
//! asynchronous sends with the Pending tracker.

use std::sync::Arc;

use log::{error, warn};

use crate::codec::{DatagramHeader, DATAGRAM_HEADER_SERIALIZATION_SIZE};
use crate::ipc::{ChunkAccess, ChunkToken, Subscriber};
use crate::pending::PendingTracker;
use crate::transport::registry::TransportRegistry;
use crate::transport::BufferHandle;
use crate::types::{DeviceIndex, MessageHash, ServiceHash};

fn ceil_div(total: usize, budget: usize) -> usize {
    if total == 0 {
        0
    } else {
        total.div_ceil(budget)
    }
}

/// Splits `chunk` into submessages for each of `destinations` and drives
/// them through the Transport Registry. Mirrors `spec.md` §4.5 steps 1-5
/// exactly: a-priori pending classification and registration, per-
/// submessage budget, header-then-payload iteration order, the
/// at-most-one-pending-submessage invariant, and release on decline.
pub fn write_segmented(
    registry: &TransportRegistry,
    pending: &PendingTracker,
    chunk_access: &dyn ChunkAccess,
    subscriber: &Arc<dyn Subscriber>,
    chunk: ChunkToken,
    service_hash: ServiceHash,
    message_hash: MessageHash,
    destinations: &[DeviceIndex],
) {
    let header_meta = chunk_access.header(chunk);
    let header_bytes = chunk_access.read_header(chunk);
    let payload_bytes = chunk_access.read_payload(chunk);

    let mut went_pending = false;

    for dest in destinations {
        let mut pending_registration_failed = false;
        let mut pending_seen_out = false;
        let sent = registry.with_transport(dest.kind, |transport| {
            let budget = transport.max_message_size().saturating_sub(DATAGRAM_HEADER_SERIALIZATION_SIZE);
            if budget == 0 {
                warn!("segmenter: transport {} max_message_size too small for any submessage", dest.kind);
                return false;
            }

            let will_pend = transport.will_be_pending(header_meta.user_payload_size as usize);
            if will_pend && pending.push(chunk, Arc::clone(subscriber)).is_err() {
                pending_registration_failed = true;
                return false;
            }
            let registered_pending = will_pend;

            let total_header = header_meta.user_header_size as usize;
            let total_payload = header_meta.user_payload_size as usize;
            let header_submessages = ceil_div(total_header, budget);
            let payload_submessages = ceil_div(total_payload, budget);
            let submessage_count = (header_submessages + payload_submessages) as u32;

            let mut pending_seen = false;

            for i in 0..header_submessages {
                let start = i * budget;
                let end = (start + budget).min(total_header);
                let was_pending = send_submessage(
                    transport.as_ref(),
                    service_hash,
                    message_hash,
                    &header_meta,
                    submessage_count,
                    start as u32,
                    &header_bytes[start..end],
                    dest.device,
                    chunk,
                );
                if was_pending {
                    error!("segmenter: header submessage reported pending, which is a protocol violation");
                }
            }

            for i in 0..payload_submessages {
                let start = i * budget;
                let end = (start + budget).min(total_payload);
                let offset = total_header + start;
                let was_pending = send_submessage(
                    transport.as_ref(),
                    service_hash,
                    message_hash,
                    &header_meta,
                    submessage_count,
                    offset as u32,
                    &payload_bytes[start..end],
                    dest.device,
                    chunk,
                );
                if was_pending {
                    if pending_seen {
                        error!("segmenter: more than one pending submessage for message {message_hash:?}");
                    }
                    pending_seen = true;
                }
            }

            if registered_pending && !pending_seen {
                // The transport declined to go asynchronous after all.
                pending.release(chunk);
            } else if registered_pending {
                pending_seen_out = true;
            }
            true
        });

        if pending_registration_failed {
            // Pending tracker at capacity: release the chunk locally and
            // abandon the remaining destinations for this message
            // (`spec.md` §4.5 step 1) rather than risk a second,
            // untracked in-flight send on an already-released chunk.
            subscriber.release(chunk);
            return;
        }
        if sent.is_none() {
            warn!("segmenter: transport {} unavailable for destination, dropping", dest.kind);
        }
        if pending_seen_out {
            went_pending = true;
        }
    }

    if !went_pending {
        // No destination took the chunk asynchronous; every send that
        // happened, happened synchronously inside this call, so the
        // subscriber's hold is safe to release now.
        subscriber.release(chunk);
    }
}

#[allow(clippy::too_many_arguments)]
fn send_submessage(
    transport: &dyn crate::transport::Transport,
    service_hash: ServiceHash,
    message_hash: MessageHash,
    header_meta: &crate::ipc::ChunkHeader,
    submessage_count: u32,
    submessage_offset: u32,
    body: &[u8],
    device: u32,
    chunk: ChunkToken,
) -> bool {
    let wire_header = DatagramHeader {
        service_hash,
        message_hash,
        submessage_count,
        submessage_offset,
        submessage_size: body.len() as u32,
        user_payload_size: header_meta.user_payload_size,
        user_payload_alignment: header_meta.user_payload_alignment,
        user_header_size: header_meta.user_header_size,
    };
    let mut bytes = [0u8; DATAGRAM_HEADER_SERIALIZATION_SIZE];
    wire_header.serialize(&mut bytes);
    transport.send_user_data(&bytes, body, device, BufferHandle(chunk.0))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::ipc::testing::{chunk_access, TestPublisher};
    use crate::ipc::PublisherUid;
    use crate::transport::registry::TransportRegistry;
    use crate::transport::{StatusCell, Transport, TransportStatus};
    use crate::types::{ServiceId, TransportKind};

    struct RecordingTransport {
        kind: TransportKind,
        status: StatusCell,
        max_size: usize,
        sends: Mutex<Vec<(Vec<u8>, Vec<u8>, u32)>>,
        calls: AtomicUsize,
    }

    impl Transport for RecordingTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }
        fn status(&self) -> TransportStatus {
            self.status.get()
        }
        fn register_discovery_callback(&self, _callback: crate::transport::DiscoveryCallback) {}
        fn register_user_data_callback(&self, _callback: crate::transport::UserDataCallback) {}
        fn send_broadcast(&self, _bytes: &[u8]) {}
        fn send_user_data(&self, header: &[u8], payload: &[u8], device: u32, _handle: BufferHandle) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sends.lock().unwrap().push((header.to_vec(), payload.to_vec(), device));
            false // synchronous for this test fixture
        }
        fn max_message_size(&self) -> usize {
            self.max_size
        }
    }

    fn synchronous_transport(kind: TransportKind, max_size: usize) -> Arc<RecordingTransport> {
        Arc::new(RecordingTransport {
            kind,
            status: StatusCell::new(),
            max_size,
            sends: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn splits_payload_into_expected_submessage_count() {
        let registry = TransportRegistry::new();
        let transport = synchronous_transport(TransportKind::Datagram, 1040);
        registry.enable(transport.clone());

        let pending = PendingTracker::new();
        let publisher = TestPublisher::new(ServiceId::new("s", "i", "e"), PublisherUid(1), 4);
        let subscriber = publisher.subscribe() as Arc<dyn crate::ipc::Subscriber>;
        let access = chunk_access(&publisher);

        let chunk = publisher.loan(2500, 8, 0, 8).unwrap();
        let service_hash = ServiceId::new("s", "i", "e").hash();
        let dest = DeviceIndex::new(TransportKind::Datagram, 0);

        write_segmented(
            &registry,
            &pending,
            access.as_ref(),
            &subscriber,
            chunk,
            service_hash,
            MessageHash(7),
            &[dest],
        );

        let sends = transport.sends.lock().unwrap();
        assert_eq!(sends.len(), 3); // budget 1000, 2500B payload => 3 submessages, 0B header
        let total_sent: usize = sends.iter().map(|(_, body, _)| body.len()).sum();
        assert_eq!(total_sent, 2500);
    }

    #[test]
    fn unavailable_destination_transport_is_skipped_without_panicking() {
        let registry = TransportRegistry::new();
        let pending = PendingTracker::new();
        let publisher = TestPublisher::new(ServiceId::new("s", "i", "e"), PublisherUid(1), 4);
        let subscriber = publisher.subscribe() as Arc<dyn crate::ipc::Subscriber>;
        let access = chunk_access(&publisher);
        let chunk = publisher.loan(10, 8, 0, 8).unwrap();
        let service_hash = ServiceId::new("s", "i", "e").hash();
        let dest = DeviceIndex::new(TransportKind::Stream, 0); // no Stream transport enabled

        write_segmented(&registry, &pending, access.as_ref(), &subscriber, chunk, service_hash, MessageHash(1), &[dest]);
        // No panic, and nothing was registered as pending.
        assert!(!pending.any_pending(subscriber.service()));
    }
}
