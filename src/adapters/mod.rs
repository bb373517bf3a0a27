//! Direction Adapters (C8, `spec.md` §4.8): the two directional bridges
//! between local topics and the network, plus the cross-transport
//! forwarder. Grounded on `original_source/include/p3com/gateway/
//! {iox_to_transport,transport_to_iox}.hpp` and
//! `generic/transport_forwarder.hpp`.

pub mod forwarder;
pub mod local_to_remote;
pub mod remote_to_local;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{ServiceHash, ServiceId};

/// A bounded hash-keyed channel table, the Rust analogue of the original's
/// generic `Gateway<Endpoint>` base (`gateway.hpp`): both `Iceoryx2Transport`
/// (L→R) and `Transport2Iceoryx` (R→L) inherited the same
/// `m_endpoints: vector_map<ClassHash, unique_ptr<Endpoint>, MAX_TOPICS>`
/// plus `updateChannelsInternal`/`doForChannel` pair. Keyed by hash rather
/// than `ServiceId` because the one piece of wire data that names a topic
/// on the ingress path — `DatagramHeader::service_hash` — never carries the
/// full name back.
pub struct ChannelMap<T> {
    channels: Mutex<HashMap<ServiceHash, (ServiceId, T)>>,
}

impl<T> Default for ChannelMap<T> {
    fn default() -> Self {
        Self { channels: Mutex::new(HashMap::new()) }
    }
}

impl<T> ChannelMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the channel set against `needed`, discarding channels for
    /// topics no longer needed before creating channels for newly-needed
    /// ones (`updateChannelsInternal`'s order).
    pub fn update(&self, needed: &[ServiceId], mut setup: impl FnMut(&ServiceId) -> Option<T>, mut discard: impl FnMut(ServiceId, T)) {
        let mut channels = self.channels.lock().unwrap();

        let needed_hashes: std::collections::HashSet<ServiceHash> = needed.iter().map(ServiceId::hash).collect();
        let to_discard: Vec<ServiceHash> = channels.keys().filter(|h| !needed_hashes.contains(h)).copied().collect();
        for hash in to_discard {
            if let Some((id, endpoint)) = channels.remove(&hash) {
                discard(id, endpoint);
            }
        }

        for id in needed {
            let hash = id.hash();
            if !channels.contains_key(&hash) {
                if let Some(endpoint) = setup(id) {
                    channels.insert(hash, (id.clone(), endpoint));
                }
            }
        }
    }

    /// `doForChannel`: run `f` against the channel for `hash`, if any.
    pub fn with<R>(&self, hash: ServiceHash, f: impl FnOnce(&ServiceId, &T) -> R) -> Option<R> {
        let channels = self.channels.lock().unwrap();
        let (id, endpoint) = channels.get(&hash)?;
        Some(f(id, endpoint))
    }

    /// Reverse lookup from a wait-set endpoint id to the topic hash that
    /// registered it. A linear scan is acceptable: channel counts are
    /// bounded by `MAX_TOPICS`.
    pub fn hash_for_endpoint(&self, endpoint_id: u64) -> Option<ServiceHash> {
        self.channels.lock().unwrap().keys().find(|h| h.0 == endpoint_id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_creates_and_discards_channels() {
        let map: ChannelMap<u32> = ChannelMap::new();
        let a = ServiceId::new("a", "i", "e");
        let b = ServiceId::new("b", "i", "e");

        let mut created = Vec::new();
        map.update(&[a.clone()], |id| { created.push(id.clone()); Some(1) }, |_, _| panic!("nothing to discard yet"));
        assert_eq!(created, vec![a.clone()]);
        assert_eq!(map.with(a.hash(), |_, v| *v), Some(1));

        let mut discarded = Vec::new();
        map.update(&[b.clone()], |id| { created.push(id.clone()); Some(2) }, |id, v| discarded.push((id, v)));
        assert_eq!(discarded, vec![(a.clone(), 1)]);
        assert_eq!(map.with(a.hash(), |_, v| *v), None);
        assert_eq!(map.with(b.hash(), |_, v| *v), Some(2));
    }

    #[test]
    fn update_is_idempotent_for_already_present_topics() {
        let map: ChannelMap<u32> = ChannelMap::new();
        let a = ServiceId::new("a", "i", "e");
        let mut setup_calls = 0;
        map.update(&[a.clone()], |_| { setup_calls += 1; Some(1) }, |_, _| {});
        map.update(&[a.clone()], |_| { setup_calls += 1; Some(1) }, |_, _| {});
        assert_eq!(setup_calls, 1);
    }

    #[test]
    fn hash_for_endpoint_finds_registered_topic() {
        let map: ChannelMap<u32> = ChannelMap::new();
        let a = ServiceId::new("a", "i", "e");
        map.update(&[a.clone()], |_| Some(1), |_, _| {});
        assert_eq!(map.hash_for_endpoint(a.hash().0), Some(a.hash()));
        assert_eq!(map.hash_for_endpoint(0xdead_beef), None);
    }
}
