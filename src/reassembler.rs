//! Reassembler (C6, `spec.md` §4.6): accumulates submessages of one
//! `message_hash` into a loaned publisher chunk, with a per-message
//! deadline, until every submessage has arrived.
//!
//! `MAX_SEGMENTED_MESSAGES` is pinned from the original's
//! `MAX_SEGMENTED_MESSAGE_COUNT` (see DESIGN.md).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::warn;

use crate::ipc::{ChunkToken, Publisher, PublisherUid};
use crate::types::{MessageHash, MAX_SEGMENTED_MESSAGES, PER_BYTE_REASSEMBLY_BUDGET};

struct Entry {
    remaining_segments: u32,
    chunk: ChunkToken,
    publisher: Arc<dyn Publisher>,
    deadline: Instant,
}

/// Outcome of `find_and_decrement` (`spec.md` §4.6).
pub enum DecrementOutcome {
    /// The message is not yet complete; nothing to publish.
    Continuing,
    /// This was the last outstanding submessage.
    Complete { chunk: ChunkToken, publisher: Arc<dyn Publisher> },
    /// No entry for this `message_hash` — already completed, timed out,
    /// or released during a publisher teardown race (`spec.md` §9).
    NotFound,
}

#[derive(Default)]
pub struct Reassembler {
    entries: Mutex<HashMap<u32, Entry>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the deadline for a message of total size `header_size +
    /// payload_size` bytes, per `spec.md` §3's conservative per-byte
    /// budget.
    pub fn deadline_for(total_bytes: u32) -> Instant {
        Instant::now() + PER_BYTE_REASSEMBLY_BUDGET * total_bytes
    }

    /// Register the first submessage of a multi-segment message.
    pub fn push(
        &self,
        hash: MessageHash,
        remaining_segments: u32,
        chunk: ChunkToken,
        publisher: Arc<dyn Publisher>,
        deadline: Instant,
    ) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= MAX_SEGMENTED_MESSAGES && !entries.contains_key(&hash.0) {
            warn!("reassembler: capacity exceeded ({MAX_SEGMENTED_MESSAGES}), dropping chunk for message {hash:?}");
            publisher.release(chunk);
            return;
        }
        entries.insert(
            hash.0,
            Entry { remaining_segments, chunk, publisher, deadline },
        );
    }

    /// Decrement the remaining-segment count for `hash`. Returns
    /// `Complete` exactly once, when the count reaches zero.
    pub fn find_and_decrement(&self, hash: MessageHash) -> DecrementOutcome {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&hash.0) else {
            return DecrementOutcome::NotFound;
        };
        entry.remaining_segments = entry.remaining_segments.saturating_sub(1);
        if entry.remaining_segments == 0 {
            let entry = entries.remove(&hash.0).expect("just looked up");
            DecrementOutcome::Complete { chunk: entry.chunk, publisher: entry.publisher }
        } else {
            DecrementOutcome::Continuing
        }
    }

    /// Read-only pointer lookup, used by the `buffer_needed` path to hand
    /// a DMA transport a destination pointer for an already-started
    /// reassembly.
    pub fn find(&self, hash: MessageHash) -> Option<ChunkToken> {
        self.entries.lock().unwrap().get(&hash.0).map(|e| e.chunk)
    }

    /// Explicit release without publish (e.g. `buffer_released` with
    /// `should_release = true`, `spec.md` §4.8).
    pub fn release(&self, hash: MessageHash) {
        if let Some(entry) = self.entries.lock().unwrap().remove(&hash.0) {
            entry.publisher.release(entry.chunk);
        }
    }

    /// Drop every entry owned by a publisher being torn down (`spec.md`
    /// §3 "Ownership & lifecycle invariants", §9 open question on
    /// reassembly across reconnection: preserved as silent drop).
    pub fn release_all(&self, publisher_uid: PublisherUid) {
        let mut entries = self.entries.lock().unwrap();
        let dead: Vec<u32> = entries
            .iter()
            .filter(|(_, e)| e.publisher.uid() == publisher_uid)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in dead {
            let entry = entries.remove(&hash).expect("key from this map");
            entry.publisher.release(entry.chunk);
        }
    }

    /// Called on every scheduler tick: release and remove every entry
    /// whose deadline has passed.
    pub fn check_timeouts(&self) {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let expired: Vec<u32> = entries.iter().filter(|(_, e)| now >= e.deadline).map(|(h, _)| *h).collect();
        for hash in expired {
            let entry = entries.remove(&hash).expect("key from this map");
            warn!("reassembler: message {hash:#010x} timed out before completion, releasing chunk");
            entry.publisher.release(entry.chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ipc::testing::TestPublisher;
    use crate::types::ServiceId;

    fn publisher() -> Arc<TestPublisher> {
        TestPublisher::new(ServiceId::new("s", "i", "e"), PublisherUid(42), 4)
    }

    #[test]
    fn completes_after_all_segments_arrive() {
        let reassembler = Reassembler::new();
        let publisher = publisher();
        let chunk = publisher.loan(10, 8, 0, 8).unwrap();
        let hash = MessageHash(1);
        reassembler.push(hash, 3, chunk, publisher.clone(), Instant::now() + Duration::from_secs(5));

        assert!(matches!(reassembler.find_and_decrement(hash), DecrementOutcome::Continuing));
        assert!(matches!(reassembler.find_and_decrement(hash), DecrementOutcome::Continuing));
        match reassembler.find_and_decrement(hash) {
            DecrementOutcome::Complete { chunk: c, .. } => assert_eq!(c, chunk),
            _ => panic!("expected completion on the third decrement"),
        }
        assert!(matches!(reassembler.find_and_decrement(hash), DecrementOutcome::NotFound));
    }

    #[test]
    fn release_all_drops_entries_for_owning_publisher() {
        let reassembler = Reassembler::new();
        let publisher = publisher();
        let chunk = publisher.loan(4, 4, 0, 4).unwrap();
        let hash = MessageHash(2);
        reassembler.push(hash, 2, chunk, publisher.clone(), Instant::now() + Duration::from_secs(5));

        reassembler.release_all(PublisherUid(42));
        assert!(matches!(reassembler.find_and_decrement(hash), DecrementOutcome::NotFound));
    }

    #[test]
    fn check_timeouts_releases_expired_entries() {
        let reassembler = Reassembler::new();
        let publisher = publisher();
        let chunk = publisher.loan(4, 4, 0, 4).unwrap();
        let hash = MessageHash(3);
        reassembler.push(hash, 2, chunk, publisher.clone(), Instant::now() - Duration::from_millis(1));

        reassembler.check_timeouts();
        assert!(matches!(reassembler.find_and_decrement(hash), DecrementOutcome::NotFound));
    }
}
