//! Transport Registry (`spec.md` §4.2, C1): process-wide owner of the
//! enabled transport drivers, their health, and dispatch helpers.

use std::sync::{Arc, RwLock};

use log::{info, warn};

use super::Transport;
use crate::types::{TransportBitset, TransportKind};

pub type FailureCallback = Box<dyn Fn(TransportKind) + Send + Sync>;

/// Owns at most `TRANSPORT_TYPE_COUNT` transport instances indexed by
/// `TransportKind`. Encapsulated as an owned value passed down from
/// `main` (`spec.md` §9 "process-wide transport registry") rather than
/// true global state.
pub struct TransportRegistry {
    slots: RwLock<[Option<Arc<dyn Transport>>; 3]>,
    enabled: RwLock<TransportBitset>,
    on_failure: RwLock<Option<FailureCallback>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new([None, None, None]),
            enabled: RwLock::new(TransportBitset::EMPTY),
            on_failure: RwLock::new(None),
        }
    }

    pub fn set_failure_callback(&self, callback: FailureCallback) {
        *self.on_failure.write().unwrap() = Some(callback);
    }

    /// Install an already-constructed driver and mark its bit enabled.
    /// Idempotent: replacing an existing slot for the same kind is a
    /// no-op if one is already installed and `Good`.
    pub fn enable(&self, transport: Arc<dyn Transport>) {
        let kind = transport.kind();
        let index = kind.bit_index() as usize;
        let mut slots = self.slots.write().unwrap();
        if slots[index].is_some() {
            return; // idempotent
        }
        slots[index] = Some(transport);
        self.enabled.write().unwrap().set(kind);
        info!("transport {kind} enabled");
    }

    /// Drop all drivers. Deferred destruction: callers must ensure no
    /// other thread is still inside a driver method before calling this.
    pub fn terminate(&self) {
        let mut slots = self.slots.write().unwrap();
        for slot in slots.iter_mut() {
            *slot = None;
        }
        *self.enabled.write().unwrap() = TransportBitset::EMPTY;
    }

    pub fn bitset(&self) -> TransportBitset {
        *self.enabled.read().unwrap()
    }

    fn get(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        self.slots.read().unwrap()[kind.bit_index() as usize].clone()
    }

    /// Invoke `op` on every enabled transport whose status is `Good`,
    /// then poll each driver's status and quarantine any that failed
    /// during the call.
    pub fn for_each_enabled(&self, mut op: impl FnMut(&dyn Transport)) {
        let targets: Vec<Arc<dyn Transport>> = {
            let slots = self.slots.read().unwrap();
            slots.iter().flatten().filter(|t| t.status() == super::TransportStatus::Good).cloned().collect()
        };
        for transport in &targets {
            op(transport.as_ref());
            self.quarantine_if_failed(transport.as_ref());
        }
    }

    /// Invoke `op` on exactly one transport kind, if enabled and `Good`.
    pub fn for_one(&self, kind: TransportKind, mut op: impl FnMut(&dyn Transport)) {
        if let Some(transport) = self.get(kind) {
            if transport.status() == super::TransportStatus::Good {
                op(transport.as_ref());
                self.quarantine_if_failed(transport.as_ref());
            }
        }
    }

    /// Like `for_one`, but threads a return value back to the caller —
    /// used by the Segmenter, which needs each `send_user_data` result.
    pub fn with_transport<R>(&self, kind: TransportKind, op: impl FnOnce(&dyn Transport) -> R) -> Option<R> {
        let transport = self.get(kind)?;
        if transport.status() != super::TransportStatus::Good {
            return None;
        }
        let result = op(transport.as_ref());
        self.quarantine_if_failed(transport.as_ref());
        Some(result)
    }

    fn quarantine_if_failed(&self, transport: &dyn Transport) {
        if transport.status() != super::TransportStatus::Failed {
            return;
        }
        // The transport self-transitioned Good -> Failed during the call
        // above; only the Registry performs Failed -> Disabled.
        self.enabled.write().unwrap().clear(transport.kind());
        warn!("transport {} failed, quarantining", transport.kind());
        if let Some(callback) = self.on_failure.read().unwrap().as_ref() {
            callback(transport.kind());
        }
    }

    /// `preferred` if enabled on both ends; otherwise the first
    /// locally-enabled kind also present in `remote_bitset`; otherwise
    /// `None` (`spec.md` §4.2).
    pub fn find_matching(&self, remote_bitset: TransportBitset, preferred: Option<TransportKind>) -> Option<TransportKind> {
        let local = self.bitset();
        if let Some(pref) = preferred {
            if local.contains(pref) && remote_bitset.contains(pref) {
                return Some(pref);
            }
        }
        TransportKind::ALL.into_iter().find(|&kind| local.contains(kind) && remote_bitset.contains(kind))
    }
}
