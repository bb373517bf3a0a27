//! Transport abstraction (`spec.md` §4.3, C2): a uniform contract over
//! transports with heterogeneous delivery properties. DMA-only callbacks
//! are optional registration slots defaulting to no-ops, replacing the
//! original's virtual-inheritance hierarchy with capability composition
//! (`spec.md` §9, DESIGN.md).

pub mod interconnect;
pub mod registry;
pub mod tcp;
pub mod udp;

use std::sync::atomic::{AtomicU8, Ordering};

use crate::types::{DeviceIndex, TransportKind};

/// An opaque token identifying one in-flight asynchronous send or
/// receive-side loan. Transports never interpret it; they only echo it
/// back through the matching callback (`spec.md` §9 "raw pointers keyed
/// in maps").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

pub type DiscoveryCallback = Box<dyn Fn(&[u8], DeviceIndex) + Send + Sync>;
pub type UserDataCallback = Box<dyn Fn(&[u8], DeviceIndex) + Send + Sync>;
/// Requests an ingress buffer before body bytes arrive; returns `None` if
/// a buffer of this size cannot be loaned.
pub type BufferNeededCallback = Box<dyn Fn(&[u8]) -> Option<BufferHandle> + Send + Sync>;
/// Fires once a previously-loaned buffer has been filled (or the transfer
/// was aborted).
pub type BufferReleasedCallback = Box<dyn Fn(&[u8], bool, DeviceIndex) + Send + Sync>;
/// Fires once an egress send that returned `pending = true` has actually
/// completed and its buffer handle may be released.
pub type BufferSentCallback = Box<dyn Fn(BufferHandle) + Send + Sync>;

/// `Good -> Failed -> Disabled`, one-way (`spec.md` §4.9). Only the owning
/// transport transitions `Good -> Failed`; only the Registry transitions
/// `Failed -> Disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportStatus {
    Good = 0,
    Failed = 1,
    Disabled = 2,
}

/// Atomic holder for `TransportStatus`, shared between the driver (which
/// may set `Failed` from any of its worker threads) and the Registry
/// (which alone transitions `Failed -> Disabled`).
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    pub fn new() -> Self {
        StatusCell(AtomicU8::new(TransportStatus::Good as u8))
    }

    pub fn get(&self) -> TransportStatus {
        match self.0.load(Ordering::Acquire) {
            0 => TransportStatus::Good,
            1 => TransportStatus::Failed,
            _ => TransportStatus::Disabled,
        }
    }

    pub fn is_good(&self) -> bool {
        self.get() == TransportStatus::Good
    }

    /// Called by the driver on an unrecoverable error. No-op if already
    /// `Failed` or `Disabled`.
    pub fn set_failed(&self) {
        let _ = self.0.compare_exchange(
            TransportStatus::Good as u8,
            TransportStatus::Failed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Called only by the Registry. Returns `true` if this call performed
    /// the `Failed -> Disabled` transition.
    pub fn has_failed_set_disabled(&self) -> bool {
        self.0
            .compare_exchange(
                TransportStatus::Failed as u8,
                TransportStatus::Disabled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Per-transport driver contract (`spec.md` §4.3).
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;
    fn status(&self) -> TransportStatus;

    fn register_discovery_callback(&self, callback: DiscoveryCallback);
    fn register_user_data_callback(&self, callback: UserDataCallback);

    /// Optional; only DMA-capable transports need this. Default: ignored.
    fn register_buffer_needed_callback(&self, _callback: BufferNeededCallback) {}
    /// Optional; only DMA-capable transports need this. Default: ignored.
    fn register_buffer_released_callback(&self, _callback: BufferReleasedCallback) {}
    /// Optional; only DMA-capable transports need this. Default: ignored.
    fn register_buffer_sent_callback(&self, _callback: BufferSentCallback) {}

    /// Deliver to every peer reachable on this transport. Send-and-forget.
    fn send_broadcast(&self, bytes: &[u8]);

    /// Deliver to one peer. `handle` is only meaningful if this call
    /// returns `true` (pending): the caller must retain the payload until
    /// the registered `BufferSentCallback` fires with the same handle.
    fn send_user_data(&self, header: &[u8], payload: &[u8], device: u32, handle: BufferHandle) -> bool;

    /// A-priori classification of whether a send of this payload size
    /// will be pending. Default: never pending (synchronous transports).
    fn will_be_pending(&self, _payload_size: usize) -> bool {
        false
    }

    fn max_message_size(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_cell_one_way_transitions() {
        let cell = StatusCell::new();
        assert!(cell.is_good());
        assert!(!cell.has_failed_set_disabled()); // not Failed yet, no-op
        assert!(cell.is_good());

        cell.set_failed();
        assert_eq!(cell.get(), TransportStatus::Failed);
        cell.set_failed(); // idempotent
        assert_eq!(cell.get(), TransportStatus::Failed);

        assert!(cell.has_failed_set_disabled());
        assert_eq!(cell.get(), TransportStatus::Disabled);

        // No return from Disabled.
        cell.set_failed();
        assert_eq!(cell.get(), TransportStatus::Disabled);
        assert!(!cell.has_failed_set_disabled());
    }
}
