//! `TransportKind::Interconnect` — a software stand-in for a DMA-capable
//! fabric (`spec.md` §4.10 SUPPLEMENT). No PCIe hardware is available in
//! this environment, and the original's PCIe driver lives in a
//! vendor-specific repository outside this pack; this driver exercises
//! the same asynchronous-release contract (`will_be_pending`,
//! `buffer_needed`/`buffer_released`/`buffer_sent`) end to end using an
//! in-process channel and a background "completion" thread, so the
//! Segmenter/Reassembler/Pending-tracker pending-path logic can be driven
//! and tested without real hardware.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;

use super::{
    BufferHandle, BufferNeededCallback, BufferReleasedCallback, BufferSentCallback, DiscoveryCallback, StatusCell,
    Transport, TransportStatus, UserDataCallback,
};
use crate::types::{DeviceIndex, TransportKind};

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 20;

/// Simulated completion latency for an async "DMA" send.
const COMPLETION_DELAY: Duration = Duration::from_micros(200);

struct PendingSend {
    handle: BufferHandle,
}

/// A pair of `InterconnectTransport`s loop back to each other in-process;
/// `link` wires two instances together so sends on one invoke the
/// callbacks registered on the other, modelling one point-to-point DMA
/// link between two peers.
pub struct InterconnectTransport {
    status: Arc<StatusCell>,
    max_message_size: usize,
    peer: Mutex<Option<Arc<InterconnectTransport>>>,
    device_of_peer: AtomicU32,
    discovery_cb: Arc<RwLock<Option<DiscoveryCallback>>>,
    user_data_cb: Arc<RwLock<Option<UserDataCallback>>>,
    buffer_needed_cb: Arc<RwLock<Option<BufferNeededCallback>>>,
    buffer_released_cb: Arc<RwLock<Option<BufferReleasedCallback>>>,
    buffer_sent_cb: Arc<RwLock<Option<BufferSentCallback>>>,
    completion_threads: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl InterconnectTransport {
    pub fn new(max_message_size: usize) -> Arc<Self> {
        Arc::new(Self {
            status: Arc::new(StatusCell::new()),
            max_message_size,
            peer: Mutex::new(None),
            device_of_peer: AtomicU32::new(0),
            discovery_cb: Arc::new(RwLock::new(None)),
            user_data_cb: Arc::new(RwLock::new(None)),
            buffer_needed_cb: Arc::new(RwLock::new(None)),
            buffer_released_cb: Arc::new(RwLock::new(None)),
            buffer_sent_cb: Arc::new(RwLock::new(None)),
            completion_threads: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Wire two instances together, each seeing the other as device `0`.
    pub fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock().unwrap() = Some(Arc::clone(b));
        *b.peer.lock().unwrap() = Some(Arc::clone(a));
        a.device_of_peer.store(0, Ordering::SeqCst);
        b.device_of_peer.store(0, Ordering::SeqCst);
    }

    fn deliver_user_data(&self, header: &[u8], payload: &[u8]) {
        let device_index = DeviceIndex::new(TransportKind::Interconnect, 0);
        // Receiver-side DMA priming: ask for a destination buffer before
        // "copying" the body in, mirroring real DMA semantics where the
        // destination address must be known before the transfer starts.
        let mut handle = None;
        if let Some(cb) = self.buffer_needed_cb.read().unwrap().as_ref() {
            handle = cb(header);
        }
        if let Some(cb) = self.user_data_cb.read().unwrap().as_ref() {
            let mut framed = Vec::with_capacity(header.len() + payload.len());
            framed.extend_from_slice(header);
            framed.extend_from_slice(payload);
            cb(&framed, device_index);
        }
        if handle.is_some() {
            if let Some(cb) = self.buffer_released_cb.read().unwrap().as_ref() {
                cb(header, true, device_index);
            }
        }
    }
}

impl Transport for InterconnectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Interconnect
    }

    fn status(&self) -> TransportStatus {
        self.status.get()
    }

    fn register_discovery_callback(&self, callback: DiscoveryCallback) {
        *self.discovery_cb.write().unwrap() = Some(callback);
    }

    fn register_user_data_callback(&self, callback: UserDataCallback) {
        *self.user_data_cb.write().unwrap() = Some(callback);
    }

    fn register_buffer_needed_callback(&self, callback: BufferNeededCallback) {
        *self.buffer_needed_cb.write().unwrap() = Some(callback);
    }

    fn register_buffer_released_callback(&self, callback: BufferReleasedCallback) {
        *self.buffer_released_cb.write().unwrap() = Some(callback);
    }

    fn register_buffer_sent_callback(&self, callback: BufferSentCallback) {
        *self.buffer_sent_cb.write().unwrap() = Some(callback);
    }

    fn send_broadcast(&self, bytes: &[u8]) {
        let Some(peer) = self.peer.lock().unwrap().clone() else {
            debug!("interconnect: send_broadcast with no linked peer, dropping");
            return;
        };
        let device_index = DeviceIndex::new(TransportKind::Interconnect, 0);
        if let Some(cb) = peer.discovery_cb.read().unwrap().as_ref() {
            cb(bytes, device_index);
        }
    }

    fn send_user_data(&self, header: &[u8], payload: &[u8], _device: u32, handle: BufferHandle) -> bool {
        let Some(peer) = self.peer.lock().unwrap().clone() else {
            debug!("interconnect: send_user_data with no linked peer, dropping");
            return false;
        };
        let header = header.to_vec();
        let payload = payload.to_vec();
        let sent_cb = Arc::clone(&self.buffer_sent_cb);
        let shutdown = Arc::clone(&self.shutdown);
        let pending = PendingSend { handle };

        let join = std::thread::spawn(move || {
            std::thread::sleep(COMPLETION_DELAY);
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            peer.deliver_user_data(&header, &payload);
            if let Some(cb) = sent_cb.read().unwrap().as_ref() {
                cb(pending.handle);
            }
        });
        self.completion_threads.lock().unwrap().push(join);
        true // always asynchronous
    }

    fn will_be_pending(&self, _payload_size: usize) -> bool {
        true
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Drop for InterconnectTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.completion_threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}
