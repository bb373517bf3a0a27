//! UDP driver: `TransportKind::Datagram` — lossy, unordered, bounded MTU
//! (`spec.md` §3, §4.10 SUPPLEMENT). One dedicated reader thread blocks on
//! `recv_from`, dispatching each datagram to the registered discovery or
//! user-data callback based on a one-byte kind discriminant prefix.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};

use super::{
    BufferHandle, DiscoveryCallback, StatusCell, Transport, TransportStatus, UserDataCallback,
};
use crate::types::{DeviceIndex, TransportKind};

const DISCOVERY_MARKER: u8 = 0;
const USER_DATA_MARKER: u8 = 1;

/// Default ceiling kept comfortably under the common Ethernet MTU so that
/// a single UDP datagram never needs IP-level fragmentation.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1400;

struct PeerTable {
    by_device: Vec<(u32, SocketAddr)>,
    next_device: u32,
}

impl PeerTable {
    fn new() -> Self {
        Self { by_device: Vec::new(), next_device: 0 }
    }

    fn device_for(&mut self, addr: SocketAddr) -> u32 {
        if let Some((device, _)) = self.by_device.iter().find(|(_, a)| *a == addr) {
            return *device;
        }
        let device = self.next_device;
        self.next_device += 1;
        self.by_device.push((device, addr));
        device
    }

    fn addr_for(&self, device: u32) -> Option<SocketAddr> {
        self.by_device.iter().find(|(d, _)| *d == device).map(|(_, a)| a).copied()
    }
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    status: Arc<StatusCell>,
    max_message_size: usize,
    /// Well-known broadcast/multicast address discovery datagrams are
    /// sent to. Every peer, including ones we have never heard from
    /// before, listens on it.
    broadcast_addr: SocketAddr,
    peers: Arc<Mutex<PeerTable>>,
    discovery_cb: Arc<RwLock<Option<DiscoveryCallback>>>,
    user_data_cb: Arc<RwLock<Option<UserDataCallback>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl UdpTransport {
    /// Binds `bind_addr` (use `0.0.0.0:0` for an ephemeral port) and
    /// spawns the reader thread immediately. `broadcast_addr` is the
    /// well-known address discovery datagrams are sent to.
    pub fn bind(
        bind_addr: SocketAddr,
        broadcast_addr: SocketAddr,
        max_message_size: usize,
    ) -> std::io::Result<Arc<Self>> {
        let domain = if bind_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let raw = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_reuse_address(true)?;
        raw.set_broadcast(true)?;
        raw.bind(&bind_addr.into())?;
        let socket: UdpSocket = raw.into();
        socket.set_nonblocking(false)?;

        let transport = Arc::new(Self {
            socket: Arc::new(socket),
            status: Arc::new(StatusCell::new()),
            max_message_size,
            broadcast_addr,
            peers: Arc::new(Mutex::new(PeerTable::new())),
            discovery_cb: Arc::new(RwLock::new(None)),
            user_data_cb: Arc::new(RwLock::new(None)),
            reader: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        transport.spawn_reader();
        Ok(transport)
    }

    fn spawn_reader(self: &Arc<Self>) {
        let socket = Arc::clone(&self.socket);
        let peers = Arc::clone(&self.peers);
        let status = Arc::clone(&self.status);
        let discovery_cb = Arc::clone(&self.discovery_cb);
        let user_data_cb = Arc::clone(&self.user_data_cb);
        let shutdown = Arc::clone(&self.shutdown);

        let handle = std::thread::spawn(move || {
            let mut buf = vec![0u8; DEFAULT_MAX_MESSAGE_SIZE + 64];
            loop {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
                match socket.recv_from(&mut buf) {
                    Ok((n, from)) if n >= 1 => {
                        let device = peers.lock().unwrap().device_for(from);
                        let device_index = DeviceIndex::new(TransportKind::Datagram, device);
                        let (marker, body) = (buf[0], &buf[1..n]);
                        match marker {
                            DISCOVERY_MARKER => {
                                if let Some(cb) = discovery_cb.read().unwrap().as_ref() {
                                    cb(body, device_index);
                                }
                            }
                            USER_DATA_MARKER => {
                                if let Some(cb) = user_data_cb.read().unwrap().as_ref() {
                                    cb(body, device_index);
                                }
                            }
                            other => warn!("udp: unknown message marker {other}"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if shutdown.load(Ordering::Acquire) {
                            return;
                        }
                        warn!("udp: recv_from failed: {e}");
                        status.set_failed();
                        return;
                    }
                }
            }
        });
        *self.reader.lock().unwrap() = Some(handle);
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Register (or refresh) a known peer address so broadcasts and
    /// unicast sends can reach it; returns the device number it is
    /// assigned.
    pub fn add_peer(&self, addr: SocketAddr) -> u32 {
        self.peers.lock().unwrap().device_for(addr)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Nudge the blocking recv_from to wake by sending ourselves a
        // zero-length datagram; best-effort, ignore failures.
        if let Ok(addr) = self.socket.local_addr() {
            let _ = self.socket.send_to(&[0u8], addr);
        }
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
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

    fn send_broadcast(&self, bytes: &[u8]) {
        let mut framed = Vec::with_capacity(bytes.len() + 1);
        framed.push(DISCOVERY_MARKER);
        framed.extend_from_slice(bytes);
        if let Err(e) = self.socket.send_to(&framed, self.broadcast_addr) {
            debug!("udp: send_broadcast failed (lossy, ignoring): {e}");
        }
    }

    fn send_user_data(&self, header: &[u8], payload: &[u8], device: u32, _handle: BufferHandle) -> bool {
        let Some(addr) = self.peers.lock().unwrap().addr_for(device) else {
            warn!("udp: send_user_data to unknown device {device}");
            return false;
        };
        let mut framed = Vec::with_capacity(1 + header.len() + payload.len());
        framed.push(USER_DATA_MARKER);
        framed.extend_from_slice(header);
        framed.extend_from_slice(payload);
        if let Err(e) = self.socket.send_to(&framed, addr) {
            debug!("udp: send_user_data failed (lossy, ignoring): {e}");
        }
        false // synchronous, never pending
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    fn loopback(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn discovery_datagram_reaches_peer() {
        let a = UdpTransport::bind(loopback(0), loopback(0), DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let b = UdpTransport::bind(loopback(0), a.local_addr().unwrap(), DEFAULT_MAX_MESSAGE_SIZE).unwrap();

        let (tx, rx) = mpsc::channel();
        a.register_discovery_callback(Box::new(move |bytes, device| {
            let _ = tx.send((bytes.to_vec(), device));
        }));

        b.send_broadcast(b"hello-discovery");

        let (bytes, device) = rx.recv_timeout(Duration::from_secs(2)).expect("discovery datagram never arrived");
        assert_eq!(bytes, b"hello-discovery");
        assert_eq!(device.kind, TransportKind::Datagram);
    }

    #[test]
    fn user_data_requires_known_device() {
        let a = UdpTransport::bind(loopback(0), loopback(0), DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let pending = a.send_user_data(b"hdr", b"payload", 42, BufferHandle(0));
        assert!(!pending);
    }
}
