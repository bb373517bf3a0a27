//! TCP driver: `TransportKind::Stream` — reliable, ordered, bounded MTU
//! (`spec.md` §3, §4.10 SUPPLEMENT). A listener thread accepts peer
//! connections; one reader thread per connected peer. Frames are
//! length-prefixed (`u32` LE byte count followed by the bytes); an I/O
//! error on any connection or the listener marks the whole transport
//! `Failed`, since a reliable transport's whole point is that silent
//! partial failure is not an option.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use super::{
    BufferHandle, DiscoveryCallback, StatusCell, Transport, TransportStatus, UserDataCallback,
};
use crate::types::{DeviceIndex, TransportKind};

const DISCOVERY_MARKER: u8 = 0;
const USER_DATA_MARKER: u8 = 1;
const LENGTH_PREFIX_SIZE: usize = 4;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 16;

struct Connection {
    device: u32,
    stream: Mutex<TcpStream>,
}

pub struct TcpTransport {
    status: Arc<StatusCell>,
    max_message_size: usize,
    bound_addr: SocketAddr,
    connections: Arc<RwLock<Vec<Arc<Connection>>>>,
    next_device: AtomicU32,
    discovery_cb: Arc<RwLock<Option<DiscoveryCallback>>>,
    user_data_cb: Arc<RwLock<Option<UserDataCallback>>>,
    listener_thread: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl TcpTransport {
    pub fn bind(bind_addr: SocketAddr, max_message_size: usize) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind(bind_addr)?;
        let bound_addr = listener.local_addr()?;
        let transport = Arc::new(Self {
            status: Arc::new(StatusCell::new()),
            max_message_size,
            bound_addr,
            connections: Arc::new(RwLock::new(Vec::new())),
            next_device: AtomicU32::new(0),
            discovery_cb: Arc::new(RwLock::new(None)),
            user_data_cb: Arc::new(RwLock::new(None)),
            listener_thread: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        transport.spawn_listener(listener);
        Ok(transport)
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// Actively connect to a known peer, registering it as a new device.
    pub fn connect(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<u32> {
        let stream = TcpStream::connect(addr)?;
        Ok(self.adopt_stream(stream))
    }

    fn spawn_listener(self: &Arc<Self>, listener: TcpListener) {
        let this = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let handle = std::thread::spawn(move || loop {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            match listener.accept() {
                Ok((stream, _addr)) => {
                    this.adopt_stream(stream);
                }
                Err(e) => {
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    warn!("tcp: accept failed: {e}");
                    this.status.set_failed();
                    return;
                }
            }
        });
        *self.listener_thread.lock().unwrap() = Some(handle);
    }

    fn adopt_stream(self: &Arc<Self>, stream: TcpStream) -> u32 {
        let device = self.next_device.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(Connection { device, stream: Mutex::new(stream.try_clone().expect("clone tcp stream")) });
        self.connections.write().unwrap().push(Arc::clone(&connection));
        self.spawn_reader(stream, device);
        device
    }

    fn spawn_reader(self: &Arc<Self>, mut stream: TcpStream, device: u32) {
        let status = Arc::clone(&self.status);
        let discovery_cb = Arc::clone(&self.discovery_cb);
        let user_data_cb = Arc::clone(&self.user_data_cb);
        let connections = Arc::clone(&self.connections);
        let shutdown = Arc::clone(&self.shutdown);
        let max_message_size = self.max_message_size;

        std::thread::spawn(move || {
            let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
            loop {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Err(e) = stream.read_exact(&mut len_buf) {
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    debug!("tcp: peer on device {device} disconnected: {e}");
                    connections.write().unwrap().retain(|c| c.device != device);
                    status.set_failed();
                    return;
                }
                let len = LittleEndian::read_u32(&len_buf) as usize;
                if len == 0 || len > max_message_size + 1 + LENGTH_PREFIX_SIZE {
                    warn!("tcp: frame length {len} out of bounds, failing connection");
                    status.set_failed();
                    return;
                }
                let mut body = vec![0u8; len];
                if let Err(e) = stream.read_exact(&mut body) {
                    debug!("tcp: peer on device {device} disconnected mid-frame: {e}");
                    connections.write().unwrap().retain(|c| c.device != device);
                    status.set_failed();
                    return;
                }
                let device_index = DeviceIndex::new(TransportKind::Stream, device);
                match body[0] {
                    DISCOVERY_MARKER => {
                        if let Some(cb) = discovery_cb.read().unwrap().as_ref() {
                            cb(&body[1..], device_index);
                        }
                    }
                    USER_DATA_MARKER => {
                        if let Some(cb) = user_data_cb.read().unwrap().as_ref() {
                            cb(&body[1..], device_index);
                        }
                    }
                    other => warn!("tcp: unknown message marker {other}"),
                }
            }
        });
    }

    fn write_framed(&self, connection: &Connection, marker: u8, header: &[u8], payload: &[u8]) -> std::io::Result<()> {
        let total_len = 1 + header.len() + payload.len();
        let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + total_len);
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        LittleEndian::write_u32(&mut len_buf, total_len as u32);
        out.extend_from_slice(&len_buf);
        out.push(marker);
        out.extend_from_slice(header);
        out.extend_from_slice(payload);
        connection.stream.lock().unwrap().write_all(&out)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.listener_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
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
        let targets: Vec<Arc<Connection>> = self.connections.read().unwrap().clone();
        for connection in targets {
            if let Err(e) = self.write_framed(&connection, DISCOVERY_MARKER, bytes, &[]) {
                warn!("tcp: send_broadcast to device {} failed: {e}", connection.device);
                self.status.set_failed();
            }
        }
    }

    fn send_user_data(&self, header: &[u8], payload: &[u8], device: u32, _handle: BufferHandle) -> bool {
        let connection = self.connections.read().unwrap().iter().find(|c| c.device == device).cloned();
        match connection {
            Some(connection) => {
                if let Err(e) = self.write_framed(&connection, USER_DATA_MARKER, header, payload) {
                    warn!("tcp: send_user_data to device {device} failed, closing session: {e}");
                    self.status.set_failed();
                }
            }
            None => warn!("tcp: send_user_data to unknown device {device}"),
        }
        false // TCP sends are synchronous from the gateway's point of view
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Drop for TcpTransport {
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
    fn user_data_roundtrip_over_accepted_connection() {
        let server = TcpTransport::bind(loopback(0), DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let client = TcpTransport::bind(loopback(0), DEFAULT_MAX_MESSAGE_SIZE).unwrap();

        let (tx, rx) = mpsc::channel();
        server.register_user_data_callback(Box::new(move |bytes, device| {
            let _ = tx.send((bytes.to_vec(), device));
        }));

        let client_device = client.connect(server.bound_addr()).expect("client connect");
        // Give the server's listener thread a moment to accept and spawn
        // its reader before we send.
        std::thread::sleep(Duration::from_millis(50));

        client.send_user_data(b"hdr", b"payload", client_device, BufferHandle(0));

        let (bytes, device) = rx.recv_timeout(Duration::from_secs(2)).expect("frame never arrived");
        assert_eq!(bytes, b"hdrpayload");
        assert_eq!(device.kind, TransportKind::Stream);
    }

    #[test]
    fn send_to_unknown_device_is_a_warning_not_a_panic() {
        let transport = TcpTransport::bind(loopback(0), DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        transport.send_user_data(b"h", b"p", 999, BufferHandle(0));
    }
}
