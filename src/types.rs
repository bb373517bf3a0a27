//! Core data model shared across the gateway: service identity, transport
//! kinds, and the per-peer device addressing scheme (`spec.md` §3).

use std::fmt;
use std::time::Duration;

use rand::Rng;

/// Maximum length, including the NUL terminator, of one `ServiceId` field
/// as it appears on the wire.
pub const MAX_ID_LEN: usize = 128;

/// Upper bound on the number of topics tracked locally or gossiped in one
/// `DiscoveryRecord`.
pub const MAX_TOPICS: usize = 32;

/// Number of distinct `TransportKind` values, including the `None` sentinel.
pub const TRANSPORT_TYPE_COUNT: usize = 4;

/// Upper bound on the number of remote peers tracked at once.
pub const MAX_DEVICE_COUNT: usize = 10;

/// Upper bound on the number of services configured for inter-transport
/// forwarding.
pub const MAX_FORWARDED_SERVICES: usize = 8;

/// Upper bound on the number of local network interfaces a transport may
/// bind across.
pub const MAX_NETWORK_IFACE_COUNT: usize = 10;

/// Capacity of the Reassembler's in-flight message map.
pub const MAX_SEGMENTED_MESSAGES: usize = 64;

/// Capacity of the Pending-buffer tracker's in-flight send map.
pub const MAX_PENDING_MESSAGES: usize = 512;

/// Period of the Discovery Manager's unconditional reactor tick.
pub const DISCOVERY_PERIOD: Duration = Duration::from_millis(200);

/// Period of the periodic rebroadcast compensating for datagram loss on
/// lossy transports.
pub const LOSSY_DISCOVERY_PERIOD: Duration = Duration::from_millis(500);

/// Timeout applied to a broadcast send attempt.
pub const BROADCAST_SEND_TIMEOUT: Duration = Duration::from_millis(50);

/// Alignment assumed for a chunk's user header when none is specified.
pub const USER_HEADER_ALIGNMENT: u32 = 8;

/// Wait-set poll timeout used by every reactor thread (Discovery, L→R,
/// Forwarder).
pub const REACTOR_TICK: Duration = Duration::from_millis(50);

/// Conservative per-byte budget used to compute a reassembly deadline:
/// `deadline = now + PER_BYTE_REAASSEMBLY_BUDGET * (header_size + payload_size)`.
pub const PER_BYTE_REASSEMBLY_BUDGET: Duration = Duration::from_nanos(500);

/// A topic name: the triple `(service, instance, event)`, matching the
/// iceoryx `ServiceDescription` this gateway bridges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId {
    pub service: String,
    pub instance: String,
    pub event: String,
}

impl ServiceId {
    pub fn new(service: impl Into<String>, instance: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            instance: instance.into(),
            event: event.into(),
        }
    }

    /// The 128-bit hash used as the primary key on hot paths.
    pub fn hash(&self) -> ServiceHash {
        ServiceHash::of(self)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.instance, self.event)
    }
}

/// A 128-bit digest of a `ServiceId`, used as the primary key on hot paths.
///
/// Derived with two independent 64-bit FNV-1a passes over the three fields
/// (service, then instance, then event), one seeded differently from the
/// other, to fill all 128 bits without pulling in a hashing crate for a
/// value that is never exposed outside this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceHash(pub u64, pub u64);

impl ServiceHash {
    pub fn of(id: &ServiceId) -> Self {
        const FNV_OFFSET_A: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_OFFSET_B: u64 = 0x100_0000_01b3;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut a = FNV_OFFSET_A;
        let mut b = FNV_OFFSET_B;
        for part in [&id.service, &id.instance, &id.event] {
            for byte in part.as_bytes() {
                a ^= u64::from(*byte);
                a = a.wrapping_mul(FNV_PRIME);
                b = b.wrapping_mul(FNV_PRIME);
                b ^= u64::from(*byte);
            }
            // Field separator so ("ab","c") and ("a","bc") hash differently.
            a ^= 0xFF;
            a = a.wrapping_mul(FNV_PRIME);
        }
        ServiceHash(a, b)
    }

    pub fn to_wire(self) -> [u32; 4] {
        [
            (self.0 & 0xFFFF_FFFF) as u32,
            (self.0 >> 32) as u32,
            (self.1 & 0xFFFF_FFFF) as u32,
            (self.1 >> 32) as u32,
        ]
    }

    pub fn from_wire(words: [u32; 4]) -> Self {
        let a = u64::from(words[0]) | (u64::from(words[1]) << 32);
        let b = u64::from(words[2]) | (u64::from(words[3]) << 32);
        ServiceHash(a, b)
    }
}

/// The set of transports a gateway knows how to drive. `None` is a sentinel
/// used only for "no transport selected" results; it never appears as an
/// enabled bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportKind {
    Stream = 0,
    Datagram = 1,
    Interconnect = 2,
    None = 3,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [TransportKind::Stream, TransportKind::Datagram, TransportKind::Interconnect];

    pub fn bit_index(self) -> u32 {
        self as u32
    }

    pub fn from_bit_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(TransportKind::Stream),
            1 => Some(TransportKind::Datagram),
            2 => Some(TransportKind::Interconnect),
            _ => None,
        }
    }

    /// Lossy transports re-broadcast discovery periodically to compensate
    /// for dropped datagrams (`spec.md` §4.4). Stream (new connections are
    /// established on demand, so a freshly-joined peer may not have seen
    /// our last broadcast) and Datagram (no delivery guarantee at all) are
    /// both lossy in this sense; Interconnect is a direct DMA link.
    pub fn is_lossy(self) -> bool {
        matches!(self, TransportKind::Stream | TransportKind::Datagram)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Stream => "stream",
            TransportKind::Datagram => "datagram",
            TransportKind::Interconnect => "interconnect",
            TransportKind::None => "none",
        };
        f.write_str(name)
    }
}

/// Fixed 64-bit bitset over `TransportKind` indices. Forced to 64 bits (even
/// though only `TRANSPORT_TYPE_COUNT` bits are meaningful) to keep the wire
/// representation stable across platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportBitset(pub u64);

impl TransportBitset {
    pub const EMPTY: TransportBitset = TransportBitset(0);

    pub fn set(&mut self, kind: TransportKind) {
        self.0 |= 1 << kind.bit_index();
    }

    pub fn clear(&mut self, kind: TransportKind) {
        self.0 &= !(1 << kind.bit_index());
    }

    pub fn contains(&self, kind: TransportKind) -> bool {
        self.0 & (1 << kind.bit_index()) != 0
    }

    pub fn intersects(&self, other: TransportBitset) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = TransportKind> + '_ {
        TransportKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

/// Identifies a peer's endpoint within one transport's address space. The
/// device number is assigned by the transport locally; it has no meaning
/// across transports or processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIndex {
    pub kind: TransportKind,
    pub device: u32,
}

impl DeviceIndex {
    pub fn new(kind: TransportKind, device: u32) -> Self {
        Self { kind, device }
    }
}

/// A 32-bit random identifier minted once at process start, uniquely
/// naming this gateway across its lifetime to its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GatewayHash(pub u32);

impl GatewayHash {
    pub fn generate() -> Self {
        GatewayHash(rand::rng().random())
    }
}

/// A 32-bit random value regenerated on every discovery send, letting a
/// recipient detect "nothing changed since last time" cheaply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub u32);

impl InfoHash {
    pub fn generate() -> Self {
        InfoHash(rand::rng().random())
    }
}

/// A 32-bit random value identifying one user message across its
/// submessages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHash(pub u32);

impl MessageHash {
    pub fn generate() -> Self {
        MessageHash(rand::rng().random())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_hash_is_stable_and_order_sensitive() {
        let a = ServiceId::new("svc", "inst", "evt");
        let b = ServiceId::new("svc", "inst", "evt");
        let c = ServiceId::new("svcinst", "", "evt");
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn service_hash_wire_roundtrip() {
        let h = ServiceId::new("a", "b", "c").hash();
        assert_eq!(ServiceHash::from_wire(h.to_wire()), h);
    }

    #[test]
    fn bitset_basic_ops() {
        let mut bs = TransportBitset::EMPTY;
        assert!(bs.is_empty());
        bs.set(TransportKind::Datagram);
        bs.set(TransportKind::Stream);
        assert!(bs.contains(TransportKind::Datagram));
        assert!(!bs.contains(TransportKind::Interconnect));
        assert_eq!(bs.iter().count(), 2);
        bs.clear(TransportKind::Stream);
        assert!(!bs.contains(TransportKind::Stream));
    }

    #[test]
    fn bitset_intersects() {
        let mut a = TransportBitset::EMPTY;
        a.set(TransportKind::Datagram);
        let mut b = TransportBitset::EMPTY;
        b.set(TransportKind::Stream);
        assert!(!a.intersects(b));
        b.set(TransportKind::Datagram);
        assert!(a.intersects(b));
    }
}
