//! Fixed-layout little-endian (de)serialization of discovery records and
//! per-submessage datagram headers (`spec.md` §4.1, §6).
//!
//! Every primitive is written by explicit byte copy; every write is bounds
//! checked against the constants below before it happens. `deserialize` is
//! total: malformed input (truncation, an oversized subscriber count, an
//! oversized string) yields `Err(Malformed)`, never a panic.

use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert_eq;

use crate::error::GatewayError;
use crate::types::{
    GatewayHash, InfoHash, MessageHash, ServiceHash, ServiceId, TransportBitset, MAX_ID_LEN, MAX_TOPICS,
};

/// `3 * (MAX_ID_LEN)` for the three NUL-terminated strings of one `ServiceId`.
const SERVICE_ID_SER_SIZE: usize = 3 * MAX_ID_LEN;

/// Upper bound on the serialized size of one `DiscoveryRecord`: the
/// subscriber count, up to `MAX_TOPICS` serialized `ServiceId`s, the
/// gateway bitset, the two hashes, and the termination flag.
pub const MAX_DISCOVERY_RECORD_SERIALIZATION_SIZE: usize =
    8 + MAX_TOPICS * SERVICE_ID_SER_SIZE + 8 + 4 + 4 + 1;

/// Fixed wire size of a `DatagramHeader`: four `u32` words for the service
/// hash followed by six more `u32` fields, all 4 bytes wide.
pub const DATAGRAM_HEADER_SERIALIZATION_SIZE: usize = 4 * 4 + 4 * 6;
const_assert_eq!(DATAGRAM_HEADER_SERIALIZATION_SIZE, 40);

/// Content gossiped about this node's topics and reachability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub subscribers: Vec<ServiceId>,
    pub gateway_bitset: TransportBitset,
    pub gateway_hash: GatewayHash,
    pub info_hash: InfoHash,
    pub is_termination: bool,
}

impl DiscoveryRecord {
    pub fn serialize(&self, out: &mut Vec<u8>) -> Result<(), GatewayError> {
        if self.subscribers.len() > MAX_TOPICS {
            return Err(GatewayError::CapacityExceeded {
                container: "DiscoveryRecord.subscribers",
            });
        }
        out.reserve(MAX_DISCOVERY_RECORD_SERIALIZATION_SIZE.min(64));

        let mut buf8 = [0u8; 8];
        LittleEndian::write_u64(&mut buf8, self.subscribers.len() as u64);
        out.extend_from_slice(&buf8);

        for id in &self.subscribers {
            write_cstr(out, &id.service)?;
            write_cstr(out, &id.instance)?;
            write_cstr(out, &id.event)?;
        }

        LittleEndian::write_u64(&mut buf8, self.gateway_bitset.0);
        out.extend_from_slice(&buf8);

        let mut buf4 = [0u8; 4];
        LittleEndian::write_u32(&mut buf4, self.gateway_hash.0);
        out.extend_from_slice(&buf4);
        LittleEndian::write_u32(&mut buf4, self.info_hash.0);
        out.extend_from_slice(&buf4);

        out.push(u8::from(self.is_termination));

        if out.len() > MAX_DISCOVERY_RECORD_SERIALIZATION_SIZE {
            return Err(GatewayError::CapacityExceeded {
                container: "DiscoveryRecord serialized size",
            });
        }
        Ok(())
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, GatewayError> {
        let mut cursor = Cursor::new(bytes);
        let n_subscribers = cursor.read_u64()?;
        if n_subscribers > MAX_TOPICS as u64 {
            return Err(GatewayError::Malformed("subscriber count exceeds MAX_TOPICS"));
        }
        let mut subscribers = Vec::with_capacity(n_subscribers as usize);
        for _ in 0..n_subscribers {
            let service = cursor.read_cstr()?;
            let instance = cursor.read_cstr()?;
            let event = cursor.read_cstr()?;
            subscribers.push(ServiceId::new(service, instance, event));
        }
        let gateway_bitset = TransportBitset(cursor.read_u64()?);
        let gateway_hash = GatewayHash(cursor.read_u32()?);
        let info_hash = InfoHash(cursor.read_u32()?);
        let is_termination = cursor.read_u8()? != 0;

        Ok(DiscoveryRecord {
            subscribers,
            gateway_bitset,
            gateway_hash,
            info_hash,
            is_termination,
        })
    }
}

/// Wire header prepended to every submessage (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub service_hash: ServiceHash,
    pub message_hash: MessageHash,
    pub submessage_count: u32,
    pub submessage_offset: u32,
    pub submessage_size: u32,
    pub user_payload_size: u32,
    pub user_payload_alignment: u32,
    pub user_header_size: u32,
}

impl DatagramHeader {
    pub fn serialize(&self, out: &mut [u8; DATAGRAM_HEADER_SERIALIZATION_SIZE]) {
        let words = self.service_hash.to_wire();
        for (i, word) in words.iter().enumerate() {
            LittleEndian::write_u32(&mut out[i * 4..i * 4 + 4], *word);
        }
        let mut offset = 16;
        for field in [
            self.message_hash.0,
            self.submessage_count,
            self.submessage_offset,
            self.submessage_size,
            self.user_payload_size,
            self.user_payload_alignment,
            self.user_header_size,
        ] {
            LittleEndian::write_u32(&mut out[offset..offset + 4], field);
            offset += 4;
        }
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, GatewayError> {
        if bytes.len() < DATAGRAM_HEADER_SERIALIZATION_SIZE {
            return Err(GatewayError::Malformed("datagram header truncated"));
        }
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = LittleEndian::read_u32(&bytes[i * 4..i * 4 + 4]);
        }
        let service_hash = ServiceHash::from_wire(words);
        let mut cursor = Cursor::new(&bytes[16..]);
        Ok(DatagramHeader {
            service_hash,
            message_hash: MessageHash(cursor.read_u32()?),
            submessage_count: cursor.read_u32()?,
            submessage_offset: cursor.read_u32()?,
            submessage_size: cursor.read_u32()?,
            user_payload_size: cursor.read_u32()?,
            user_payload_alignment: cursor.read_u32()?,
            user_header_size: cursor.read_u32()?,
        })
    }
}

fn write_cstr(out: &mut Vec<u8>, s: &str) -> Result<(), GatewayError> {
    if s.len() + 1 > MAX_ID_LEN {
        return Err(GatewayError::CapacityExceeded {
            container: "ServiceId field (MAX_ID_LEN)",
        });
    }
    if s.as_bytes().contains(&0) {
        return Err(GatewayError::Malformed("service id field contains embedded NUL"));
    }
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    Ok(())
}

/// Minimal forward-only byte cursor used by both wire readers; every read
/// bounds-checks and returns `Malformed` on underrun instead of panicking.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], GatewayError> {
        let end = self.pos.checked_add(n).ok_or(GatewayError::Malformed("length overflow"))?;
        let slice = self.bytes.get(self.pos..end).ok_or(GatewayError::Malformed("truncated input"))?;
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, GatewayError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, GatewayError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn read_u64(&mut self) -> Result<u64, GatewayError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn read_cstr(&mut self) -> Result<String, GatewayError> {
        let start = self.pos;
        let nul = self.bytes[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(GatewayError::Malformed("unterminated string"))?;
        if nul + 1 > MAX_ID_LEN {
            return Err(GatewayError::Malformed("string field exceeds MAX_ID_LEN"));
        }
        let raw = self.take(nul + 1)?;
        let s = std::str::from_utf8(&raw[..nul]).map_err(|_| GatewayError::Malformed("string is not valid utf-8"))?;
        Ok(s.to_owned())
    }
}
