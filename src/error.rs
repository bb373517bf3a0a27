//! Error taxonomy (`spec.md` §7). Most of these variants are logged and
//! handled inline at the point of failure rather than propagated — see
//! `SPEC_FULL.md` §7 for which call sites actually return `GatewayError`.

use thiserror::Error;

use crate::types::{MessageHash, ServiceId, TransportKind};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("malformed wire data: {0}")]
    Malformed(&'static str),

    #[error("allocation failed while loaning a chunk for {service}: {reason}")]
    AllocationFailed { service: ServiceId, reason: &'static str },

    #[error("capacity exceeded in {container}, dropping newest entry")]
    CapacityExceeded { container: &'static str },

    #[error("transport {kind} failed: {reason}")]
    TransportFailure { kind: TransportKind, reason: String },

    #[error("protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    #[error("reassembly of message {hash:?} timed out before completion")]
    ReassemblyTimeout { hash: MessageHash },

    #[error("fatal initialization failure: {0}")]
    InitFailure(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
