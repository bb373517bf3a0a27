//! `p3com-gateway`: a cross-node publish/subscribe gateway that bridges a
//! local shared-memory IPC fabric over heterogeneous network transports
//! (Stream/TCP, Datagram/UDP, Interconnect/DMA-capable).
//!
//! The crate root mirrors the component table (`spec.md` §2): [`types`]
//! and [`codec`] hold the wire-level data model (C3), [`transport`] the
//! Registry (C1) and Transport contract (C2), [`discovery`] the Discovery
//! Manager (C4), [`segmenter`]/[`reassembler`]/[`pending`] the Segmenter
//! (C5), Reassembler (C6) and Pending-buffer Tracker (C7), and [`adapters`]
//! the Direction Adapters (C8). [`ipc`] is the external shared-memory
//! fabric boundary (consumed, not defined, by this crate); [`gateway`]
//! wires all of the above into one `Gateway` lifecycle.

pub mod adapters;
pub mod cli;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod ipc;
pub mod pending;
pub mod reassembler;
pub mod segmenter;
pub mod transport;
pub mod types;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
