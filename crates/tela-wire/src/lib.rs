//! Wire formats for the Tela device platform.
//!
//! This crate holds everything that must stay byte-stable with peers and
//! nothing that does I/O:
//! - TDF telemetry codec ([`tdf`])
//! - ePacket frame layouts and AEAD protection ([`frame`])
//! - RPC envelopes ([`rpc`])
//! - Cryptographic primitives ([`crypto`])
//! - GPS-epoch time conversions ([`epoch`])
//! - Protocol constants and identities ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod epoch;
pub mod frame;
pub mod rpc;
pub mod tdf;
pub mod types;

pub use epoch::EpochTime;
pub use types::{Auth, DeviceId, InterfaceId, KeyClass, NetworkId};
