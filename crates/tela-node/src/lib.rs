//! Tela device platform runtime.
//!
//! Builds the platform core on top of [`tela_wire`]:
//! - Key registry with per-interface rotated key derivation ([`keys`])
//! - ePacket interface framework: transmit pool, receive dispatch,
//!   sequence tracking ([`interface`]), with serial, UDP, and loopback
//!   backends ([`backends`])
//! - TDF-to-ePacket logger ([`tdf_logger`])
//! - RPC client and server ([`rpc`])
//! - Collaborator services consumed by the core: key-value store ([`kv`]),
//!   clocks ([`clock`]), publish/subscribe channels ([`pubsub`]) with an
//!   algorithm runner ([`algorithm`]), software watchdog ([`watchdog`]),
//!   encrypted blob storage ([`secure_storage`]), and reboot-state
//!   retention ([`reboot`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod algorithm;
pub mod backends;
pub mod clock;
/// Error types for node runtime operations.
pub mod error;
pub mod interface;
pub mod keys;
pub mod kv;
pub mod pubsub;
mod ratelimit;
pub mod reboot;
pub mod rpc;
pub mod secure_storage;
pub mod stats;
pub mod tdf_logger;
pub mod watchdog;

pub use error::NodeError;
pub use interface::{Interface, InterfaceAddress, InterfaceConfig, NodeCore, RxPacket, TxPacket};
pub use keys::KeyRegistry;
