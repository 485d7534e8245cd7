//! Link backends feeding the interface runtime.

pub mod loopback;
pub mod serial;
pub mod udp;
