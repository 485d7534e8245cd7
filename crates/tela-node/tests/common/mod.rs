//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use tela_node::backends::loopback::{self, LoopbackPair};
use tela_node::clock::TestClock;
use tela_node::interface::{InterfaceConfig, NodeCore};
use tela_node::keys::KeyRegistry;
use tela_wire::epoch;

pub const NETWORK_ROOT: [u8; 32] = [0xA0; 32];
pub const NETWORK_ID: u32 = 0x00BEEF;
pub const DEVICE_A: u64 = 0x1111_0000_0000_0001;
pub const DEVICE_B: u64 = 0x2222_0000_0000_0002;

/// A fixed test instant: ten thousand days after the GPS epoch.
pub const TEST_EPOCH_SECS: u32 = 10_000 * 86_400;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Node core with its own device root but the shared network root.
pub fn core(device_id: u64, device_root_byte: u8) -> Arc<NodeCore> {
    let clock = Arc::new(TestClock::new(epoch::from_parts(TEST_EPOCH_SECS, 0)));
    let keys = Arc::new(KeyRegistry::new(
        [device_root_byte; 32],
        (device_id & 0x00FF_FFFF) as u32,
        NETWORK_ROOT,
        NETWORK_ID,
    ));
    Arc::new(NodeCore {
        device_id,
        clock,
        keys,
    })
}

/// Two UDP-shaped interfaces joined by an in-memory link.
pub fn linked_pair() -> LoopbackPair {
    loopback::pair(
        InterfaceConfig::udp(),
        core(DEVICE_A, 0x0A),
        InterfaceConfig::udp(),
        core(DEVICE_B, 0x0B),
    )
}
