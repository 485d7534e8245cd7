//! In-memory interface pair.
//!
//! Connects two interface instances directly, frame for frame. Used by
//! integration tests and to exercise Bluetooth-shaped framings without
//! radio hardware. Each direction exposes a tap for dropping or mutating
//! frames in transit and an injector for delivering arbitrary raw frames.

use crate::interface::{Interface, InterfaceAddress, InterfaceConfig, NodeCore, OutFrame};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Frame filter applied to a loopback direction: return `None` to drop the
/// frame, or a (possibly modified) frame to deliver.
pub type TapFn = Box<dyn FnMut(Vec<u8>) -> Option<Vec<u8>> + Send>;

/// Control handle for one direction of a loopback pair.
#[derive(Clone)]
pub struct LoopbackLink {
    tap: Arc<Mutex<Option<TapFn>>>,
    inject_tx: mpsc::Sender<Vec<u8>>,
}

impl LoopbackLink {
    /// Install a frame tap for this direction.
    pub fn set_tap(&self, tap: impl FnMut(Vec<u8>) -> Option<Vec<u8>> + Send + 'static) {
        *self.tap.lock().expect("not poisoned") = Some(Box::new(tap));
    }

    /// Remove the frame tap.
    pub fn clear_tap(&self) {
        *self.tap.lock().expect("not poisoned") = None;
    }

    /// Deliver a raw frame to the receiving side, bypassing the sender.
    pub async fn inject(&self, frame: Vec<u8>) {
        let _ = self.inject_tx.send(frame).await;
    }
}

impl std::fmt::Debug for LoopbackLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LoopbackLink(..)")
    }
}

/// A connected pair of loopback interfaces.
#[derive(Debug)]
pub struct LoopbackPair {
    /// First endpoint.
    pub a: Arc<Interface>,
    /// Second endpoint.
    pub b: Arc<Interface>,
    /// Control over frames flowing from `a` to `b`.
    pub a_to_b: LoopbackLink,
    /// Control over frames flowing from `b` to `a`.
    pub b_to_a: LoopbackLink,
}

/// Simulated signal strength reported for delivered frames.
const LOOPBACK_RSSI: i16 = -40;

fn spawn_direction(
    source_rx: mpsc::Receiver<OutFrame>,
    dest: Arc<Interface>,
) -> LoopbackLink {
    let tap: Arc<Mutex<Option<TapFn>>> = Arc::new(Mutex::new(None));
    let (inject_tx, inject_rx) = mpsc::channel::<Vec<u8>>(8);

    let tap_handle = Arc::clone(&tap);
    tokio::spawn(async move {
        let mut source_rx = source_rx;
        let mut inject_rx = inject_rx;
        let mut inject_open = true;
        loop {
            let frame = tokio::select! {
                out = source_rx.recv() => match out {
                    Some(out) => {
                        let mut guard = tap_handle.lock().expect("not poisoned");
                        match guard.as_mut() {
                            Some(tap) => match tap(out.bytes) {
                                Some(frame) => frame,
                                None => continue,
                            },
                            None => out.bytes,
                        }
                    }
                    // The sending interface has shut down.
                    None => break,
                },
                injected = inject_rx.recv(), if inject_open => match injected {
                    Some(frame) => frame,
                    None => {
                        // Control handles dropped; keep forwarding.
                        inject_open = false;
                        continue;
                    }
                },
            };
            dest.handle_raw_rx(frame, LOOPBACK_RSSI, InterfaceAddress::Broadcast)
                .await;
        }
    });

    LoopbackLink { tap, inject_tx }
}

/// Create a connected pair of interfaces over in-memory channels.
#[must_use]
pub fn pair(
    config_a: InterfaceConfig,
    core_a: Arc<NodeCore>,
    config_b: InterfaceConfig,
    core_b: Arc<NodeCore>,
) -> LoopbackPair {
    let (a_out_tx, a_out_rx) = mpsc::channel(config_a.tx_pool.max(1));
    let (b_out_tx, b_out_rx) = mpsc::channel(config_b.tx_pool.max(1));
    let a = Interface::spawn(config_a, core_a, a_out_tx);
    let b = Interface::spawn(config_b, core_b, b_out_tx);

    let a_to_b = spawn_direction(a_out_rx, Arc::clone(&b));
    let b_to_a = spawn_direction(b_out_rx, Arc::clone(&a));

    LoopbackPair { a, b, a_to_b, b_to_a }
}
