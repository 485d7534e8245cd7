//! Per-interface packet counters.
//!
//! Authentication failures never propagate past the receive path, so the
//! counters here are the only externally visible trace of dropped traffic.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic packet counters for one interface.
#[derive(Debug, Default)]
pub struct InterfaceStats {
    tx_sent: AtomicU64,
    tx_failed: AtomicU64,
    rx_received: AtomicU64,
    rx_auth_failures: AtomicU64,
    rx_sequence_drops: AtomicU64,
    rx_invalid: AtomicU64,
}

/// Point-in-time copy of an interface's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames handed to the backend successfully.
    pub tx_sent: u64,
    /// Transmissions that failed before leaving the device.
    pub tx_failed: u64,
    /// Frames received, decrypted, and dispatched.
    pub rx_received: u64,
    /// Frames dropped because the AEAD tag did not verify or no key was
    /// available.
    pub rx_auth_failures: u64,
    /// Frames dropped for a stale or duplicate sequence number.
    pub rx_sequence_drops: u64,
    /// Frames dropped because the header could not be parsed.
    pub rx_invalid: u64,
}

impl InterfaceStats {
    pub(crate) fn tx_sent(&self) {
        self.tx_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tx_failed(&self) {
        self.tx_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rx_received(&self) {
        self.rx_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rx_auth_failure(&self) {
        self.rx_auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rx_sequence_drop(&self) {
        self.rx_sequence_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rx_invalid(&self) {
        self.rx_invalid.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_sent: self.tx_sent.load(Ordering::Relaxed),
            tx_failed: self.tx_failed.load(Ordering::Relaxed),
            rx_received: self.rx_received.load(Ordering::Relaxed),
            rx_auth_failures: self.rx_auth_failures.load(Ordering::Relaxed),
            rx_sequence_drops: self.rx_sequence_drops.load(Ordering::Relaxed),
            rx_invalid: self.rx_invalid.load(Ordering::Relaxed),
        }
    }
}
