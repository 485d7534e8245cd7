//! Reboot reason capture.
//!
//! Fatal conditions record their diagnostics into retained memory before
//! the device restarts: the reason, the faulting task name, uptime, and
//! two reason-specific parameters (program counter and link register for
//! faults). The reboot counter persists in the key-value store. On the
//! next boot the retained state is queried once and typically logged as
//! telemetry.

use crate::kv::KvStore;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::error;

/// Key-value store key holding the 32-bit reboot counter.
pub const KV_KEY_REBOOTS: u16 = 0x0001;

/// Why the device restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RebootReason {
    /// No recorded reason (cold boot, power loss).
    Unknown = 0,
    /// A watchdog channel starved.
    Watchdog = 1,
    /// A fault handler ran; parameters carry PC and LR.
    Fault = 2,
    /// An operator or RPC requested the restart.
    Requested = 3,
    /// The crypto or I/O layer reported an unrecoverable failure.
    Hardware = 4,
}

/// Diagnostics captured for one reboot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootState {
    /// Reason for the restart.
    pub reason: RebootReason,
    /// Name of the task that triggered it.
    pub thread: String,
    /// Seconds of uptime at the moment of capture.
    pub uptime_secs: u32,
    /// Reason-specific parameter (program counter for faults).
    pub param_1: u32,
    /// Reason-specific parameter (link register for faults).
    pub param_2: u32,
    /// Total reboots recorded for this device.
    pub count: u32,
}

/// Memory region that survives a restart.
///
/// On hardware this maps to a no-init RAM section; here it is process
/// memory handed from the capture site to the next "boot".
#[derive(Debug, Default)]
pub struct RetainedMemory {
    state: Mutex<Option<RebootState>>,
}

impl RetainedMemory {
    /// Create empty retained memory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the state recorded before the last restart, clearing it.
    #[must_use]
    pub fn take(&self) -> Option<RebootState> {
        self.state.lock().expect("not poisoned").take()
    }
}

/// Records reboot diagnostics and schedules restarts.
pub struct RebootHandler {
    retained: Arc<RetainedMemory>,
    kv: Arc<KvStore>,
    booted_at: Instant,
}

impl RebootHandler {
    /// Create a handler writing into `retained` and counting in `kv`.
    #[must_use]
    pub fn new(retained: Arc<RetainedMemory>, kv: Arc<KvStore>) -> Self {
        Self {
            retained,
            kv,
            booted_at: Instant::now(),
        }
    }

    fn next_count(&self) -> u32 {
        let count = self
            .kv
            .read(KV_KEY_REBOOTS)
            .ok()
            .and_then(|value| value.try_into().ok().map(u32::from_le_bytes))
            .unwrap_or(0)
            .wrapping_add(1);
        let _ = self.kv.write(KV_KEY_REBOOTS, &count.to_le_bytes());
        count
    }

    /// Capture diagnostics for an imminent restart.
    pub fn capture(&self, reason: RebootReason, thread: &str, param_1: u32, param_2: u32) {
        #[allow(clippy::cast_possible_truncation)]
        let uptime_secs = self.booted_at.elapsed().as_secs() as u32;
        let state = RebootState {
            reason,
            thread: thread.to_string(),
            uptime_secs,
            param_1,
            param_2,
            count: self.next_count(),
        };
        error!(?reason, thread, uptime_secs, "capturing reboot state");
        *self.retained.state.lock().expect("not poisoned") = Some(state);
    }

    /// Capture diagnostics, then invoke `restart` after `delay`.
    ///
    /// The delay gives pending telemetry flushes a window to drain.
    pub fn capture_delayed(
        self: &Arc<Self>,
        reason: RebootReason,
        thread: &str,
        delay: Duration,
        restart: impl FnOnce() + Send + 'static,
    ) {
        self.capture(reason, thread, 0, 0);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            restart();
        });
    }
}

impl std::fmt::Debug for RebootHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebootHandler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_records_state_and_counts() {
        let retained = Arc::new(RetainedMemory::new());
        let kv = Arc::new(KvStore::new());
        let handler = RebootHandler::new(Arc::clone(&retained), Arc::clone(&kv));

        handler.capture(RebootReason::Fault, "sampler", 0x0800_1234, 0x0800_5678);
        let state = retained.take().unwrap();
        assert_eq!(state.reason, RebootReason::Fault);
        assert_eq!(state.thread, "sampler");
        assert_eq!(state.param_1, 0x0800_1234);
        assert_eq!(state.count, 1);
        // Retained memory is consumed by the query.
        assert!(retained.take().is_none());

        // The counter persists across handler instances.
        let handler = RebootHandler::new(Arc::clone(&retained), kv);
        handler.capture(RebootReason::Watchdog, "epacket", 0, 0);
        assert_eq!(retained.take().unwrap().count, 2);
    }

    #[tokio::test]
    async fn delayed_capture_invokes_restart() {
        let retained = Arc::new(RetainedMemory::new());
        let kv = Arc::new(KvStore::new());
        let handler = Arc::new(RebootHandler::new(retained, kv));

        let (tx, rx) = tokio::sync::oneshot::channel();
        handler.capture_delayed(
            RebootReason::Requested,
            "rpc_server",
            Duration::from_millis(20),
            move || {
                let _ = tx.send(());
            },
        );
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("restart hook ran")
            .unwrap();
    }
}
