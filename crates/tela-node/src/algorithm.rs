//! Algorithm runner.
//!
//! Runs registered algorithms against publish/subscribe channels. Each
//! algorithm owns a channel listener; the listener's changed flag
//! coalesces bursts, so a slow algorithm processes only the most recent
//! value. Long-running algorithms observe a terminate signal at each
//! iteration and unwind cleanly.

use crate::pubsub::Listener;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Control handle for a running algorithm.
pub struct AlgorithmHandle {
    name: &'static str,
    terminate: Arc<Notify>,
}

impl AlgorithmHandle {
    /// Raise the terminate signal; the algorithm exits at its next
    /// iteration boundary.
    pub fn terminate(&self) {
        debug!(algorithm = self.name, "terminate signal raised");
        self.terminate.notify_one();
    }
}

impl std::fmt::Debug for AlgorithmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgorithmHandle")
            .field("name", &self.name)
            .finish()
    }
}

/// Spawn an algorithm task consuming `listener`.
///
/// `process` runs once per coalesced publication with the latest channel
/// value. The channel payload is claimed only long enough to copy it, so
/// producers are never blocked on algorithm runtime.
pub fn spawn_algorithm(
    name: &'static str,
    listener: Listener,
    mut process: impl FnMut(&[u8]) + Send + 'static,
) -> AlgorithmHandle {
    let terminate = Arc::new(Notify::new());
    let signal = Arc::clone(&terminate);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = listener.changed() => {
                    let data = { listener.claim().clone() };
                    process(&data);
                }
                () = signal.notified() => {
                    debug!(algorithm = name, "terminated");
                    break;
                }
            }
        }
    });

    AlgorithmHandle { name, terminate }
}
