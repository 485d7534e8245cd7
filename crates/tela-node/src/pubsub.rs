//! Publish/subscribe channel registry.
//!
//! Producers publish payloads to numbered channels; algorithm listeners
//! register against a channel and observe values under a claim/finish
//! pattern. A per-listener changed flag coalesces repeated publications, so
//! a slow consumer sees only the most recent value instead of a backlog.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

struct ChannelState {
    value: Mutex<Vec<u8>>,
    listeners: Mutex<Vec<Arc<ListenerState>>>,
}

struct ListenerState {
    changed: AtomicBool,
    notify: Notify,
}

/// Registry of publish/subscribe channels keyed by 16-bit channel id.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<u16, Arc<ChannelState>>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, id: u16) -> Arc<ChannelState> {
        let mut channels = self.channels.lock().expect("not poisoned");
        Arc::clone(channels.entry(id).or_insert_with(|| {
            Arc::new(ChannelState {
                value: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
            })
        }))
    }

    /// Publish a payload: store it as the channel's latest value and flag
    /// every registered listener.
    pub fn publish(&self, id: u16, payload: &[u8]) {
        let channel = self.channel(id);
        {
            // Claim the value for write; listeners claiming for read wait.
            let mut value = channel.value.lock().expect("not poisoned");
            value.clear();
            value.extend_from_slice(payload);
        }
        let listeners = channel.listeners.lock().expect("not poisoned");
        for listener in listeners.iter() {
            listener.changed.store(true, Ordering::Release);
            listener.notify.notify_one();
        }
    }

    /// Register a listener on a channel.
    #[must_use]
    pub fn subscribe(&self, id: u16) -> Listener {
        let channel = self.channel(id);
        let state = Arc::new(ListenerState {
            changed: AtomicBool::new(false),
            notify: Notify::new(),
        });
        channel
            .listeners
            .lock()
            .expect("not poisoned")
            .push(Arc::clone(&state));
        Listener { channel, state }
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry").finish_non_exhaustive()
    }
}

/// A registered channel listener.
pub struct Listener {
    channel: Arc<ChannelState>,
    state: Arc<ListenerState>,
}

impl Listener {
    /// Wait until a publication has occurred since the last observation,
    /// then clear the changed flag.
    ///
    /// Multiple publications while the listener was busy collapse into one
    /// wakeup; [`Listener::claim`] then observes the latest value.
    pub async fn changed(&self) {
        loop {
            if self.state.changed.swap(false, Ordering::Acquire) {
                return;
            }
            self.state.notify.notified().await;
        }
    }

    /// `true` when a publication is pending; clears the flag.
    #[must_use]
    pub fn take_changed(&self) -> bool {
        self.state.changed.swap(false, Ordering::Acquire)
    }

    /// Claim the channel value for reading. Only one claimant holds the
    /// value at a time; dropping the guard finishes the claim.
    #[must_use]
    pub fn claim(&self) -> MutexGuard<'_, Vec<u8>> {
        self.channel.value.lock().expect("not poisoned")
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Listener(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_sees_published_value() {
        let registry = ChannelRegistry::new();
        let listener = registry.subscribe(10);
        registry.publish(10, b"sample");
        listener.changed().await;
        assert_eq!(*listener.claim(), b"sample");
    }

    #[tokio::test]
    async fn repeated_publications_coalesce() {
        let registry = ChannelRegistry::new();
        let listener = registry.subscribe(10);
        for i in 0u8..5 {
            registry.publish(10, &[i]);
        }
        // One wakeup, latest value.
        listener.changed().await;
        assert_eq!(*listener.claim(), [4]);
        assert!(!listener.take_changed());
    }

    #[tokio::test]
    async fn listeners_are_independent() {
        let registry = ChannelRegistry::new();
        let fast = registry.subscribe(3);
        let slow = registry.subscribe(3);

        registry.publish(3, b"first");
        fast.changed().await;
        assert_eq!(*fast.claim(), b"first");

        registry.publish(3, b"second");
        fast.changed().await;
        // The slow listener never observed "first"; it sees the latest.
        slow.changed().await;
        assert_eq!(*slow.claim(), b"second");
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let registry = ChannelRegistry::new();
        let a = registry.subscribe(1);
        registry.publish(2, b"other");
        assert!(!a.take_changed());
    }
}
