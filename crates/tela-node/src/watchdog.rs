//! Software watchdog.
//!
//! Long-running tasks install a channel and feed it on every significant
//! iteration. A monitor task logs starved channels and invokes the expiry
//! hook, which a board integration typically wires to a reboot with
//! retained diagnostics.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error};

type ExpiryHook = Box<dyn Fn(&'static str) + Send + Sync>;

struct ChannelState {
    name: &'static str,
    period: Duration,
    last_feed: Instant,
    expired: bool,
}

struct WatchdogInner {
    channels: Mutex<Vec<ChannelState>>,
    expiry_hook: Mutex<Option<ExpiryHook>>,
}

/// Watchdog instance shared by all supervised tasks.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

/// Feeding handle for one installed channel.
#[derive(Clone)]
pub struct WatchdogChannel {
    inner: Arc<WatchdogInner>,
    index: usize,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    /// Create a watchdog with no channels.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                channels: Mutex::new(Vec::new()),
                expiry_hook: Mutex::new(None),
            }),
        }
    }

    /// Set the hook invoked with the channel name when a channel starves.
    pub fn set_expiry_hook(&self, hook: impl Fn(&'static str) + Send + Sync + 'static) {
        *self.inner.expiry_hook.lock().expect("not poisoned") = Some(Box::new(hook));
    }

    /// Install a channel that must be fed at least every `period`.
    #[must_use]
    pub fn install(&self, name: &'static str, period: Duration) -> WatchdogChannel {
        let mut channels = self.inner.channels.lock().expect("not poisoned");
        channels.push(ChannelState {
            name,
            period,
            last_feed: Instant::now(),
            expired: false,
        });
        debug!(name, ?period, "watchdog channel installed");
        WatchdogChannel {
            inner: Arc::clone(&self.inner),
            index: channels.len() - 1,
        }
    }

    /// Spawn the monitor task checking channels at `interval`.
    pub fn start(&self, interval: Duration) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let mut starved = Vec::new();
                {
                    let mut channels = inner.channels.lock().expect("not poisoned");
                    for channel in channels.iter_mut() {
                        if !channel.expired && channel.last_feed.elapsed() > channel.period {
                            channel.expired = true;
                            starved.push(channel.name);
                        }
                    }
                }
                for name in starved {
                    error!(channel = name, "watchdog channel starved");
                    if let Some(hook) = inner.expiry_hook.lock().expect("not poisoned").as_ref() {
                        hook(name);
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog").finish_non_exhaustive()
    }
}

impl WatchdogChannel {
    /// Record liveness for this channel.
    pub fn feed(&self) {
        let mut channels = self.inner.channels.lock().expect("not poisoned");
        if let Some(channel) = channels.get_mut(self.index) {
            channel.last_feed = Instant::now();
            channel.expired = false;
        }
    }
}

impl std::fmt::Debug for WatchdogChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchdogChannel")
            .field("index", &self.index)
            .finish()
    }
}
