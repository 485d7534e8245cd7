//! Key-value store.
//!
//! Arbitrary byte values under 16-bit integer keys, with change
//! notification callbacks and a per-key access policy. The core consumes
//! this store; persistence backends live outside it.

use crate::error::NodeError;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

type ChangeCallback = Box<dyn Fn(u16, Option<&[u8]>) + Send + Sync>;

/// In-memory key-value store with change callbacks.
#[derive(Default)]
pub struct KvStore {
    values: Mutex<HashMap<u16, Vec<u8>>>,
    disabled: Mutex<HashSet<u16>>,
    callbacks: Mutex<Vec<ChangeCallback>>,
}

impl KvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a key as disabled; reads and writes fail with
    /// [`NodeError::NotPermitted`].
    pub fn disable_key(&self, key: u16) {
        self.disabled.lock().expect("not poisoned").insert(key);
    }

    fn check_enabled(&self, key: u16) -> Result<(), NodeError> {
        if self.disabled.lock().expect("not poisoned").contains(&key) {
            return Err(NodeError::NotPermitted);
        }
        Ok(())
    }

    /// Read the value stored under `key`.
    ///
    /// # Errors
    ///
    /// [`NodeError::NoSuchEntry`] for absent keys,
    /// [`NodeError::NotPermitted`] for disabled keys.
    pub fn read(&self, key: u16) -> Result<Vec<u8>, NodeError> {
        self.check_enabled(key)?;
        self.values
            .lock()
            .expect("not poisoned")
            .get(&key)
            .cloned()
            .ok_or(NodeError::NoSuchEntry)
    }

    /// Write `value` under `key`.
    ///
    /// Returns the number of bytes written: 0 when the stored value was
    /// already identical (no callbacks fire in that case).
    ///
    /// # Errors
    ///
    /// [`NodeError::NotPermitted`] for disabled keys.
    pub fn write(&self, key: u16, value: &[u8]) -> Result<usize, NodeError> {
        self.check_enabled(key)?;
        {
            let mut values = self.values.lock().expect("not poisoned");
            if values.get(&key).is_some_and(|existing| existing == value) {
                return Ok(0);
            }
            values.insert(key, value.to_vec());
        }
        for cb in self.callbacks.lock().expect("not poisoned").iter() {
            cb(key, Some(value));
        }
        Ok(value.len())
    }

    /// Delete the value under `key`.
    ///
    /// # Errors
    ///
    /// [`NodeError::NoSuchEntry`] for absent keys,
    /// [`NodeError::NotPermitted`] for disabled keys.
    pub fn delete(&self, key: u16) -> Result<(), NodeError> {
        self.check_enabled(key)?;
        if self
            .values
            .lock()
            .expect("not poisoned")
            .remove(&key)
            .is_none()
        {
            return Err(NodeError::NoSuchEntry);
        }
        for cb in self.callbacks.lock().expect("not poisoned").iter() {
            cb(key, None);
        }
        Ok(())
    }

    /// `true` when a value exists under `key`.
    #[must_use]
    pub fn key_exists(&self, key: u16) -> bool {
        self.values.lock().expect("not poisoned").contains_key(&key)
    }

    /// Register a callback invoked on every value change; `None` marks a
    /// deletion.
    pub fn on_change(&self, callback: impl Fn(u16, Option<&[u8]>) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .expect("not poisoned")
            .push(Box::new(callback));
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore").finish_non_exhaustive()
    }
}
