//! Key registry: root keys and per-interface derived key cache.
//!
//! Packet keys are identified by `(class, interface, network id, rotation)`
//! and derived lazily from the matching root via HKDF-SHA256. Derived keys
//! are volatile: the cache holds a bounded number of handles and evicts the
//! least-recently-issued one, re-deriving on a later miss. Losing the cache
//! (or rebooting) therefore costs one derivation, never correctness.

use crate::error::NodeError;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tela_wire::crypto::{self, KEY_LEN};
use tela_wire::{InterfaceId, KeyClass, NetworkId};
use zeroize::Zeroize;

/// Number of derived key handles kept alive at once.
pub const KEY_CACHE_SLOTS: usize = 16;

/// Number of extension network roots a device can carry in addition to its
/// primary network.
pub const EXTENSION_NETWORK_SLOTS: usize = 4;

/// An opaque volatile key handle.
///
/// The raw material is only reachable by the frame layer and by
/// [`KeyHandle::export`] for test vectors; handles are freed by zeroizing
/// on drop.
pub struct KeyHandle {
    material: [u8; KEY_LEN],
}

impl KeyHandle {
    pub(crate) fn material(&self) -> &[u8; KEY_LEN] {
        &self.material
    }

    /// Export the raw key bytes.
    ///
    /// Intended for interoperability test vectors only.
    #[must_use]
    pub fn export(&self) -> [u8; KEY_LEN] {
        self.material
    }
}

impl Drop for KeyHandle {
    fn drop(&mut self) {
        self.material.zeroize();
    }
}

impl std::fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyHandle(..)")
    }
}

/// A 32-byte root key, zeroized on drop.
struct RootKey([u8; KEY_LEN]);

impl Drop for RootKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

struct NetworkRoot {
    network_id: NetworkId,
    root: RootKey,
}

#[derive(PartialEq, Eq, Hash, Clone)]
enum CacheKey {
    Packet {
        class: KeyClass,
        interface: InterfaceId,
        identifier: NetworkId,
        rotation: u32,
    },
    Custom {
        class: KeyClass,
        salt: Vec<u8>,
        info: Vec<u8>,
    },
}

/// Registry of root keys and cached derived keys.
pub struct KeyRegistry {
    device_root: RootKey,
    device_key_id: NetworkId,
    networks: Mutex<Vec<NetworkRoot>>,
    cache: Mutex<LruCache<CacheKey, Arc<KeyHandle>>>,
}

impl KeyRegistry {
    /// Create a registry from the device root (hardware unique key) and the
    /// primary network root.
    ///
    /// `device_key_id` and `network_id` are the 24-bit identifiers carried
    /// in packet headers for the respective key classes.
    #[must_use]
    pub fn new(
        device_root: [u8; KEY_LEN],
        device_key_id: NetworkId,
        network_root: [u8; KEY_LEN],
        network_id: NetworkId,
    ) -> Self {
        Self {
            device_root: RootKey(device_root),
            device_key_id: device_key_id & 0x00FF_FFFF,
            networks: Mutex::new(vec![NetworkRoot {
                network_id: network_id & 0x00FF_FFFF,
                root: RootKey(network_root),
            }]),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(KEY_CACHE_SLOTS).expect("cache capacity is nonzero"),
            )),
        }
    }

    /// The 24-bit identifier of this device's device-class keys.
    #[must_use]
    pub fn device_key_identifier(&self) -> NetworkId {
        self.device_key_id
    }

    /// The 24-bit identifier of the primary network.
    #[must_use]
    pub fn network_key_identifier(&self) -> NetworkId {
        self.networks.lock().expect("not poisoned")[0].network_id
    }

    /// Register an additional network root for multi-tenant devices.
    ///
    /// # Errors
    ///
    /// * [`NodeError::InvalidArgument`]: identifier outside 24 bits.
    /// * [`NodeError::Already`]: the network id is already registered.
    /// * [`NodeError::NoCapacity`]: all extension slots are in use.
    pub fn add_extension_network(
        &self,
        root: [u8; KEY_LEN],
        network_id: NetworkId,
    ) -> Result<(), NodeError> {
        if network_id > 0x00FF_FFFF {
            return Err(NodeError::InvalidArgument);
        }
        let mut networks = self.networks.lock().expect("not poisoned");
        if networks.iter().any(|n| n.network_id == network_id) {
            return Err(NodeError::Already);
        }
        if networks.len() >= 1 + EXTENSION_NETWORK_SLOTS {
            return Err(NodeError::NoCapacity("extension network slots"));
        }
        networks.push(NetworkRoot {
            network_id,
            root: RootKey(root),
        });
        Ok(())
    }

    /// Resolve the packet key for `(class, interface, identifier, rotation)`.
    ///
    /// Derives and caches on miss. Returns `None` when the identifier does
    /// not match any known root: for the device class, anything other than
    /// this device's own key id; for the network class, an unknown network.
    #[must_use]
    pub fn get(
        &self,
        class: KeyClass,
        interface: InterfaceId,
        identifier: NetworkId,
        rotation: u32,
    ) -> Option<Arc<KeyHandle>> {
        let cache_key = CacheKey::Packet {
            class,
            interface,
            identifier,
            rotation,
        };
        {
            let mut cache = self.cache.lock().expect("not poisoned");
            if let Some(handle) = cache.get(&cache_key) {
                return Some(Arc::clone(handle));
            }
        }

        // Packet key derivation per the wire contract: the salt packs the
        // key identity, the info carries the rotation index.
        let salt = (class.bit() << 31)
            | (u32::from(interface as u8) << 24)
            | (identifier & 0x00FF_FFFF);
        let info = rotation.to_le_bytes();
        let material = match class {
            KeyClass::Device => {
                if identifier != self.device_key_id {
                    // Only this device's own key can be derived.
                    return None;
                }
                crypto::derive_key(&self.device_root.0, &salt.to_le_bytes(), &info)
            }
            KeyClass::Network => {
                let networks = self.networks.lock().expect("not poisoned");
                let root = &networks.iter().find(|n| n.network_id == identifier)?.root;
                crypto::derive_key(&root.0, &salt.to_le_bytes(), &info)
            }
        };

        let handle = Arc::new(KeyHandle { material });
        tracing::debug!(
            class = ?class,
            interface = ?interface,
            identifier,
            rotation,
            "derived packet key"
        );
        self.cache
            .lock()
            .expect("not poisoned")
            .put(cache_key, Arc::clone(&handle));
        Some(handle)
    }

    /// Derive a key from a root with caller-supplied salt and info.
    ///
    /// The same inputs return the same handle for as long as it remains
    /// cached. Used by collaborators such as secure storage.
    ///
    /// # Errors
    ///
    /// [`NodeError::InvalidArgument`] when `salt` or `info` is empty.
    pub fn derive(
        &self,
        class: KeyClass,
        salt: &[u8],
        info: &[u8],
    ) -> Result<Arc<KeyHandle>, NodeError> {
        if salt.is_empty() || info.is_empty() {
            return Err(NodeError::InvalidArgument);
        }
        let cache_key = CacheKey::Custom {
            class,
            salt: salt.to_vec(),
            info: info.to_vec(),
        };
        let mut cache = self.cache.lock().expect("not poisoned");
        if let Some(handle) = cache.get(&cache_key) {
            return Ok(Arc::clone(handle));
        }
        let material = match class {
            KeyClass::Device => crypto::derive_key(&self.device_root.0, salt, info),
            KeyClass::Network => {
                let networks = self.networks.lock().expect("not poisoned");
                crypto::derive_key(&networks[0].root.0, salt, info)
            }
        };
        let handle = Arc::new(KeyHandle { material });
        cache.put(cache_key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Invalidate a cached packet key, forcing re-derivation on next use.
    pub fn delete(
        &self,
        class: KeyClass,
        interface: InterfaceId,
        identifier: NetworkId,
        rotation: u32,
    ) {
        self.cache.lock().expect("not poisoned").pop(&CacheKey::Packet {
            class,
            interface,
            identifier,
            rotation,
        });
    }
}

impl std::fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("device_key_id", &self.device_key_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_ROOT: [u8; 32] = [0x11; 32];
    const NETWORK_ROOT: [u8; 32] = [0x22; 32];
    const NET_ID: u32 = 0x123456;
    const DEV_KEY_ID: u32 = 0x000042;

    fn registry() -> KeyRegistry {
        KeyRegistry::new(DEVICE_ROOT, DEV_KEY_ID, NETWORK_ROOT, NET_ID)
    }

    #[test]
    fn derived_keys_differ_on_every_identity_component() {
        let reg = registry();
        let base = reg
            .get(KeyClass::Network, InterfaceId::Udp, NET_ID, 100)
            .unwrap()
            .export();

        let other_iface = reg
            .get(KeyClass::Network, InterfaceId::Serial, NET_ID, 100)
            .unwrap()
            .export();
        let other_rotation = reg
            .get(KeyClass::Network, InterfaceId::Udp, NET_ID, 101)
            .unwrap()
            .export();
        let device_class = reg
            .get(KeyClass::Device, InterfaceId::Udp, DEV_KEY_ID, 100)
            .unwrap()
            .export();

        assert_ne!(base, other_iface);
        assert_ne!(base, other_rotation);
        assert_ne!(base, device_class);
        assert_ne!(other_iface, other_rotation);
    }

    #[test]
    fn cache_returns_same_handle() {
        let reg = registry();
        let a = reg
            .get(KeyClass::Network, InterfaceId::Udp, NET_ID, 100)
            .unwrap();
        let b = reg
            .get(KeyClass::Network, InterfaceId::Udp, NET_ID, 100)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unknown_identifiers_return_none() {
        let reg = registry();
        assert!(reg
            .get(KeyClass::Network, InterfaceId::Udp, 0xBAD, 100)
            .is_none());
        // Device class only decodes our own key id.
        assert!(reg
            .get(KeyClass::Device, InterfaceId::Udp, 0xBAD, 100)
            .is_none());
    }

    #[test]
    fn eviction_rederives_identically() {
        let reg = registry();
        let first = reg
            .get(KeyClass::Network, InterfaceId::Udp, NET_ID, 0)
            .unwrap()
            .export();
        // Push enough distinct rotations through to evict rotation 0.
        for rotation in 1..=(KEY_CACHE_SLOTS as u32) {
            reg.get(KeyClass::Network, InterfaceId::Udp, NET_ID, rotation)
                .unwrap();
        }
        let again = reg
            .get(KeyClass::Network, InterfaceId::Udp, NET_ID, 0)
            .unwrap()
            .export();
        assert_eq!(first, again);
    }

    #[test]
    fn delete_invalidates_cache_entry() {
        let reg = registry();
        let a = reg
            .get(KeyClass::Network, InterfaceId::Udp, NET_ID, 5)
            .unwrap();
        reg.delete(KeyClass::Network, InterfaceId::Udp, NET_ID, 5);
        let b = reg
            .get(KeyClass::Network, InterfaceId::Udp, NET_ID, 5)
            .unwrap();
        // Different handle, identical material.
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.export(), b.export());
    }

    #[test]
    fn extension_networks() {
        let reg = registry();
        let ext_root = [0x33u8; 32];
        reg.add_extension_network(ext_root, 0x777777).unwrap();
        assert!(matches!(
            reg.add_extension_network(ext_root, 0x777777),
            Err(NodeError::Already)
        ));
        // Extension keys resolve and differ from the primary network's.
        let ext = reg
            .get(KeyClass::Network, InterfaceId::Udp, 0x777777, 9)
            .unwrap()
            .export();
        let primary = reg
            .get(KeyClass::Network, InterfaceId::Udp, NET_ID, 9)
            .unwrap()
            .export();
        assert_ne!(ext, primary);

        // Capacity is bounded.
        for i in 0..EXTENSION_NETWORK_SLOTS as u32 {
            let _ = reg.add_extension_network([i as u8; 32], 0x700000 + i);
        }
        assert!(matches!(
            reg.add_extension_network([0x44; 32], 0x7FFFFF),
            Err(NodeError::NoCapacity(_))
        ));
    }

    #[test]
    fn custom_derivation_is_stable_per_inputs() {
        let reg = registry();
        let a = reg
            .derive(KeyClass::Device, b"SS_SALT", b"SECURE_STORAGE")
            .unwrap();
        let b = reg
            .derive(KeyClass::Device, b"SS_SALT", b"SECURE_STORAGE")
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let other = reg.derive(KeyClass::Device, b"SS_SALT", b"OTHER").unwrap();
        assert_ne!(a.export(), other.export());
    }

    #[test]
    fn empty_derivation_inputs_rejected() {
        let reg = registry();
        assert!(matches!(
            reg.derive(KeyClass::Device, b"", b"info"),
            Err(NodeError::InvalidArgument)
        ));
    }
}
