//! Encrypted blob storage.
//!
//! Protects arbitrary byte blobs under 32-bit UIDs with the same AEAD used
//! for packet transport. Each stored record is an 8-byte info header
//! `{flags: u32 LE, size: u32 LE}` followed by `nonce (12) ‖ ciphertext ‖
//! tag (16)`; the header and UID are bound as associated data, so a record
//! cannot be re-filed under another UID. Keys come from the registry's
//! custom derivation path and never touch the stored bytes.

use crate::error::NodeError;
use crate::keys::KeyRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tela_wire::crypto::{self, NONCE_LEN, TAG_LEN};
use tela_wire::KeyClass;

/// Record flag bit: the blob may be written exactly once.
pub const FLAG_WRITE_ONCE: u32 = 1 << 0;

const INFO_HEADER_LEN: usize = 8;
const DERIVE_SALT: &[u8] = b"secure_storage";
const DERIVE_INFO: &[u8] = b"blob_protection";

/// Encrypted blob store keyed by 32-bit UIDs.
pub struct SecureStorage {
    keys: Arc<KeyRegistry>,
    records: Mutex<HashMap<u32, Vec<u8>>>,
}

impl SecureStorage {
    /// Create a store deriving its protection key from `keys`.
    #[must_use]
    pub fn new(keys: Arc<KeyRegistry>) -> Self {
        Self {
            keys,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn aad(uid: u32, header: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(4 + INFO_HEADER_LEN);
        aad.extend_from_slice(&uid.to_le_bytes());
        aad.extend_from_slice(header);
        aad
    }

    /// Store `plaintext` under `uid` with the given record flags.
    ///
    /// # Errors
    ///
    /// [`NodeError::NotPermitted`] when an existing record carries
    /// [`FLAG_WRITE_ONCE`]; key derivation errors propagate.
    pub fn write(&self, uid: u32, flags: u32, plaintext: &[u8]) -> Result<(), NodeError> {
        {
            let records = self.records.lock().expect("not poisoned");
            if let Some(existing) = records.get(&uid) {
                let existing_flags =
                    u32::from_le_bytes([existing[0], existing[1], existing[2], existing[3]]);
                if existing_flags & FLAG_WRITE_ONCE != 0 {
                    return Err(NodeError::NotPermitted);
                }
            }
        }

        let key = self
            .keys
            .derive(KeyClass::Device, DERIVE_SALT, DERIVE_INFO)?;

        let mut record = Vec::with_capacity(
            INFO_HEADER_LEN + NONCE_LEN + plaintext.len() + TAG_LEN,
        );
        record.extend_from_slice(&flags.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        record.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());

        let mut nonce = [0u8; NONCE_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);

        let aad = Self::aad(uid, &record[..INFO_HEADER_LEN]);
        let sealed = crypto::seal(&key.export(), &nonce, &aad, plaintext);
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&sealed);

        self.records.lock().expect("not poisoned").insert(uid, record);
        Ok(())
    }

    /// Read and decrypt the record under `uid`, returning its flags and
    /// plaintext.
    ///
    /// # Errors
    ///
    /// [`NodeError::NoSuchEntry`] for absent records,
    /// [`NodeError::AuthFailure`] when the record was tampered with.
    pub fn read(&self, uid: u32) -> Result<(u32, Vec<u8>), NodeError> {
        let record = self
            .records
            .lock()
            .expect("not poisoned")
            .get(&uid)
            .cloned()
            .ok_or(NodeError::NoSuchEntry)?;
        if record.len() < INFO_HEADER_LEN + NONCE_LEN + TAG_LEN {
            return Err(NodeError::AuthFailure);
        }
        let flags = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let size = u32::from_le_bytes([record[4], record[5], record[6], record[7]]);

        let key = self
            .keys
            .derive(KeyClass::Device, DERIVE_SALT, DERIVE_INFO)?;
        let nonce: [u8; NONCE_LEN] = record[INFO_HEADER_LEN..INFO_HEADER_LEN + NONCE_LEN]
            .try_into()
            .expect("length checked above");
        let aad = Self::aad(uid, &record[..INFO_HEADER_LEN]);
        let plaintext = crypto::open(
            &key.export(),
            &nonce,
            &aad,
            &record[INFO_HEADER_LEN + NONCE_LEN..],
        )
        .map_err(|_| NodeError::AuthFailure)?;
        if plaintext.len() != size as usize {
            return Err(NodeError::AuthFailure);
        }
        Ok((flags, plaintext))
    }

    /// Delete the record under `uid`.
    ///
    /// # Errors
    ///
    /// [`NodeError::NoSuchEntry`] when no record exists.
    pub fn delete(&self, uid: u32) -> Result<(), NodeError> {
        self.records
            .lock()
            .expect("not poisoned")
            .remove(&uid)
            .map(|_| ())
            .ok_or(NodeError::NoSuchEntry)
    }

    /// `true` when a record exists under `uid`.
    #[must_use]
    pub fn exists(&self, uid: u32) -> bool {
        self.records.lock().expect("not poisoned").contains_key(&uid)
    }
}

impl std::fmt::Debug for SecureStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStorage").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> SecureStorage {
        SecureStorage::new(Arc::new(KeyRegistry::new(
            [0x11; 32],
            1,
            [0x22; 32],
            0x123456,
        )))
    }

    #[test]
    fn write_read_round_trip() {
        let store = storage();
        store.write(0xDEAD_0001, 0, b"secret bytes").unwrap();
        let (flags, plaintext) = store.read(0xDEAD_0001).unwrap();
        assert_eq!(flags, 0);
        assert_eq!(plaintext, b"secret bytes");
    }

    #[test]
    fn record_layout_has_nonce_and_tag_overhead() {
        let store = storage();
        store.write(7, 0, b"abc").unwrap();
        let record = store.records.lock().unwrap().get(&7).cloned().unwrap();
        assert_eq!(record.len(), INFO_HEADER_LEN + NONCE_LEN + 3 + TAG_LEN);
        // Size field reflects the plaintext length.
        assert_eq!(u32::from_le_bytes([record[4], record[5], record[6], record[7]]), 3);
    }

    #[test]
    fn write_once_records_refuse_overwrite() {
        let store = storage();
        store.write(9, FLAG_WRITE_ONCE, b"first").unwrap();
        assert!(matches!(
            store.write(9, 0, b"second"),
            Err(NodeError::NotPermitted)
        ));
        assert_eq!(store.read(9).unwrap().1, b"first");
    }

    #[test]
    fn tampered_record_fails_authentication() {
        let store = storage();
        store.write(11, 0, b"integrity").unwrap();
        {
            let mut records = store.records.lock().unwrap();
            let record = records.get_mut(&11).unwrap();
            let mid = record.len() - TAG_LEN - 2;
            record[mid] ^= 0x40;
        }
        assert!(matches!(store.read(11), Err(NodeError::AuthFailure)));
    }

    #[test]
    fn missing_record_reports_no_entry() {
        let store = storage();
        assert!(matches!(store.read(404), Err(NodeError::NoSuchEntry)));
        assert!(matches!(store.delete(404), Err(NodeError::NoSuchEntry)));
        assert!(!store.exists(404));
    }

    #[test]
    fn records_do_not_decrypt_under_other_uids() {
        let store = storage();
        store.write(21, 0, b"bound to uid").unwrap();
        // Move the record bytes to a different uid; the AAD binding breaks.
        let record = store.records.lock().unwrap().get(&21).cloned().unwrap();
        store.records.lock().unwrap().insert(22, record);
        assert!(matches!(store.read(22), Err(NodeError::AuthFailure)));
    }
}
