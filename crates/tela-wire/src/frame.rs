//! ePacket wire framing.
//!
//! Every frame is an unencrypted header followed by the AEAD-protected
//! body. The header splits into two regions: the associated data
//! (authenticated but visible: type, flags, key identifier, upper device
//! id) and the nonce (lower device id, GPS time, sequence, entropy). The
//! body is `ciphertext ‖ 16-byte tag` over the caller payload, with the
//! associated-data bytes as AEAD AAD.
//!
//! Two layouts exist: the versioned layout carries a leading frame-version
//! byte (serial and Bluetooth GATT links), the unversioned layout omits it
//! (UDP and Bluetooth advertising, where the transport already identifies
//! the protocol).

use crate::crypto::{self, CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use thiserror::Error;

/// The only frame version currently defined.
pub const FRAME_VERSION: u8 = 0;

/// Sync bytes prefixed to every frame on serial byte streams.
pub const SERIAL_SYNC: [u8; 2] = [0xAA, 0x55];

/// Length of the serial prefix: sync bytes plus a u16 LE frame length.
pub const SERIAL_PREFIX_LEN: usize = 4;

const NONCE_FIELDS_LEN: usize = NONCE_LEN;
const VERSIONED_AD_LEN: usize = 11;
const UNVERSIONED_AD_LEN: usize = 10;

/// Errors from frame encoding and decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The frame is too short to contain a header and tag.
    #[error("frame too short")]
    TooShort {
        /// Minimum expected byte count.
        expected: usize,
        /// Actual byte count received.
        actual: usize,
    },
    /// The version byte does not match a known frame layout.
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    /// The AEAD tag did not verify.
    #[error("frame authentication failed")]
    AuthFailure,
    /// The payload exceeds what the frame length field can carry.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

impl From<CryptoError> for FrameError {
    fn from(_: CryptoError) -> Self {
        FrameError::AuthFailure
    }
}

/// Frame layout selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Leading version byte; serial and Bluetooth GATT links.
    Versioned,
    /// No version byte; UDP and Bluetooth advertising links.
    Unversioned,
}

impl Framing {
    /// Associated-data length for this layout.
    #[must_use]
    pub const fn ad_len(self) -> usize {
        match self {
            Framing::Versioned => VERSIONED_AD_LEN,
            Framing::Unversioned => UNVERSIONED_AD_LEN,
        }
    }

    /// Header length: associated data plus nonce.
    #[must_use]
    pub const fn header_len(self) -> usize {
        self.ad_len() + NONCE_FIELDS_LEN
    }

    /// Total per-frame overhead: header plus authentication tag.
    #[must_use]
    pub const fn overhead(self) -> usize {
        self.header_len() + TAG_LEN
    }
}

/// Cleartext header fields of a frame.
///
/// On transmit these are written into the header; on receive they are
/// recovered by [`peek`] before any key lookup or decryption happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Payload type byte.
    pub packet_type: u8,
    /// Packet flag bits.
    pub flags: u16,
    /// 24-bit key identifier (the sender's network id).
    pub key_id: u32,
    /// 64-bit id of the sending device.
    pub device_id: u64,
    /// Sender's GPS time in whole seconds.
    pub gps_time: u32,
    /// Per-interface transmit sequence number.
    pub sequence: u16,
}

/// Encode and encrypt a frame.
///
/// `entropy` randomizes the nonce tail; the caller must ensure
/// `(device_id, key, sequence, entropy)` tuples do not repeat within a key
/// rotation.
///
/// # Errors
///
/// [`FrameError::PayloadTooLarge`] when the payload cannot be expressed in
/// a u16 frame length.
pub fn encode(
    framing: Framing,
    info: &FrameInfo,
    entropy: u16,
    key: &[u8; KEY_LEN],
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    if payload.len() + framing.overhead() > usize::from(u16::MAX) {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(framing.overhead() + payload.len());
    if framing == Framing::Versioned {
        frame.push(FRAME_VERSION);
    }
    frame.push(info.packet_type);
    frame.extend_from_slice(&info.flags.to_le_bytes());
    frame.extend_from_slice(&info.key_id.to_le_bytes()[..3]);
    #[allow(clippy::cast_possible_truncation)]
    frame.extend_from_slice(&((info.device_id >> 32) as u32).to_le_bytes());
    debug_assert_eq!(frame.len(), framing.ad_len());

    #[allow(clippy::cast_possible_truncation)]
    frame.extend_from_slice(&(info.device_id as u32).to_le_bytes());
    frame.extend_from_slice(&info.gps_time.to_le_bytes());
    frame.extend_from_slice(&info.sequence.to_le_bytes());
    frame.extend_from_slice(&entropy.to_le_bytes());
    debug_assert_eq!(frame.len(), framing.header_len());

    let (ad, nonce) = frame.split_at(framing.ad_len());
    let nonce: [u8; NONCE_LEN] = nonce.try_into().expect("nonce region is 12 bytes");
    let sealed = crypto::seal(key, &nonce, ad, payload);
    frame.extend_from_slice(&sealed);
    Ok(frame)
}

/// Parse the cleartext header of a frame without decrypting it.
///
/// Used on the receive path to recover the key identifier and sequence
/// before committing to a key lookup.
///
/// # Errors
///
/// [`FrameError::TooShort`] when the buffer cannot hold a header and tag,
/// [`FrameError::UnsupportedVersion`] for an unknown version byte.
pub fn peek(framing: Framing, frame: &[u8]) -> Result<FrameInfo, FrameError> {
    // An empty payload is valid, so the minimum frame is header + tag.
    let min = framing.overhead();
    if frame.len() < min {
        return Err(FrameError::TooShort {
            expected: min,
            actual: frame.len(),
        });
    }
    let mut at = 0usize;
    if framing == Framing::Versioned {
        if frame[0] != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(frame[0]));
        }
        at += 1;
    }
    let packet_type = frame[at];
    let flags = u16::from_le_bytes([frame[at + 1], frame[at + 2]]);
    let key_id = u32::from_le_bytes([frame[at + 3], frame[at + 4], frame[at + 5], 0]);
    let device_id_upper = u32::from_le_bytes([
        frame[at + 6],
        frame[at + 7],
        frame[at + 8],
        frame[at + 9],
    ]);
    let nonce = &frame[framing.ad_len()..framing.header_len()];
    let device_id_lower = u32::from_le_bytes([nonce[0], nonce[1], nonce[2], nonce[3]]);
    let gps_time = u32::from_le_bytes([nonce[4], nonce[5], nonce[6], nonce[7]]);
    let sequence = u16::from_le_bytes([nonce[8], nonce[9]]);

    Ok(FrameInfo {
        packet_type,
        flags,
        key_id,
        device_id: (u64::from(device_id_upper) << 32) | u64::from(device_id_lower),
        gps_time,
        sequence,
    })
}

/// Decrypt the body of a frame whose header has already been [`peek`]ed.
///
/// The input buffer is left untouched; the decrypted payload is returned
/// separately so an authentication failure preserves the original frame
/// for diagnostics.
///
/// # Errors
///
/// [`FrameError::TooShort`] on truncated input, [`FrameError::AuthFailure`]
/// when the tag does not verify.
pub fn decrypt(framing: Framing, frame: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, FrameError> {
    let min = framing.overhead();
    if frame.len() < min {
        return Err(FrameError::TooShort {
            expected: min,
            actual: frame.len(),
        });
    }
    let ad = &frame[..framing.ad_len()];
    let nonce: [u8; NONCE_LEN] = frame[framing.ad_len()..framing.header_len()]
        .try_into()
        .expect("nonce region is 12 bytes");
    Ok(crypto::open(key, &nonce, ad, &frame[framing.header_len()..])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{flags, packet_type};

    const KEY: [u8; 32] = [0x42; 32];

    fn info(sequence: u16) -> FrameInfo {
        FrameInfo {
            packet_type: packet_type::TDF,
            flags: flags::ENCRYPTION_NETWORK,
            key_id: 0x00AB_CDEF,
            device_id: 0x1122_3344_5566_7788,
            gps_time: 1_400_000_000,
            sequence,
        }
    }

    #[test]
    fn versioned_round_trip() {
        let payload = vec![0x5A; 100];
        let frame = encode(Framing::Versioned, &info(42), 0x9999, &KEY, &payload).unwrap();
        assert_eq!(frame.len(), Framing::Versioned.overhead() + payload.len());
        assert_eq!(frame[0], FRAME_VERSION);

        let peeked = peek(Framing::Versioned, &frame).unwrap();
        assert_eq!(peeked, info(42));
        let decrypted = decrypt(Framing::Versioned, &frame, &KEY).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn unversioned_round_trip() {
        let payload = b"udp payload".to_vec();
        let frame = encode(Framing::Unversioned, &info(7), 1, &KEY, &payload).unwrap();
        assert_eq!(
            frame.len(),
            Framing::Unversioned.overhead() + payload.len()
        );
        let peeked = peek(Framing::Unversioned, &frame).unwrap();
        assert_eq!(peeked.device_id, 0x1122_3344_5566_7788);
        assert_eq!(decrypt(Framing::Unversioned, &frame, &KEY).unwrap(), payload);
    }

    #[test]
    fn corrupted_body_fails_authentication() {
        let frame = encode(Framing::Versioned, &info(42), 0, &KEY, &[0u8; 100]).unwrap();
        let mut corrupted = frame.clone();
        corrupted[50] ^= 0x01;
        assert_eq!(
            decrypt(Framing::Versioned, &corrupted, &KEY),
            Err(FrameError::AuthFailure)
        );
        // The pristine frame still decrypts.
        decrypt(Framing::Versioned, &frame, &KEY).unwrap();
    }

    #[test]
    fn corrupted_header_fails_authentication() {
        let mut frame = encode(Framing::Versioned, &info(42), 0, &KEY, b"data").unwrap();
        frame[2] ^= 0x80; // flags byte, part of the AAD
        assert_eq!(
            decrypt(Framing::Versioned, &frame, &KEY),
            Err(FrameError::AuthFailure)
        );
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let frame = encode(Framing::Unversioned, &info(1), 0, &KEY, b"data").unwrap();
        let other = [0x24u8; 32];
        assert_eq!(
            decrypt(Framing::Unversioned, &frame, &other),
            Err(FrameError::AuthFailure)
        );
    }

    #[test]
    fn unknown_version_rejected() {
        let mut frame = encode(Framing::Versioned, &info(1), 0, &KEY, b"data").unwrap();
        frame[0] = 7;
        assert_eq!(
            peek(Framing::Versioned, &frame),
            Err(FrameError::UnsupportedVersion(7))
        );
    }

    #[test]
    fn truncated_frame_rejected() {
        let frame = encode(Framing::Versioned, &info(1), 0, &KEY, b"").unwrap();
        let short = &frame[..frame.len() - 1];
        assert!(matches!(
            peek(Framing::Versioned, short),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn empty_payload_round_trips() {
        let frame = encode(Framing::Unversioned, &info(3), 0, &KEY, b"").unwrap();
        assert_eq!(frame.len(), Framing::Unversioned.overhead());
        assert_eq!(decrypt(Framing::Unversioned, &frame, &KEY).unwrap(), b"");
    }

    #[test]
    fn header_layout_is_stable() {
        let frame = encode(Framing::Versioned, &info(0x1234), 0xBEEF, &KEY, b"x").unwrap();
        // version, type, flags
        assert_eq!(frame[0], 0);
        assert_eq!(frame[1], packet_type::TDF);
        assert_eq!(&frame[2..4], &[0x00, 0x00]);
        // key id, 3 bytes LE
        assert_eq!(&frame[4..7], &[0xEF, 0xCD, 0xAB]);
        // device id upper, LE
        assert_eq!(&frame[7..11], &[0x44, 0x33, 0x22, 0x11]);
        // device id lower, LE
        assert_eq!(&frame[11..15], &[0x88, 0x77, 0x66, 0x55]);
        // sequence
        assert_eq!(&frame[19..21], &[0x34, 0x12]);
        // entropy
        assert_eq!(&frame[21..23], &[0xEF, 0xBE]);
    }
}
