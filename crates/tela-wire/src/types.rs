//! Core type definitions and protocol constants shared across the stack.

/// A 64-bit device identity carried in every ePacket frame.
pub type DeviceId = u64;

/// A 24-bit network identifier (stored in the low bits of a `u32`).
pub type NetworkId = u32;

/// Payload type byte carried in the authenticated ePacket header.
pub mod packet_type {
    /// Echo request; the payload is returned verbatim in an [`ECHO_RSP`].
    pub const ECHO_REQ: u8 = 0x01;
    /// Echo response.
    pub const ECHO_RSP: u8 = 0x02;
    /// Buffer of TDF-encoded telemetry.
    pub const TDF: u8 = 0x03;
    /// TDF telemetry logged on behalf of another device; payload is
    /// prefixed with the 64-bit remote device id.
    pub const TDF_REMOTE: u8 = 0x04;
    /// Directory of the sender's active device key identifiers.
    pub const KEY_IDS: u8 = 0x05;
    /// RPC command request.
    pub const RPC_CMD: u8 = 0x10;
    /// RPC bulk data frame associated with an in-flight command.
    pub const RPC_DATA: u8 = 0x11;
    /// RPC command response.
    pub const RPC_RSP: u8 = 0x12;
    /// Acknowledgement of received RPC data frames.
    pub const RPC_DATA_ACK: u8 = 0x13;
}

/// Authentication level of a packet.
///
/// Transmit metadata selects [`Auth::Network`] or [`Auth::Device`] to pick
/// the key class; [`Auth::RemoteEncrypted`] marks payloads that were already
/// encrypted by a third party and must be forwarded untouched. Receive
/// metadata reports [`Auth::Failure`] when the AEAD tag did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Auth {
    /// Packet failed to decrypt (receive only).
    Failure,
    /// Authenticated with a network-class key.
    Network,
    /// Authenticated with a device-class key.
    Device,
    /// Payload is encrypted for a remote device; transmitted as-is.
    RemoteEncrypted,
}

/// Global ePacket flag bits (u16, little-endian on the wire).
pub mod flags {
    /// Bit 15: packet is encrypted with a device-class key.
    pub const ENCRYPTION_DEVICE: u16 = 0x8000;
    /// Network-class encryption (bit 15 clear).
    pub const ENCRYPTION_NETWORK: u16 = 0x0000;
    /// Bit 14: transmitting device requests an acknowledgement.
    pub const ACK_REQUEST: u16 = 0x4000;
    /// Bits 0-7: reserved for interface-specific use.
    pub const INTERFACE_MASK: u16 = 0x00FF;
}

/// Numeric identity of an ePacket interface.
///
/// The discriminants double as the interface component of key derivation,
/// so they are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InterfaceId {
    /// Framed serial byte stream.
    Serial = 0,
    /// UDP datagrams.
    Udp = 1,
    /// Bluetooth extended advertising.
    BtAdv = 2,
    /// Bluetooth GATT connection.
    BtGatt = 3,
}

impl InterfaceId {
    /// Total number of interface identities.
    pub const COUNT: usize = 4;

    /// All interface identities, indexable by discriminant.
    pub const ALL: [InterfaceId; Self::COUNT] = [
        InterfaceId::Serial,
        InterfaceId::Udp,
        InterfaceId::BtAdv,
        InterfaceId::BtGatt,
    ];

    /// Interface identity from its wire discriminant.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    /// Bit used to address this interface in logger / flush masks.
    #[must_use]
    pub const fn mask_bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Key class: the top bit of the key-type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyClass {
    /// Keys derived from a network root, shared by all devices on the network.
    Network,
    /// Keys derived from this device's hardware-unique root.
    Device,
}

impl KeyClass {
    /// Class bit as used in key identifiers and derivation salts.
    #[must_use]
    pub const fn bit(self) -> u32 {
        match self {
            KeyClass::Network => 0,
            KeyClass::Device => 1,
        }
    }
}

/// A single-byte payload of this value prompts a [`packet_type::KEY_IDS`]
/// response listing the receiving device's active device-key identifiers.
pub const KEY_ID_REQUEST_MAGIC: u8 = 0x4D;

/// First byte of the two-byte rate-limit request `{magic, delay_ms}`: the
/// receiver pauses its transmissions on that interface for `delay_ms`.
pub const RATE_LIMIT_REQUEST_MAGIC: u8 = 0x4E;

/// Seconds per key-rotation interval: derived keys rotate daily.
pub const KEY_ROTATION_PERIOD_SECS: u64 = 86_400;
