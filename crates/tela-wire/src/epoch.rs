//! GPS-epoch timekeeping.
//!
//! The platform keeps local time as a single `u64`: the upper 48 bits are
//! whole seconds since the GPS epoch (1980-01-06 00:00:00 UTC), the lower
//! 16 bits are fractional seconds in units of 1/65536 s. The value 0 means
//! "no time knowledge".

/// Epoch time as a 48.16 fixed-point tick count.
pub type EpochTime = u64;

/// Ticks per second of the fixed-point representation.
pub const TICKS_PER_SEC: u64 = 1 << 16;

/// Unix time at the instant of the GPS epoch.
pub const GPS_UNIX_OFFSET_SECS: u64 = 315_964_800;

/// Current GPS-UTC leap second offset.
///
/// This value will be incorrect after the next leap second.
pub const GPS_UTC_LEAP_SECONDS: u64 = 18;

/// Whole seconds component of an epoch time.
#[must_use]
pub const fn seconds(time: EpochTime) -> u32 {
    (time >> 16) as u32
}

/// Subsecond component of an epoch time, in 1/65536 s units.
#[must_use]
pub const fn subseconds(time: EpochTime) -> u16 {
    (time & 0xFFFF) as u16
}

/// Compose an epoch time from seconds and subseconds.
#[must_use]
pub const fn from_parts(seconds: u32, subseconds: u16) -> EpochTime {
    ((seconds as u64) << 16) | subseconds as u64
}

/// Convert a unix timestamp (seconds) to GPS epoch seconds.
#[must_use]
pub const fn gps_seconds_from_unix(unix: u64) -> u32 {
    (unix - GPS_UNIX_OFFSET_SECS + GPS_UTC_LEAP_SECONDS) as u32
}

/// Convert GPS epoch seconds to a unix timestamp (seconds).
#[must_use]
pub const fn unix_from_gps_seconds(gps: u32) -> u64 {
    gps as u64 + GPS_UNIX_OFFSET_SECS - GPS_UTC_LEAP_SECONDS
}

/// Key rotation index for a given epoch time: days since the GPS epoch.
#[must_use]
pub const fn rotation_index(time: EpochTime) -> u32 {
    seconds(time) / crate::types::KEY_ROTATION_PERIOD_SECS as u32
}
