//! RPC envelope encoding.
//!
//! Four packet bodies ride on ePacket for the RPC layer: command requests,
//! command responses, bulk data frames, and data acknowledgements. All
//! integers are little-endian. Headers are fixed-size and prefix any
//! command-specific parameter or payload bytes.

use thiserror::Error;

/// Byte length of a [`RequestHeader`].
pub const REQUEST_HEADER_LEN: usize = 6;
/// Byte length of a [`ResponseHeader`].
pub const RESPONSE_HEADER_LEN: usize = 8;
/// Byte length of a [`DataHeader`].
pub const DATA_HEADER_LEN: usize = 8;
/// Byte length of a [`DataAck`] body.
pub const DATA_ACK_LEN: usize = 9;

/// Sentinel offset in a [`DataAck`] marking the initial ready-to-receive
/// acknowledgement, sent before any data frame has arrived.
pub const ACK_OFFSET_READY: u32 = u32::MAX;

/// Command return codes, following the errno-style negative convention
/// used by firmware peers. `0` is success.
pub mod return_code {
    /// Command completed successfully.
    pub const OK: i16 = 0;
    /// The referenced record does not exist.
    pub const NOT_FOUND: i16 = -2;
    /// Command exists but the caller's authentication level is too low.
    pub const ACCESS_DENIED: i16 = -13;
    /// Malformed request parameters.
    pub const INVALID_ARGUMENT: i16 = -22;
    /// Server resources exhausted.
    pub const NO_MEMORY: i16 = -12;
    /// A bulk-data wait timed out mid-command.
    pub const TIMEOUT: i16 = -116;
    /// No handler is registered for the command id.
    pub const UNSUPPORTED: i16 = -134;
}

/// Errors from envelope parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The body is shorter than the fixed header.
    #[error("envelope too short: expected {expected}, got {actual}")]
    TooShort {
        /// Minimum expected byte count.
        expected: usize,
        /// Actual byte count received.
        actual: usize,
    },
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), EnvelopeError> {
    if buf.len() < expected {
        return Err(EnvelopeError::TooShort {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Header of an RPC command request packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Process-unique id multiplexing concurrent requests.
    pub request_id: u32,
    /// Command to execute.
    pub command_id: u16,
}

impl RequestHeader {
    /// Serialize the header followed by `params`.
    #[must_use]
    pub fn encode(&self, params: &[u8]) -> Vec<u8> {
        let mut v = Vec::with_capacity(REQUEST_HEADER_LEN + params.len());
        v.extend_from_slice(&self.request_id.to_le_bytes());
        v.extend_from_slice(&self.command_id.to_le_bytes());
        v.extend_from_slice(params);
        v
    }

    /// Parse a request body into its header and parameter bytes.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::TooShort`] when the fixed header is truncated.
    pub fn parse(buf: &[u8]) -> Result<(Self, &[u8]), EnvelopeError> {
        check_len(buf, REQUEST_HEADER_LEN)?;
        Ok((
            Self {
                request_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
                command_id: u16::from_le_bytes([buf[4], buf[5]]),
            },
            &buf[REQUEST_HEADER_LEN..],
        ))
    }
}

/// Header of an RPC command response packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Request id this response completes.
    pub request_id: u32,
    /// Command that was executed.
    pub command_id: u16,
    /// Command result; negative values carry errno-style failures.
    pub return_code: i16,
}

impl ResponseHeader {
    /// Serialize the header followed by `params`.
    #[must_use]
    pub fn encode(&self, params: &[u8]) -> Vec<u8> {
        let mut v = Vec::with_capacity(RESPONSE_HEADER_LEN + params.len());
        v.extend_from_slice(&self.request_id.to_le_bytes());
        v.extend_from_slice(&self.command_id.to_le_bytes());
        v.extend_from_slice(&self.return_code.to_le_bytes());
        v.extend_from_slice(params);
        v
    }

    /// Parse a response body into its header and parameter bytes.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::TooShort`] when the fixed header is truncated.
    pub fn parse(buf: &[u8]) -> Result<(Self, &[u8]), EnvelopeError> {
        check_len(buf, RESPONSE_HEADER_LEN)?;
        Ok((
            Self {
                request_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
                command_id: u16::from_le_bytes([buf[4], buf[5]]),
                return_code: i16::from_le_bytes([buf[6], buf[7]]),
            },
            &buf[RESPONSE_HEADER_LEN..],
        ))
    }
}

/// Header of an RPC bulk data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Request id this data belongs to.
    pub request_id: u32,
    /// Byte offset of this payload within the overall transfer.
    pub offset: u32,
}

impl DataHeader {
    /// Serialize the header followed by `payload`.
    #[must_use]
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut v = Vec::with_capacity(DATA_HEADER_LEN + payload.len());
        v.extend_from_slice(&self.request_id.to_le_bytes());
        v.extend_from_slice(&self.offset.to_le_bytes());
        v.extend_from_slice(payload);
        v
    }

    /// Parse a data body into its header and payload bytes.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::TooShort`] when the fixed header is truncated.
    pub fn parse(buf: &[u8]) -> Result<(Self, &[u8]), EnvelopeError> {
        check_len(buf, DATA_HEADER_LEN)?;
        Ok((
            Self {
                request_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
                offset: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            },
            &buf[DATA_HEADER_LEN..],
        ))
    }
}

/// Acknowledgement of received data frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAck {
    /// Request id being acknowledged.
    pub request_id: u32,
    /// Highest data offset acknowledged, or [`ACK_OFFSET_READY`] for the
    /// initial ready signal.
    pub offset: u32,
    /// Acknowledgement cadence the server is operating with.
    pub ack_period: u8,
}

impl DataAck {
    /// Serialize the acknowledgement body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(DATA_ACK_LEN);
        v.extend_from_slice(&self.request_id.to_le_bytes());
        v.extend_from_slice(&self.offset.to_le_bytes());
        v.push(self.ack_period);
        v
    }

    /// Parse an acknowledgement body.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::TooShort`] when the body is truncated.
    pub fn parse(buf: &[u8]) -> Result<Self, EnvelopeError> {
        check_len(buf, DATA_ACK_LEN)?;
        Ok(Self {
            request_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            offset: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ack_period: buf[8],
        })
    }

    /// `true` when this is the initial ready-to-receive signal.
    #[must_use]
    pub fn is_ready_signal(&self) -> bool {
        self.offset == ACK_OFFSET_READY
    }
}
