//! TDF-to-ePacket logger.
//!
//! Buffers TDF entries per interface and ships the accumulated buffer as a
//! single ePacket when it fills, when an append no longer fits, or on an
//! explicit flush. A failed flush preserves the buffer for retry.

use crate::error::NodeError;
use crate::interface::{Interface, InterfaceAddress, TxPacket};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tela_wire::epoch::EpochTime;
use tela_wire::tdf::{TdfBuffer, TdfError, TdfFormat};
use tela_wire::types::packet_type;
use tela_wire::Auth;
use tokio::sync::Mutex;
use tracing::debug;

/// Auto-flush margin: when fewer than this many bytes remain (roughly one
/// minimum-size entry), the next log flushes first.
pub const FLUSH_MARGIN: usize = 20;

/// Time allowed for a flush to claim a transmit buffer.
const FLUSH_ALLOC_TIMEOUT: Duration = Duration::from_secs(5);

struct LoggerState {
    buf: TdfBuffer,
    remote_id: Option<u64>,
}

/// A TDF logger bound to one interface.
pub struct TdfLogger {
    interface: Arc<Interface>,
    auth: Auth,
    remote_capable: bool,
    state: Mutex<LoggerState>,
}

impl TdfLogger {
    /// Create a logger shipping local telemetry on `interface`.
    #[must_use]
    pub fn new(interface: Arc<Interface>, auth: Auth) -> Arc<Self> {
        Self::build(interface, auth, false)
    }

    /// Create a logger shipping telemetry on behalf of remote devices;
    /// flushed buffers carry the remote id and the remote packet type.
    #[must_use]
    pub fn new_remote(interface: Arc<Interface>, auth: Auth) -> Arc<Self> {
        Self::build(interface, auth, true)
    }

    fn build(interface: Arc<Interface>, auth: Auth, remote_capable: bool) -> Arc<Self> {
        let mut capacity = interface.config().max_payload();
        if remote_capable {
            capacity = capacity.saturating_sub(std::mem::size_of::<u64>());
        }
        Arc::new(Self {
            interface,
            auth,
            remote_capable,
            state: Mutex::new(LoggerState {
                buf: TdfBuffer::new(capacity),
                remote_id: None,
            }),
        })
    }

    /// Log a single sample.
    ///
    /// # Errors
    ///
    /// See [`TdfLogger::log_core`].
    pub async fn log(&self, id: u16, time: EpochTime, data: &[u8]) -> Result<(), NodeError> {
        let len = u8::try_from(data.len()).map_err(|_| NodeError::InvalidArgument)?;
        self.log_core(id, len, 1, time, 0, data, TdfFormat::Single)
            .await
    }

    /// Log `num` samples as a time array.
    ///
    /// # Errors
    ///
    /// See [`TdfLogger::log_core`].
    pub async fn log_array(
        &self,
        id: u16,
        len: u8,
        num: u8,
        time: EpochTime,
        period: u32,
        data: &[u8],
    ) -> Result<(), NodeError> {
        let format = if num > 1 {
            TdfFormat::TimeArray
        } else {
            TdfFormat::Single
        };
        self.log_core(id, len, num, time, period, data, format).await
    }

    /// Log samples with an explicit format, flushing as needed.
    ///
    /// Samples that do not fit in the current buffer trigger a flush and a
    /// retry; an entry that can never fit is rejected.
    ///
    /// # Errors
    ///
    /// Codec errors propagate as [`NodeError::Tdf`]; flush failures
    /// propagate from [`TdfLogger::flush`] with the buffer preserved.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_core(
        &self,
        id: u16,
        len: u8,
        num: u8,
        time: EpochTime,
        period: u32,
        data: &[u8],
        format: TdfFormat,
    ) -> Result<(), NodeError> {
        let mut state = self.state.lock().await;

        // Within one minimum entry of the block limit: start fresh.
        if state.buf.remaining() <= FLUSH_MARGIN && !state.buf.is_empty() {
            self.flush_locked(&mut state).await?;
        }

        let mut remaining = num;
        let mut time = time;
        let mut data = data;
        while remaining > 0 {
            match state
                .buf
                .add_core(id, len, remaining, time, period, data, format)
            {
                Ok(written) => {
                    #[allow(clippy::cast_possible_truncation)]
                    let written = written as u8;
                    remaining -= written;
                    if remaining == 0 {
                        break;
                    }
                    if matches!(format, TdfFormat::DiffPrecomputed(_)) {
                        // Precomputed payloads cannot be re-sliced sample
                        // by sample; accept the clamped write.
                        break;
                    }
                    // Partial write: make room and continue with the rest.
                    data = &data[usize::from(written) * usize::from(len)..];
                    if time != 0 {
                        time += u64::from(written) * u64::from(period);
                    }
                    self.flush_locked(&mut state).await?;
                }
                Err(TdfError::BufferFull) if !state.buf.is_empty() => {
                    self.flush_locked(&mut state).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Ship any pending entries as one ePacket and reset the buffer.
    ///
    /// # Errors
    ///
    /// [`NodeError::NoCapacity`] when no transmit buffer became available;
    /// the TDF buffer is left intact for retry.
    pub async fn flush(&self) -> Result<(), NodeError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    async fn flush_locked(&self, state: &mut LoggerState) -> Result<(), NodeError> {
        if state.buf.is_empty() {
            return Ok(());
        }
        let mut pkt: TxPacket = self
            .interface
            .alloc_tx(Some(FLUSH_ALLOC_TIMEOUT))
            .await?;
        let ptype = if state.remote_id.is_some() {
            packet_type::TDF_REMOTE
        } else {
            packet_type::TDF
        };
        pkt.set_metadata(self.auth, 0, ptype, InterfaceAddress::Broadcast);
        if let Some(remote_id) = state.remote_id {
            pkt.write(&remote_id.to_le_bytes())?;
        }
        pkt.write(state.buf.as_bytes())?;
        self.interface.queue(pkt)?;
        debug!(
            interface = self.interface.config().name,
            bytes = state.buf.len(),
            "tdf buffer flushed"
        );
        state.buf.reset();
        Ok(())
    }

    /// Bytes of TDF data pending in the current block.
    pub async fn bytes_pending(&self) -> usize {
        self.state.lock().await.buf.len()
    }

    /// Bytes that can still be logged before the block flushes.
    pub async fn bytes_remaining(&self) -> usize {
        self.state
            .lock()
            .await
            .buf
            .remaining()
            .saturating_sub(FLUSH_MARGIN)
    }

    /// Set the remote device this logger records for.
    ///
    /// Pending data for a different remote is flushed first.
    ///
    /// # Errors
    ///
    /// [`NodeError::InvalidArgument`] when the logger was not created with
    /// [`TdfLogger::new_remote`]; flush errors propagate.
    pub async fn set_remote_id(&self, remote_id: u64) -> Result<(), NodeError> {
        if !self.remote_capable {
            return Err(NodeError::InvalidArgument);
        }
        let mut state = self.state.lock().await;
        if state.remote_id != Some(remote_id) && !state.buf.is_empty() {
            self.flush_locked(&mut state).await?;
        }
        state.remote_id = Some(remote_id);
        Ok(())
    }
}

impl std::fmt::Debug for TdfLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TdfLogger")
            .field("interface", &self.interface.config().name)
            .finish_non_exhaustive()
    }
}

/// Loggers addressed as a bitmask, one bit per interface.
#[derive(Debug, Default)]
pub struct TdfLoggerSet {
    loggers: HashMap<u8, Arc<TdfLogger>>,
}

impl TdfLoggerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a logger under the mask bit of its interface.
    pub fn attach(&mut self, logger: Arc<TdfLogger>) {
        let bit = logger.interface.config().id.mask_bit();
        self.loggers.insert(bit, logger);
    }

    /// Log a single sample to every logger selected by `mask`.
    ///
    /// # Errors
    ///
    /// The last error from any selected logger; other loggers still run.
    pub async fn log(
        &self,
        mask: u8,
        id: u16,
        time: EpochTime,
        data: &[u8],
    ) -> Result<(), NodeError> {
        let mut result = Ok(());
        for (bit, logger) in &self.loggers {
            if mask & bit != 0 {
                if let Err(err) = logger.log(id, time, data).await {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Log a time array to every logger selected by `mask`.
    ///
    /// # Errors
    ///
    /// The last error from any selected logger; other loggers still run.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_array(
        &self,
        mask: u8,
        id: u16,
        len: u8,
        num: u8,
        time: EpochTime,
        period: u32,
        data: &[u8],
    ) -> Result<(), NodeError> {
        let mut result = Ok(());
        for (bit, logger) in &self.loggers {
            if mask & bit != 0 {
                if let Err(err) = logger.log_array(id, len, num, time, period, data).await {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Flush every logger selected by `mask`.
    ///
    /// # Errors
    ///
    /// The last error from any selected logger; other loggers still run.
    pub async fn flush(&self, mask: u8) -> Result<(), NodeError> {
        let mut result = Ok(());
        for (bit, logger) in &self.loggers {
            if mask & bit != 0 {
                if let Err(err) = logger.flush().await {
                    result = Err(err);
                }
            }
        }
        result
    }
}
