//! Framed serial backend.
//!
//! Serial links carry frames as `SYNC_A, SYNC_B, len (u16 LE), frame`.
//! Reception is a byte-at-a-time reassembly state machine that resyncs on
//! garbage and discards oversize frames without losing stream alignment.

use crate::interface::{Interface, InterfaceAddress, InterfaceConfig, NodeCore, OutFrame};
use std::sync::Arc;
use tela_wire::frame::SERIAL_SYNC;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

enum ReassemblyState {
    SyncA,
    SyncB,
    LenLow,
    LenHigh,
    Payload,
    /// Oversize frame: consume and discard the payload to stay aligned.
    Discard,
}

/// Incremental frame reassembler for serial byte streams.
pub struct SerialReassembler {
    max_frame: usize,
    state: ReassemblyState,
    len_low: u8,
    remaining: usize,
    buf: Vec<u8>,
}

impl SerialReassembler {
    /// Create a reassembler rejecting frames larger than `max_frame`.
    #[must_use]
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            state: ReassemblyState::SyncA,
            len_low: 0,
            remaining: 0,
            buf: Vec::new(),
        }
    }

    /// Feed one byte; returns a complete frame when one finishes.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.state {
            ReassemblyState::SyncA => {
                if byte == SERIAL_SYNC[0] {
                    self.state = ReassemblyState::SyncB;
                }
            }
            ReassemblyState::SyncB => {
                self.state = if byte == SERIAL_SYNC[1] {
                    ReassemblyState::LenLow
                } else {
                    ReassemblyState::SyncA
                };
            }
            ReassemblyState::LenLow => {
                self.len_low = byte;
                self.state = ReassemblyState::LenHigh;
            }
            ReassemblyState::LenHigh => {
                let len = usize::from(u16::from_le_bytes([self.len_low, byte]));
                if len == 0 {
                    // Empty frames are invalid; resync.
                    self.state = ReassemblyState::SyncA;
                } else if len > self.max_frame {
                    warn!(len, max = self.max_frame, "oversize serial frame");
                    self.remaining = len;
                    self.state = ReassemblyState::Discard;
                } else {
                    self.remaining = len;
                    self.buf = Vec::with_capacity(len);
                    self.state = ReassemblyState::Payload;
                }
            }
            ReassemblyState::Payload => {
                self.buf.push(byte);
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.state = ReassemblyState::SyncA;
                    return Some(std::mem::take(&mut self.buf));
                }
            }
            ReassemblyState::Discard => {
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.state = ReassemblyState::SyncA;
                }
            }
        }
        None
    }
}

/// Encode the serial link prefix for a frame of `len` bytes.
#[must_use]
pub fn serial_prefix(len: usize) -> [u8; 4] {
    #[allow(clippy::cast_possible_truncation)]
    let len = len as u16;
    let le = len.to_le_bytes();
    [SERIAL_SYNC[0], SERIAL_SYNC[1], le[0], le[1]]
}

/// Spawn a serial interface over an async byte stream.
#[must_use]
pub fn spawn<S>(config: InterfaceConfig, core: Arc<NodeCore>, stream: S) -> Arc<Interface>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (backend_tx, mut backend_rx) = mpsc::channel::<OutFrame>(config.tx_pool.max(1));
    let max_frame = config.max_packet;
    let iface = Interface::spawn(config, core, backend_tx);

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    tokio::spawn(async move {
        while let Some(out) = backend_rx.recv().await {
            let prefix = serial_prefix(out.bytes.len());
            if write_half.write_all(&prefix).await.is_err()
                || write_half.write_all(&out.bytes).await.is_err()
                || write_half.flush().await.is_err()
            {
                debug!("serial write half closed");
                break;
            }
        }
    });

    let rx_iface = Arc::clone(&iface);
    tokio::spawn(async move {
        let mut reassembler = SerialReassembler::new(max_frame);
        let mut chunk = [0u8; 256];
        loop {
            let n = match read_half.read(&mut chunk).await {
                Ok(0) | Err(_) => {
                    debug!("serial read half closed");
                    break;
                }
                Ok(n) => n,
            };
            for &byte in &chunk[..n] {
                if let Some(frame) = reassembler.push(byte) {
                    rx_iface
                        .handle_raw_rx(frame, 0, InterfaceAddress::Broadcast)
                        .await;
                }
            }
        }
    });

    iface
}
