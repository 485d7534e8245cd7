//! RPC client: in-flight request tracking over one interface.

use crate::error::NodeError;
use crate::interface::{Interface, InterfaceAddress};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tela_wire::rpc::{DataAck, DataHeader, RequestHeader, ResponseHeader, DATA_HEADER_LEN};
use tela_wire::types::packet_type;
use tela_wire::Auth;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Maximum concurrent in-flight requests per client.
pub const MAX_IN_FLIGHT: usize = 4;

/// A completed RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    /// Response header with the command's return code.
    pub header: ResponseHeader,
    /// Response parameter bytes.
    pub params: Vec<u8>,
}

struct Slot {
    request_id: u32,
    command_id: u16,
    response_timeout: Duration,
    deadline: Mutex<Instant>,
    rsp_tx: Mutex<Option<oneshot::Sender<Option<RpcResponse>>>>,
    ack_notify: Notify,
    credits: Semaphore,
    done: Notify,
    _permit: OwnedSemaphorePermit,
}

struct ClientInner {
    interface: Arc<Interface>,
    dest: InterfaceAddress,
    slots: Mutex<HashMap<u32, Arc<Slot>>>,
    slot_sem: Arc<Semaphore>,
    next_request_id: AtomicU32,
}

impl ClientInner {
    fn find_slot(&self, request_id: u32) -> Option<Arc<Slot>> {
        self.slots
            .lock()
            .expect("not poisoned")
            .get(&request_id)
            .cloned()
    }

    /// Complete a slot exactly once: whoever takes the sender delivers.
    fn complete(&self, request_id: u32, response: Option<RpcResponse>) {
        let slot = {
            let mut slots = self.slots.lock().expect("not poisoned");
            slots.remove(&request_id)
        };
        let Some(slot) = slot else {
            return;
        };
        if let Some(tx) = slot.rsp_tx.lock().expect("not poisoned").take() {
            let _ = tx.send(response);
        }
        slot.done.notify_waiters();
        // Dropping the slot releases its in-flight permit.
    }
}

/// RPC client bound to one interface and destination.
///
/// Cloning shares the in-flight table.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

/// Handle to a queued command awaiting its response.
#[derive(Debug)]
pub struct PendingCommand {
    /// Request id assigned to the command.
    pub request_id: u32,
    rx: oneshot::Receiver<Option<RpcResponse>>,
}

impl PendingCommand {
    /// Wait for the response. `None` means the response timed out or the
    /// client was cleaned up.
    pub async fn response(self) -> Option<RpcResponse> {
        self.rx.await.unwrap_or(None)
    }
}

/// Credit pacing for [`RpcClient::data_queue_auto_load`].
#[derive(Debug, Clone, Copy)]
pub struct AutoLoadParams {
    /// Server acknowledgement cadence: frames per acknowledgement.
    pub ack_period: u8,
    /// Unacknowledged batches allowed in flight.
    pub pipelining: u8,
    /// Wait limit for a transmit credit before giving up.
    pub frame_timeout: Duration,
}

impl Default for AutoLoadParams {
    fn default() -> Self {
        Self {
            ack_period: 4,
            pipelining: 1,
            frame_timeout: Duration::from_secs(2),
        }
    }
}

impl RpcClient {
    /// Create a client sending commands to `dest` on `interface`.
    #[must_use]
    pub fn new(interface: Arc<Interface>, dest: InterfaceAddress) -> Self {
        let mut rx = interface.register_listener();
        let inner = Arc::new(ClientInner {
            interface,
            dest,
            slots: Mutex::new(HashMap::new()),
            slot_sem: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
            next_request_id: AtomicU32::new(rand::random::<u32>()),
        });

        let listener = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(pkt) = rx.recv().await {
                match pkt.meta.packet_type {
                    packet_type::RPC_DATA_ACK => {
                        let Ok(ack) = DataAck::parse(&pkt.payload) else {
                            continue;
                        };
                        let Some(slot) = listener.find_slot(ack.request_id) else {
                            warn!(request_id = ack.request_id, "ack for unknown request");
                            continue;
                        };
                        debug!(request_id = ack.request_id, offset = ack.offset, "ack received");
                        // Each acknowledgement extends the response window
                        // and grants another batch of transmit credits.
                        *slot.deadline.lock().expect("not poisoned") =
                            Instant::now() + slot.response_timeout;
                        slot.credits
                            .add_permits(usize::from(ack.ack_period.max(1)));
                        slot.ack_notify.notify_one();
                    }
                    packet_type::RPC_RSP => {
                        let Ok((header, params)) = ResponseHeader::parse(&pkt.payload) else {
                            continue;
                        };
                        let Some(slot) = listener.find_slot(header.request_id) else {
                            warn!(
                                request_id = header.request_id,
                                command_id = header.command_id,
                                "response for unknown request"
                            );
                            continue;
                        };
                        if header.command_id != slot.command_id {
                            warn!(
                                got = header.command_id,
                                expected = slot.command_id,
                                "mismatched command id in response"
                            );
                            continue;
                        }
                        debug!(request_id = header.request_id, "finalising request");
                        listener.complete(
                            header.request_id,
                            Some(RpcResponse {
                                header,
                                params: params.to_vec(),
                            }),
                        );
                    }
                    _ => {}
                }
            }
        });

        Self { inner }
    }

    fn next_request_id(&self) -> u32 {
        loop {
            let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Queue a command for execution on the remote peer.
    ///
    /// Blocks up to `ctx_timeout` for a free in-flight slot. The returned
    /// handle resolves with the response, or `None` once `response_timeout`
    /// elapses without one (each data acknowledgement re-arms the timer).
    ///
    /// # Errors
    ///
    /// * [`NodeError::InvalidArgument`]: zero response timeout.
    /// * [`NodeError::NoCapacity`]: no slot freed within `ctx_timeout`.
    pub async fn command_queue(
        &self,
        command_id: u16,
        params: &[u8],
        ctx_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<PendingCommand, NodeError> {
        if response_timeout.is_zero() {
            return Err(NodeError::InvalidArgument);
        }
        let permit = tokio::time::timeout(
            ctx_timeout,
            Arc::clone(&self.inner.slot_sem).acquire_owned(),
        )
        .await
        .map_err(|_| NodeError::NoCapacity("rpc command contexts"))?
        .map_err(|_| NodeError::InterfaceClosed)?;

        let request_id = self.next_request_id();
        debug!(command_id, request_id, "queueing command");

        let mut pkt = self.inner.interface.alloc_tx(None).await?;
        pkt.set_metadata(Auth::Network, 0, packet_type::RPC_CMD, self.inner.dest);
        let header = RequestHeader {
            request_id,
            command_id,
        };
        pkt.write(&header.encode(params))?;

        let (rsp_tx, rsp_rx) = oneshot::channel();
        let slot = Arc::new(Slot {
            request_id,
            command_id,
            response_timeout,
            deadline: Mutex::new(Instant::now() + response_timeout),
            rsp_tx: Mutex::new(Some(rsp_tx)),
            ack_notify: Notify::new(),
            credits: Semaphore::new(0),
            done: Notify::new(),
            _permit: permit,
        });
        self.inner
            .slots
            .lock()
            .expect("not poisoned")
            .insert(request_id, Arc::clone(&slot));

        // Response timeout watcher; acknowledgements push the deadline out.
        let watcher = Arc::clone(&self.inner);
        let watched = Arc::clone(&slot);
        tokio::spawn(async move {
            loop {
                let deadline = *watched.deadline.lock().expect("not poisoned");
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {
                        let current = *watched.deadline.lock().expect("not poisoned");
                        if Instant::now() >= current {
                            warn!(request_id = watched.request_id, "request timed out");
                            watcher.complete(watched.request_id, None);
                            break;
                        }
                    }
                    () = watched.done.notified() => break,
                }
            }
        });

        self.inner.interface.queue(pkt)?;
        Ok(PendingCommand {
            request_id,
            rx: rsp_rx,
        })
    }

    /// Run a command and wait for its response.
    ///
    /// # Errors
    ///
    /// Queue errors propagate; a missing response is
    /// [`NodeError::Timeout`].
    pub async fn command_sync(
        &self,
        command_id: u16,
        params: &[u8],
        ctx_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<RpcResponse, NodeError> {
        let pending = self
            .command_queue(command_id, params, ctx_timeout, response_timeout)
            .await?;
        pending.response().await.ok_or(NodeError::Timeout)
    }

    /// Wait for the next data acknowledgement on an in-flight request.
    ///
    /// # Errors
    ///
    /// [`NodeError::NoSuchEntry`] for an unknown request id,
    /// [`NodeError::Timeout`] when no acknowledgement arrives in time.
    pub async fn ack_wait(&self, request_id: u32, timeout: Duration) -> Result<(), NodeError> {
        let slot = self
            .inner
            .find_slot(request_id)
            .ok_or(NodeError::NoSuchEntry)?;
        tokio::time::timeout(timeout, slot.ack_notify.notified())
            .await
            .map_err(|_| NodeError::Timeout)
    }

    /// Transmit one bulk data frame for an in-flight request.
    ///
    /// The caller chunks data to the interface MTU; each call is one
    /// ePacket.
    ///
    /// # Errors
    ///
    /// [`NodeError::InvalidArgument`] for an unknown request id; transmit
    /// errors propagate.
    pub async fn data_queue(
        &self,
        request_id: u32,
        offset: u32,
        payload: &[u8],
    ) -> Result<(), NodeError> {
        if self.inner.find_slot(request_id).is_none() {
            warn!(request_id, "data for unknown request");
            return Err(NodeError::InvalidArgument);
        }
        let mut pkt = self.inner.interface.alloc_tx(None).await?;
        pkt.set_metadata(Auth::Network, 0, packet_type::RPC_DATA, self.inner.dest);
        let header = DataHeader { request_id, offset };
        pkt.write(&header.encode(payload))?;
        self.inner.interface.queue(pkt)
    }

    /// Drive [`RpcClient::data_queue`] from a pull callback, observing the
    /// server's acknowledgement cadence.
    ///
    /// `loader(offset, max_len)` returns the next chunk (empty to stop
    /// early). Transmit credits are granted by received acknowledgements:
    /// the initial ready signal funds the first batch, every further
    /// acknowledgement funds the next, and `pipelining` batches may be
    /// outstanding at once. Returns the number of bytes transmitted.
    ///
    /// # Errors
    ///
    /// [`NodeError::Timeout`] when no credit arrives within
    /// `params.frame_timeout`; transmit errors propagate.
    pub async fn data_queue_auto_load(
        &self,
        request_id: u32,
        total_len: u32,
        mut loader: impl FnMut(u32, usize) -> Vec<u8>,
        params: AutoLoadParams,
    ) -> Result<u32, NodeError> {
        let slot = self
            .inner
            .find_slot(request_id)
            .ok_or(NodeError::InvalidArgument)?;
        // Keep every non-final offset word aligned for the server's
        // aligned pull path.
        let chunk_len = self
            .inner
            .interface
            .config()
            .max_payload()
            .saturating_sub(DATA_HEADER_LEN)
            & !3;
        if chunk_len == 0 {
            return Err(NodeError::InvalidArgument);
        }

        // Extra pipelining beyond the first batch is self-funded; the
        // first batch waits for the server's ready signal.
        let extra = usize::from(params.pipelining.saturating_sub(1))
            * usize::from(params.ack_period.max(1));
        slot.credits.add_permits(extra);

        let mut offset = 0u32;
        while offset < total_len {
            let credit = tokio::time::timeout(params.frame_timeout, slot.credits.acquire())
                .await
                .map_err(|_| NodeError::Timeout)?
                .map_err(|_| NodeError::InterfaceClosed)?;
            credit.forget();

            let want = chunk_len.min((total_len - offset) as usize);
            let chunk = loader(offset, want);
            if chunk.is_empty() {
                break;
            }
            self.data_queue(request_id, offset, &chunk).await?;
            #[allow(clippy::cast_possible_truncation)]
            {
                offset += chunk.len() as u32;
            }
        }
        Ok(offset)
    }

    /// Cancel all in-flight requests, completing each with `None`.
    pub fn cleanup(&self) {
        let ids: Vec<u32> = self
            .inner
            .slots
            .lock()
            .expect("not poisoned")
            .keys()
            .copied()
            .collect();
        for request_id in ids {
            debug!(request_id, "detaching request");
            self.inner.complete(request_id, None);
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("interface", &self.inner.interface.config().name)
            .finish_non_exhaustive()
    }
}
