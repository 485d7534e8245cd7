//! RPC server: command dispatch and pipelined bulk-data reception.

use crate::error::NodeError;
use crate::interface::{Interface, InterfaceAddress, RpcSink, RxPacket};
use crate::kv::KvStore;
use crate::watchdog::WatchdogChannel;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tela_wire::rpc::{return_code, DataAck, DataHeader, RequestHeader, ResponseHeader};
use tela_wire::types::packet_type;
use tela_wire::Auth;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Command ids at or above this value route through the user dispatch
/// hook instead of the builtin registry.
pub const USER_COMMAND_BASE: u16 = 0x8000;

/// Depth of each per-request data channel.
const DATA_ROUTE_DEPTH: usize = 16;

/// Handler outcome: `Some((return_code, response params))`, or `None` when
/// the handler already sent an early response.
pub type HandlerResult = Option<(i16, Vec<u8>)>;

/// Boxed future returned by a command handler.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;

/// A registered command handler.
pub type Handler = Arc<dyn for<'a> Fn(&'a mut RequestCtx) -> HandlerFuture<'a> + Send + Sync>;

type UserDispatch = Arc<dyn Fn(u16) -> Option<CommandSpec> + Send + Sync>;

/// A command registration: minimum authentication level plus handler.
#[derive(Clone)]
pub struct CommandSpec {
    /// Lowest authentication level allowed to run the command.
    pub min_auth: Auth,
    /// The handler itself.
    pub handler: Handler,
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("min_auth", &self.min_auth)
            .finish_non_exhaustive()
    }
}

/// Server tuning.
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    /// Number of concurrent command-runner tasks.
    pub workers: usize,
    /// Depth of the command and data queues.
    pub queue_depth: usize,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_depth: 32,
        }
    }
}

struct ServerShared {
    interface: Arc<Interface>,
    handlers: Mutex<HashMap<u16, CommandSpec>>,
    user_dispatch: Mutex<Option<UserDispatch>>,
    active: Mutex<HashSet<u32>>,
    data_routes: Mutex<HashMap<u32, mpsc::Sender<Arc<RxPacket>>>>,
    watchdog: Mutex<Option<WatchdogChannel>>,
    kv: Mutex<Option<Arc<KvStore>>>,
}

impl ServerShared {
    fn feed_watchdog(&self) {
        if let Some(channel) = self.watchdog.lock().expect("not poisoned").as_ref() {
            channel.feed();
        }
    }

    async fn send_response(
        &self,
        request_id: u32,
        command_id: u16,
        rc: i16,
        params: &[u8],
        dest: InterfaceAddress,
        auth: Auth,
    ) {
        let Ok(mut pkt) = self.interface.alloc_tx(None).await else {
            warn!(request_id, "no buffer for rpc response");
            return;
        };
        pkt.set_metadata(auth, 0, packet_type::RPC_RSP, dest);
        let header = ResponseHeader {
            request_id,
            command_id,
            return_code: rc,
        };
        if pkt.write(&header.encode(params)).is_err() {
            warn!(request_id, "rpc response too large for interface");
            return;
        }
        let _ = self.interface.queue(pkt);
    }

    async fn send_ack(&self, request_id: u32, offset: u32, ack_period: u8, dest: InterfaceAddress) {
        let Ok(mut pkt) = self.interface.alloc_tx(None).await else {
            warn!(request_id, "no buffer for data ack");
            return;
        };
        pkt.set_metadata(Auth::Network, 0, packet_type::RPC_DATA_ACK, dest);
        let ack = DataAck {
            request_id,
            offset,
            ack_period,
        };
        if pkt.write(&ack.encode()).is_ok() {
            let _ = self.interface.queue(pkt);
        }
    }

    async fn process_command(self: &Arc<Self>, pkt: Arc<RxPacket>) {
        let Ok((header, params)) = RequestHeader::parse(&pkt.payload) else {
            warn!("malformed rpc command dropped");
            return;
        };
        let request_id = header.request_id;
        let command_id = header.command_id;
        let dest = pkt.meta.source;
        let auth = pkt.meta.auth;

        // At most one runner per request id.
        if !self.active.lock().expect("not poisoned").insert(request_id) {
            warn!(request_id, "duplicate command dropped");
            return;
        }

        let spec = {
            let handlers = self.handlers.lock().expect("not poisoned");
            match handlers.get(&command_id) {
                Some(spec) => Some(spec.clone()),
                None if command_id >= USER_COMMAND_BASE => {
                    let dispatch = self.user_dispatch.lock().expect("not poisoned").clone();
                    dispatch.and_then(|dispatch| dispatch(command_id))
                }
                None => None,
            }
        };

        let result = match spec {
            None => {
                debug!(command_id, "unsupported command");
                self.send_response(
                    request_id,
                    command_id,
                    return_code::UNSUPPORTED,
                    &[],
                    dest,
                    auth,
                )
                .await;
                None
            }
            Some(spec) if auth < spec.min_auth => {
                warn!(command_id, ?auth, "command below required auth level");
                self.send_response(
                    request_id,
                    command_id,
                    return_code::ACCESS_DENIED,
                    &[],
                    dest,
                    auth,
                )
                .await;
                None
            }
            Some(spec) => {
                let (route_tx, route_rx) = mpsc::channel(DATA_ROUTE_DEPTH);
                self.data_routes
                    .lock()
                    .expect("not poisoned")
                    .insert(request_id, route_tx);

                let params = params.to_vec();
                let mut ctx = RequestCtx {
                    server: Arc::clone(self),
                    request: Some(pkt),
                    request_id,
                    command_id,
                    auth,
                    dest,
                    params,
                    data_rx: route_rx,
                    ack_counter: 0,
                    early_responded: false,
                };
                debug!(request_id, command_id, "running command");
                self.feed_watchdog();
                let outcome = (spec.handler)(&mut ctx).await;
                let early = ctx.early_responded;
                self.data_routes
                    .lock()
                    .expect("not poisoned")
                    .remove(&request_id);
                match outcome {
                    Some(_) if early => {
                        warn!(command_id, "handler returned a response after early_response");
                        None
                    }
                    other => other,
                }
            }
        };

        if let Some((rc, rsp_params)) = result {
            self.send_response(request_id, command_id, rc, &rsp_params, dest, auth)
                .await;
        }
        self.active.lock().expect("not poisoned").remove(&request_id);
    }
}

/// One received bulk-data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    /// Byte offset of this chunk within the transfer.
    pub offset: u32,
    /// Chunk payload.
    pub payload: Vec<u8>,
}

/// Per-request context passed to command handlers.
pub struct RequestCtx {
    server: Arc<ServerShared>,
    request: Option<Arc<RxPacket>>,
    request_id: u32,
    command_id: u16,
    auth: Auth,
    dest: InterfaceAddress,
    params: Vec<u8>,
    data_rx: mpsc::Receiver<Arc<RxPacket>>,
    ack_counter: u8,
    early_responded: bool,
}

impl RequestCtx {
    /// Request id of this command.
    #[must_use]
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Command id being executed.
    #[must_use]
    pub fn command_id(&self) -> u16 {
        self.command_id
    }

    /// Authentication level of the request.
    #[must_use]
    pub fn auth(&self) -> Auth {
        self.auth
    }

    /// Request parameter bytes (after the request header).
    #[must_use]
    pub fn params(&self) -> &[u8] {
        &self.params
    }

    /// Release the request packet before the handler completes.
    ///
    /// Long-running handlers drop the buffer early so the receive pool
    /// does not starve while they stream data.
    pub fn release_request(&mut self) {
        self.request = None;
    }

    /// Signal the client that the server is ready to receive data.
    pub async fn ack_ready(&self, ack_period: u8) {
        self.server
            .send_ack(
                self.request_id,
                tela_wire::rpc::ACK_OFFSET_READY,
                ack_period,
                self.dest,
            )
            .await;
    }

    /// Acknowledge a received data frame, sending on every `ack_period`-th
    /// call.
    pub async fn ack_data(&mut self, offset: u32, ack_period: u8) {
        if ack_period == 0 {
            return;
        }
        self.ack_counter += 1;
        if self.ack_counter >= ack_period {
            self.ack_counter = 0;
            self.server
                .send_ack(self.request_id, offset, ack_period, self.dest)
                .await;
        }
    }

    /// Acknowledge the final data frame unconditionally.
    pub async fn ack_last(&mut self, offset: u32, ack_period: u8) {
        self.ack_counter = 0;
        self.server
            .send_ack(self.request_id, offset, ack_period, self.dest)
            .await;
    }

    async fn pull_data_inner(
        &mut self,
        expected_offset: u32,
        timeout: Duration,
        aligned: bool,
    ) -> Result<DataChunk, NodeError> {
        let pkt = tokio::time::timeout(timeout, self.data_rx.recv())
            .await
            .map_err(|_| {
                warn!(
                    request_id = self.request_id,
                    expected_offset, "timeout waiting for data"
                );
                NodeError::Timeout
            })?
            .ok_or(NodeError::InterfaceClosed)?;
        let (header, payload) = DataHeader::parse(&pkt.payload)?;
        if aligned && header.offset % 4 != 0 {
            warn!(offset = header.offset, "unaligned data offset");
            return Err(NodeError::InvalidArgument);
        }
        if header.offset != expected_offset {
            // A gap means loss upstream; the caller decides how to recover.
            warn!(
                expected = expected_offset,
                got = header.offset,
                "missed data frames"
            );
        }
        self.server.feed_watchdog();
        Ok(DataChunk {
            offset: header.offset,
            payload: payload.to_vec(),
        })
    }

    /// Wait for the next data frame, expecting word-aligned offsets.
    ///
    /// # Errors
    ///
    /// [`NodeError::Timeout`] when no frame arrives in `timeout`,
    /// [`NodeError::InvalidArgument`] on an unaligned offset.
    pub async fn pull_data(
        &mut self,
        expected_offset: u32,
        timeout: Duration,
    ) -> Result<DataChunk, NodeError> {
        self.pull_data_inner(expected_offset, timeout, true).await
    }

    /// Wait for the next data frame without the alignment requirement.
    ///
    /// # Errors
    ///
    /// [`NodeError::Timeout`] when no frame arrives in `timeout`.
    pub async fn pull_data_unaligned(
        &mut self,
        expected_offset: u32,
        timeout: Duration,
    ) -> Result<DataChunk, NodeError> {
        self.pull_data_inner(expected_offset, timeout, false).await
    }

    /// Transmit a bulk data frame to the client (server-to-client
    /// streaming).
    ///
    /// # Errors
    ///
    /// Transmit errors propagate.
    pub async fn send_data(&self, offset: u32, payload: &[u8]) -> Result<(), NodeError> {
        let mut pkt = self.server.interface.alloc_tx(None).await?;
        pkt.set_metadata(self.auth, 0, packet_type::RPC_DATA, self.dest);
        let header = DataHeader {
            request_id: self.request_id,
            offset,
        };
        pkt.write(&header.encode(payload))?;
        self.server.interface.queue(pkt)
    }

    /// Largest `send_data` payload the interface can carry.
    #[must_use]
    pub fn max_data_payload(&self) -> usize {
        self.server
            .interface
            .config()
            .max_payload()
            .saturating_sub(tela_wire::rpc::DATA_HEADER_LEN)
    }

    /// Send the response now and keep working; the handler must return
    /// `None` afterwards.
    pub async fn early_response(&mut self, rc: i16, params: &[u8]) {
        self.early_responded = true;
        self.server
            .send_response(self.request_id, self.command_id, rc, params, self.dest, self.auth)
            .await;
    }

    /// Feed the server watchdog from a long-running handler.
    pub fn watchdog_feed(&self) {
        self.server.feed_watchdog();
    }

    /// The key-value store attached to the server, if any.
    #[must_use]
    pub fn kv(&self) -> Option<Arc<KvStore>> {
        self.server.kv.lock().expect("not poisoned").clone()
    }
}

impl std::fmt::Debug for RequestCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCtx")
            .field("request_id", &self.request_id)
            .field("command_id", &self.command_id)
            .finish_non_exhaustive()
    }
}

/// RPC server bound to one interface.
#[derive(Clone)]
pub struct RpcServer {
    shared: Arc<ServerShared>,
}

impl RpcServer {
    /// Create the server, attach its queues to the interface, and spawn
    /// the data pump and worker pool.
    #[must_use]
    pub fn start(interface: Arc<Interface>, config: RpcServerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Arc<RxPacket>>(config.queue_depth.max(1));
        let (data_tx, mut data_rx) = mpsc::channel::<Arc<RxPacket>>(config.queue_depth.max(1));
        interface.set_rpc_sink(RpcSink {
            commands: cmd_tx,
            data: data_tx,
        });

        let shared = Arc::new(ServerShared {
            interface,
            handlers: Mutex::new(HashMap::new()),
            user_dispatch: Mutex::new(None),
            active: Mutex::new(HashSet::new()),
            data_routes: Mutex::new(HashMap::new()),
            watchdog: Mutex::new(None),
            kv: Mutex::new(None),
        });

        // Data pump: route frames to the command that owns the request id.
        let pump = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(pkt) = data_rx.recv().await {
                let Ok((header, _)) = DataHeader::parse(&pkt.payload) else {
                    warn!("malformed rpc data dropped");
                    continue;
                };
                let route = pump
                    .data_routes
                    .lock()
                    .expect("not poisoned")
                    .get(&header.request_id)
                    .cloned();
                match route {
                    Some(route) => {
                        if route.send(pkt).await.is_err() {
                            debug!(request_id = header.request_id, "data route closed");
                        }
                    }
                    None => {
                        warn!(
                            request_id = header.request_id,
                            offset = header.offset,
                            "dropping data with no active command"
                        );
                    }
                }
            }
        });

        // Worker pool pulling from the shared command queue.
        let cmd_rx = Arc::new(tokio::sync::Mutex::new(cmd_rx));
        for _ in 0..config.workers.max(1) {
            let worker = Arc::clone(&shared);
            let queue = Arc::clone(&cmd_rx);
            tokio::spawn(async move {
                loop {
                    let pkt = { queue.lock().await.recv().await };
                    match pkt {
                        Some(pkt) => worker.process_command(pkt).await,
                        None => break,
                    }
                }
            });
        }

        Self { shared }
    }

    /// Register a command handler with its minimum authentication level.
    pub fn register(&self, command_id: u16, min_auth: Auth, handler: Handler) {
        self.shared
            .handlers
            .lock()
            .expect("not poisoned")
            .insert(command_id, CommandSpec { min_auth, handler });
    }

    /// Install the dispatch hook for user-defined command ids
    /// (≥ [`USER_COMMAND_BASE`]).
    pub fn set_user_dispatch(
        &self,
        dispatch: impl Fn(u16) -> Option<CommandSpec> + Send + Sync + 'static,
    ) {
        *self.shared.user_dispatch.lock().expect("not poisoned") = Some(Arc::new(dispatch));
    }

    /// Attach a watchdog channel fed on command dispatch and data frames.
    pub fn set_watchdog(&self, channel: WatchdogChannel) {
        *self.shared.watchdog.lock().expect("not poisoned") = Some(channel);
    }

    /// Attach the key-value store used by the built-in kv commands.
    pub fn set_kv_store(&self, kv: Arc<KvStore>) {
        *self.shared.kv.lock().expect("not poisoned") = Some(kv);
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("interface", &self.shared.interface.config().name)
            .finish_non_exhaustive()
    }
}
