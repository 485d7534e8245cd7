//! ePacket interface runtime: transmit pool, receive dispatch, sequence
//! tracking.
//!
//! Each interface owns a bounded transmit pool and a transmit task. Callers
//! allocate a [`TxPacket`] (waiting for a pool slot), write the payload,
//! attach metadata, and queue it; the transmit task resolves the packet key,
//! builds and encrypts the frame, and hands it to the backend. The backend's
//! receive task feeds raw frames into [`Interface::handle_raw_rx`], which
//! validates sequence numbers, decrypts, and dispatches by packet type.

use crate::clock::Clock;
use crate::error::NodeError;
use crate::keys::KeyRegistry;
use crate::ratelimit::RateLimiter;
use crate::stats::{InterfaceStats, StatsSnapshot};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tela_wire::frame::{self, FrameInfo, Framing};
use tela_wire::types::{flags, packet_type, KEY_ID_REQUEST_MAGIC, RATE_LIMIT_REQUEST_MAGIC};
use tela_wire::{Auth, DeviceId, InterfaceId, KeyClass};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Default number of transmit buffers per interface.
pub const DEFAULT_TX_POOL: usize = 8;

/// Depth of the RPC command/data queues fed by the dispatcher.
pub const RPC_QUEUE_DEPTH: usize = 32;

/// Interface-specific destination or source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InterfaceAddress {
    /// No specific peer: broadcast, or the single peer of a
    /// point-to-point link.
    #[default]
    Broadcast,
    /// UDP socket address.
    Socket(SocketAddr),
    /// Opaque link-level address (Bluetooth identity, test fixtures).
    Raw(u64),
}

/// Static configuration of one interface.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Interface identity, also used for key derivation.
    pub id: InterfaceId,
    /// Human-readable name for logs.
    pub name: &'static str,
    /// Frame layout used on this link.
    pub framing: Framing,
    /// Largest complete frame the link can carry.
    pub max_packet: usize,
    /// Number of concurrent transmit buffers.
    pub tx_pool: usize,
}

impl InterfaceConfig {
    /// Configuration for a framed serial link.
    #[must_use]
    pub fn serial() -> Self {
        Self {
            id: InterfaceId::Serial,
            name: "serial",
            framing: Framing::Versioned,
            max_packet: 512,
            tx_pool: DEFAULT_TX_POOL,
        }
    }

    /// Configuration for a UDP link.
    #[must_use]
    pub fn udp() -> Self {
        Self {
            id: InterfaceId::Udp,
            name: "udp",
            framing: Framing::Unversioned,
            max_packet: 1452,
            tx_pool: DEFAULT_TX_POOL,
        }
    }

    /// Configuration for Bluetooth extended advertising.
    #[must_use]
    pub fn bt_adv() -> Self {
        Self {
            id: InterfaceId::BtAdv,
            name: "bt_adv",
            framing: Framing::Unversioned,
            max_packet: 255,
            tx_pool: DEFAULT_TX_POOL,
        }
    }

    /// Configuration for a Bluetooth GATT connection.
    #[must_use]
    pub fn bt_gatt() -> Self {
        Self {
            id: InterfaceId::BtGatt,
            name: "bt_gatt",
            framing: Framing::Versioned,
            max_packet: 498,
            tx_pool: DEFAULT_TX_POOL,
        }
    }

    /// Largest payload a caller can place in one packet.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.max_packet.saturating_sub(self.framing.overhead())
    }
}

/// Shared per-device state every interface needs.
pub struct NodeCore {
    /// This device's 64-bit identity.
    pub device_id: DeviceId,
    /// Time source for GPS timestamps and key rotation.
    pub clock: Arc<dyn Clock>,
    /// Key registry for packet protection.
    pub keys: Arc<KeyRegistry>,
}

impl std::fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCore")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// Metadata attached to a received packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxMetadata {
    /// Device id carried in the packet.
    pub device_id: DeviceId,
    /// Sender's GPS time in whole seconds.
    pub gps_time: u32,
    /// 24-bit key identifier used by the packet.
    pub key_id: u32,
    /// Authentication level after decryption.
    pub auth: Auth,
    /// Payload type.
    pub packet_type: u8,
    /// Packet flags.
    pub flags: u16,
    /// Interface the packet arrived on.
    pub interface_id: InterfaceId,
    /// Link-level source address.
    pub source: InterfaceAddress,
    /// Received signal strength in dBm (0 when the link has none).
    pub rssi: i16,
    /// Sender's sequence number.
    pub sequence: u16,
}

/// A decrypted received packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxPacket {
    /// Decrypted payload bytes.
    pub payload: Vec<u8>,
    /// Receive metadata.
    pub meta: RxMetadata,
}

/// A complete frame handed to the backend for transmission.
#[derive(Debug)]
pub struct OutFrame {
    /// Encrypted frame bytes (without any link prefix).
    pub bytes: Vec<u8>,
    /// Link-level destination.
    pub dest: InterfaceAddress,
}

/// RPC server queues an interface dispatches into.
#[derive(Debug, Clone)]
pub struct RpcSink {
    /// Queue of received RPC command packets.
    pub commands: mpsc::Sender<Arc<RxPacket>>,
    /// Queue of received RPC data packets.
    pub data: mpsc::Sender<Arc<RxPacket>>,
}

/// A transmit buffer claimed from an interface's pool.
///
/// The pool slot is held until the packet has been transmitted (or
/// dropped), backpressuring allocation rather than transmission.
#[derive(Debug)]
pub struct TxPacket {
    payload: Vec<u8>,
    capacity: usize,
    auth: Auth,
    flags: u16,
    packet_type: u8,
    dest: InterfaceAddress,
    done: Option<oneshot::Sender<Result<(), NodeError>>>,
    _permit: OwnedSemaphorePermit,
}

impl TxPacket {
    /// Set transmit metadata: authentication class, flags, payload type,
    /// destination.
    pub fn set_metadata(
        &mut self,
        auth: Auth,
        flags: u16,
        packet_type: u8,
        dest: InterfaceAddress,
    ) {
        self.auth = auth;
        self.flags = flags;
        self.packet_type = packet_type;
        self.dest = dest;
    }

    /// Register for completion notification; the result arrives once the
    /// frame has been handed to the link (or failed before that).
    pub fn completion(&mut self) -> oneshot::Receiver<Result<(), NodeError>> {
        let (tx, rx) = oneshot::channel();
        self.done = Some(tx);
        rx
    }

    /// Append payload bytes.
    ///
    /// # Errors
    ///
    /// [`NodeError::NoCapacity`] when the write would exceed the payload
    /// capacity left by the interface framing.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), NodeError> {
        if self.payload.len() + bytes.len() > self.capacity {
            return Err(NodeError::NoCapacity("tx payload"));
        }
        self.payload.extend_from_slice(bytes);
        Ok(())
    }

    /// Payload capacity of this packet.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// `true` when no payload has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    fn complete(&mut self, result: Result<(), NodeError>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

/// One ePacket interface instance.
pub struct Interface {
    config: InterfaceConfig,
    core: Arc<NodeCore>,
    stats: InterfaceStats,
    tx_sem: Arc<Semaphore>,
    tx_queue: mpsc::Sender<TxPacket>,
    sequence: AtomicU16,
    rx_seen: DashMap<DeviceId, u16>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<Arc<RxPacket>>>>,
    receive_handler: Mutex<Option<mpsc::UnboundedSender<Arc<RxPacket>>>>,
    rpc_sink: Mutex<Option<RpcSink>>,
    key_id_limiter: Mutex<RateLimiter>,
    tx_pause_until: Mutex<Option<tokio::time::Instant>>,
}

impl Interface {
    /// Create the interface and spawn its transmit task.
    ///
    /// `backend_tx` receives complete encrypted frames for the link driver
    /// to ship.
    #[must_use]
    pub fn spawn(
        config: InterfaceConfig,
        core: Arc<NodeCore>,
        backend_tx: mpsc::Sender<OutFrame>,
    ) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::channel::<TxPacket>(config.tx_pool.max(1));
        let iface = Arc::new(Self {
            tx_sem: Arc::new(Semaphore::new(config.tx_pool.max(1))),
            tx_queue: queue_tx,
            sequence: AtomicU16::new(0),
            rx_seen: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            receive_handler: Mutex::new(None),
            rpc_sink: Mutex::new(None),
            key_id_limiter: Mutex::new(RateLimiter::new(1, Duration::from_secs(1))),
            tx_pause_until: Mutex::new(None),
            stats: InterfaceStats::default(),
            config,
            core,
        });

        let worker = Arc::clone(&iface);
        tokio::spawn(async move {
            while let Some(mut pkt) = queue_rx.recv().await {
                worker.wait_tx_pause().await;
                let result = worker.encode_and_send(&pkt, &backend_tx).await;
                match &result {
                    Ok(()) => worker.stats.tx_sent(),
                    Err(err) => {
                        worker.stats.tx_failed();
                        warn!(interface = worker.config.name, %err, "packet transmit failed");
                    }
                }
                pkt.complete(result);
            }
            debug!(interface = worker.config.name, "transmit task stopped");
        });

        iface
    }

    /// Interface configuration.
    #[must_use]
    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    /// Shared node state.
    #[must_use]
    pub fn core(&self) -> &Arc<NodeCore> {
        &self.core
    }

    /// Current packet counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Allocate a transmit buffer, waiting up to `timeout` for a pool slot
    /// (`None` waits indefinitely).
    ///
    /// # Errors
    ///
    /// [`NodeError::NoCapacity`] when the pool is exhausted for the whole
    /// timeout, [`NodeError::InterfaceClosed`] after shutdown.
    pub async fn alloc_tx(&self, timeout: Option<Duration>) -> Result<TxPacket, NodeError> {
        let acquire = Arc::clone(&self.tx_sem).acquire_owned();
        let permit = match timeout {
            None => acquire.await.map_err(|_| NodeError::InterfaceClosed)?,
            Some(duration) => tokio::time::timeout(duration, acquire)
                .await
                .map_err(|_| NodeError::NoCapacity("tx buffers"))?
                .map_err(|_| NodeError::InterfaceClosed)?,
        };
        Ok(self.tx_packet(permit))
    }

    /// Allocate a transmit buffer without waiting.
    ///
    /// # Errors
    ///
    /// [`NodeError::NoCapacity`] when no pool slot is free right now.
    pub fn try_alloc_tx(&self) -> Result<TxPacket, NodeError> {
        let permit = Arc::clone(&self.tx_sem)
            .try_acquire_owned()
            .map_err(|_| NodeError::NoCapacity("tx buffers"))?;
        Ok(self.tx_packet(permit))
    }

    fn tx_packet(&self, permit: OwnedSemaphorePermit) -> TxPacket {
        TxPacket {
            payload: Vec::with_capacity(self.config.max_payload()),
            capacity: self.config.max_payload(),
            auth: Auth::Network,
            flags: 0,
            packet_type: 0,
            dest: InterfaceAddress::Broadcast,
            done: None,
            _permit: permit,
        }
    }

    /// Queue a packet for transmission.
    ///
    /// # Errors
    ///
    /// [`NodeError::InterfaceClosed`] when the transmit task has stopped.
    pub fn queue(&self, pkt: TxPacket) -> Result<(), NodeError> {
        // The queue is as deep as the pool, and every packet holds a pool
        // permit, so the only send failure mode is a closed channel.
        self.tx_queue.try_send(pkt).map_err(|err| match err {
            mpsc::error::TrySendError::Closed(mut pkt)
            | mpsc::error::TrySendError::Full(mut pkt) => {
                pkt.complete(Err(NodeError::InterfaceClosed));
                NodeError::InterfaceClosed
            }
        })
    }

    async fn encode_and_send(
        &self,
        pkt: &TxPacket,
        backend_tx: &mpsc::Sender<OutFrame>,
    ) -> Result<(), NodeError> {
        // Third-party encrypted payloads pass through unmodified.
        if pkt.auth == Auth::RemoteEncrypted {
            return backend_tx
                .send(OutFrame {
                    bytes: pkt.payload.clone(),
                    dest: pkt.dest,
                })
                .await
                .map_err(|_| NodeError::InterfaceClosed);
        }

        let (class, key_identifier, frame_flags) = match pkt.auth {
            Auth::Device => (
                KeyClass::Device,
                self.core.keys.device_key_identifier(),
                pkt.flags | flags::ENCRYPTION_DEVICE,
            ),
            _ => (
                KeyClass::Network,
                self.core.keys.network_key_identifier(),
                pkt.flags & !flags::ENCRYPTION_DEVICE,
            ),
        };

        let now = self.core.clock.epoch_time_now();
        let rotation = tela_wire::epoch::rotation_index(now);
        let key = self
            .core
            .keys
            .get(class, self.config.id, key_identifier, rotation)
            .ok_or(NodeError::NoKey)?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let info = FrameInfo {
            packet_type: pkt.packet_type,
            flags: frame_flags,
            key_id: key_identifier,
            device_id: self.core.device_id,
            gps_time: tela_wire::epoch::seconds(now),
            sequence,
        };
        let bytes = frame::encode(
            self.config.framing,
            &info,
            rand::random::<u16>(),
            key.material(),
            &pkt.payload,
        )?;

        backend_tx
            .send(OutFrame {
                bytes,
                dest: pkt.dest,
            })
            .await
            .map_err(|_| NodeError::InterfaceClosed)
    }

    /// Register a packet listener receiving every decrypted packet.
    ///
    /// Listeners are dropped automatically once their receiver goes away.
    #[must_use]
    pub fn register_listener(&self) -> mpsc::UnboundedReceiver<Arc<RxPacket>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().expect("not poisoned").push(tx);
        rx
    }

    /// Install the application receive handler for packet types the core
    /// does not consume itself. Replaces any previous handler.
    #[must_use]
    pub fn take_receive_handler(&self) -> mpsc::UnboundedReceiver<Arc<RxPacket>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.receive_handler.lock().expect("not poisoned") = Some(tx);
        rx
    }

    /// Attach the RPC server queues.
    pub fn set_rpc_sink(&self, sink: RpcSink) {
        *self.rpc_sink.lock().expect("not poisoned") = Some(sink);
    }

    async fn wait_tx_pause(&self) {
        let until = *self.tx_pause_until.lock().expect("not poisoned");
        if let Some(until) = until {
            if tokio::time::Instant::now() < until {
                tokio::time::sleep_until(until).await;
            }
        }
    }

    /// Clear any transmit pause requested by a peer.
    pub fn rate_limit_reset(&self) {
        *self.tx_pause_until.lock().expect("not poisoned") = None;
    }

    /// Feed a raw received frame into the interface.
    ///
    /// Called by link backends with the frame bytes (link prefix already
    /// stripped), the received signal strength, and the link source
    /// address.
    pub async fn handle_raw_rx(self: &Arc<Self>, bytes: Vec<u8>, rssi: i16, source: InterfaceAddress) {
        // Peer requests a transmit pause while it drains its buffers.
        if bytes.len() == 2 && bytes[0] == RATE_LIMIT_REQUEST_MAGIC {
            let delay = Duration::from_millis(u64::from(bytes[1]));
            debug!(interface = self.config.name, ?delay, "transmit pause requested");
            *self.tx_pause_until.lock().expect("not poisoned") =
                Some(tokio::time::Instant::now() + delay);
            return;
        }

        // Plaintext key-id directory request, answered before any
        // decryption is attempted. Rate limited: this is the one packet an
        // unauthenticated peer can elicit a response with.
        if bytes.len() == 1 && bytes[0] == KEY_ID_REQUEST_MAGIC {
            let allowed = self
                .key_id_limiter
                .lock()
                .expect("not poisoned")
                .check_and_record();
            if !allowed {
                warn!(interface = self.config.name, "dropping excess key-id request");
                return;
            }
            self.send_key_ids(source);
            return;
        }

        let info = match frame::peek(self.config.framing, &bytes) {
            Ok(info) => info,
            Err(err) => {
                self.stats.rx_invalid();
                debug!(interface = self.config.name, %err, "unparseable frame");
                return;
            }
        };

        // Stale or replayed sequence numbers are dropped before paying for
        // authentication.
        if let Some(prev) = self.rx_seen.get(&info.device_id) {
            if info.sequence <= *prev {
                self.stats.rx_sequence_drop();
                debug!(
                    interface = self.config.name,
                    device = info.device_id,
                    sequence = info.sequence,
                    last = *prev,
                    "sequence replay dropped"
                );
                return;
            }
        }

        let (class, auth) = if info.flags & flags::ENCRYPTION_DEVICE != 0 {
            (KeyClass::Device, Auth::Device)
        } else {
            (KeyClass::Network, Auth::Network)
        };
        if class == KeyClass::Device && info.device_id != self.core.device_id {
            // Device-encrypted packets can only be decoded by their target.
            self.stats.rx_auth_failure();
            return;
        }

        let rotation = info.gps_time / tela_wire::types::KEY_ROTATION_PERIOD_SECS as u32;
        let Some(key) = self
            .core
            .keys
            .get(class, self.config.id, info.key_id, rotation)
        else {
            self.stats.rx_auth_failure();
            debug!(
                interface = self.config.name,
                key_id = info.key_id,
                "no key for received packet"
            );
            return;
        };

        let payload = match frame::decrypt(self.config.framing, &bytes, key.material()) {
            Ok(payload) => payload,
            Err(_) => {
                self.stats.rx_auth_failure();
                debug!(interface = self.config.name, "frame authentication failed");
                return;
            }
        };

        self.rx_seen.insert(info.device_id, info.sequence);
        self.stats.rx_received();

        let pkt = Arc::new(RxPacket {
            payload,
            meta: RxMetadata {
                device_id: info.device_id,
                gps_time: info.gps_time,
                key_id: info.key_id,
                auth,
                packet_type: info.packet_type,
                flags: info.flags,
                interface_id: self.config.id,
                source,
                rssi,
                sequence: info.sequence,
            },
        });
        debug!(
            interface = self.config.name,
            packet_type = pkt.meta.packet_type,
            sequence = pkt.meta.sequence,
            len = pkt.payload.len(),
            rssi,
            "packet received"
        );

        // External listeners see every packet; closed receivers unregister.
        self.listeners
            .lock()
            .expect("not poisoned")
            .retain(|listener| listener.send(Arc::clone(&pkt)).is_ok());

        self.dispatch(pkt).await;
    }

    async fn dispatch(self: &Arc<Self>, pkt: Arc<RxPacket>) {
        match pkt.meta.packet_type {
            packet_type::ECHO_REQ => self.send_echo_response(&pkt),
            packet_type::RPC_CMD => {
                let sink = self.rpc_sink.lock().expect("not poisoned").clone();
                if let Some(sink) = sink {
                    if sink.commands.send(pkt).await.is_err() {
                        warn!(interface = self.config.name, "rpc command queue closed");
                    }
                } else {
                    debug!(interface = self.config.name, "rpc command with no server");
                }
            }
            packet_type::RPC_DATA => {
                let sink = self.rpc_sink.lock().expect("not poisoned").clone();
                if let Some(sink) = sink {
                    if sink.data.send(pkt).await.is_err() {
                        warn!(interface = self.config.name, "rpc data queue closed");
                    }
                } else {
                    debug!(interface = self.config.name, "rpc data with no server");
                }
            }
            _ => {
                let handler = self.receive_handler.lock().expect("not poisoned").clone();
                match handler {
                    Some(handler) if handler.send(pkt).is_ok() => {}
                    _ => debug!(interface = self.config.name, "packet with no handler"),
                }
            }
        }
    }

    fn send_echo_response(&self, request: &RxPacket) {
        let Ok(mut rsp) = self.try_alloc_tx() else {
            warn!(interface = self.config.name, "no buffer for echo response");
            return;
        };
        rsp.set_metadata(
            request.meta.auth,
            0,
            packet_type::ECHO_RSP,
            request.meta.source,
        );
        if rsp.write(&request.payload).is_ok() {
            let _ = self.queue(rsp);
        }
    }

    fn send_key_ids(&self, source: InterfaceAddress) {
        let Ok(mut rsp) = self.try_alloc_tx() else {
            warn!(interface = self.config.name, "no buffer for key-id response");
            return;
        };
        let key_id = self.core.keys.device_key_identifier();
        rsp.set_metadata(Auth::Network, 0, packet_type::KEY_IDS, source);
        if rsp.write(&key_id.to_le_bytes()[..3]).is_ok() {
            let _ = self.queue(rsp);
        }
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
