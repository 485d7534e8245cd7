//! UDP datagram backend.
//!
//! One frame per datagram with the unversioned layout; the datagram
//! boundary provides framing, so no link prefix is required.

use crate::interface::{Interface, InterfaceAddress, InterfaceConfig, NodeCore, OutFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Spawn a UDP interface on a bound socket.
///
/// `default_peer` is the destination used for packets addressed to
/// [`InterfaceAddress::Broadcast`]; without one, such packets are dropped.
#[must_use]
pub fn spawn(
    config: InterfaceConfig,
    core: Arc<NodeCore>,
    socket: UdpSocket,
    default_peer: Option<SocketAddr>,
) -> Arc<Interface> {
    let (backend_tx, mut backend_rx) = mpsc::channel::<OutFrame>(config.tx_pool.max(1));
    let max_packet = config.max_packet;
    let iface = Interface::spawn(config, core, backend_tx);
    let socket = Arc::new(socket);

    let tx_socket = Arc::clone(&socket);
    tokio::spawn(async move {
        while let Some(out) = backend_rx.recv().await {
            let dest = match out.dest {
                InterfaceAddress::Socket(addr) => addr,
                InterfaceAddress::Broadcast => match default_peer {
                    Some(addr) => addr,
                    None => {
                        warn!("udp packet with no destination dropped");
                        continue;
                    }
                },
                InterfaceAddress::Raw(_) => {
                    warn!("udp packet with non-socket destination dropped");
                    continue;
                }
            };
            if let Err(err) = tx_socket.send_to(&out.bytes, dest).await {
                warn!(%err, %dest, "udp send failed");
            }
        }
    });

    let rx_iface = Arc::clone(&iface);
    tokio::spawn(async move {
        let mut buf = vec![0u8; max_packet.max(1500)];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, peer)) => {
                    rx_iface
                        .handle_raw_rx(buf[..len].to_vec(), 0, InterfaceAddress::Socket(peer))
                        .await;
                }
                Err(err) => {
                    debug!(%err, "udp receive failed");
                    break;
                }
            }
        }
    });

    iface
}
