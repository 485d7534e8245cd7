mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tela_node::backends::{serial, udp};
use tela_node::interface::{InterfaceAddress, InterfaceConfig};
use tela_node::rpc::commands::{self, command_id};
use tela_node::rpc::{RpcClient, RpcServer, RpcServerConfig};
use tela_node::kv::KvStore;
use tela_wire::rpc::return_code;
use tela_wire::types::packet_type;
use tela_wire::Auth;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn serial_link_round_trips_packets() {
    init_tracing();
    let (stream_a, stream_b) = tokio::io::duplex(4096);
    let iface_a = serial::spawn(InterfaceConfig::serial(), core(DEVICE_A, 0x0A), stream_a);
    let iface_b = serial::spawn(InterfaceConfig::serial(), core(DEVICE_B, 0x0B), stream_b);
    let mut rx = iface_b.take_receive_handler();

    let mut pkt = iface_a.alloc_tx(None).await.unwrap();
    pkt.set_metadata(
        Auth::Network,
        0,
        packet_type::TDF,
        InterfaceAddress::Broadcast,
    );
    pkt.write(b"over the wire").unwrap();
    iface_a.queue(pkt).unwrap();

    let received = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.payload, b"over the wire");
    assert_eq!(received.meta.device_id, DEVICE_A);
    assert_eq!(received.meta.interface_id, tela_wire::InterfaceId::Serial);
}

#[tokio::test]
async fn serial_rpc_echo() {
    init_tracing();
    let (stream_a, stream_b) = tokio::io::duplex(4096);
    let iface_a = serial::spawn(InterfaceConfig::serial(), core(DEVICE_A, 0x0A), stream_a);
    let iface_b = serial::spawn(InterfaceConfig::serial(), core(DEVICE_B, 0x0B), stream_b);

    let client = RpcClient::new(iface_a, InterfaceAddress::Broadcast);
    let server = RpcServer::start(iface_b, RpcServerConfig::default());
    commands::register_builtin(&server, Arc::new(KvStore::new()));

    let response = client
        .command_sync(
            command_id::ECHO,
            b"serial echo",
            Duration::from_secs(1),
            Duration::from_secs(3),
        )
        .await
        .unwrap();
    assert_eq!(response.header.return_code, return_code::OK);
    assert_eq!(response.params, b"serial echo");
}

#[tokio::test]
async fn udp_link_round_trips_packets() {
    init_tracing();
    let sock_a = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sock_b = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr_a = sock_a.local_addr().unwrap();
    let addr_b = sock_b.local_addr().unwrap();

    let iface_a = udp::spawn(
        InterfaceConfig::udp(),
        core(DEVICE_A, 0x0A),
        sock_a,
        Some(addr_b),
    );
    let iface_b = udp::spawn(
        InterfaceConfig::udp(),
        core(DEVICE_B, 0x0B),
        sock_b,
        Some(addr_a),
    );
    let mut rx = iface_b.take_receive_handler();

    let mut pkt = iface_a.alloc_tx(None).await.unwrap();
    pkt.set_metadata(
        Auth::Network,
        0,
        packet_type::TDF,
        InterfaceAddress::Broadcast,
    );
    pkt.write(b"datagram payload").unwrap();
    iface_a.queue(pkt).unwrap();

    let received = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.payload, b"datagram payload");
    assert_eq!(received.meta.source, InterfaceAddress::Socket(addr_a));

    // Reply to the observed source address.
    let mut rx_a = iface_a.take_receive_handler();
    let mut reply = iface_b.alloc_tx(None).await.unwrap();
    reply.set_metadata(Auth::Network, 0, packet_type::TDF, received.meta.source);
    reply.write(b"reply").unwrap();
    iface_b.queue(reply).unwrap();

    let received = timeout(RECV_TIMEOUT, rx_a.recv()).await.unwrap().unwrap();
    assert_eq!(received.payload, b"reply");
    assert_eq!(received.meta.device_id, DEVICE_B);
}
