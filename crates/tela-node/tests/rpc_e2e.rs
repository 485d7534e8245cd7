mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tela_node::interface::InterfaceAddress;
use tela_node::kv::KvStore;
use tela_node::rpc::commands::{self, command_id};
use tela_node::rpc::{
    AutoLoadParams, CommandSpec, HandlerFuture, RequestCtx, RpcClient, RpcServer, RpcServerConfig,
};
use tela_node::NodeError;
use tela_wire::rpc::return_code;
use tela_wire::Auth;

const CTX_TIMEOUT: Duration = Duration::from_secs(1);
const RSP_TIMEOUT: Duration = Duration::from_secs(3);

fn rpc_pair() -> (RpcClient, RpcServer, Arc<KvStore>) {
    let pair = linked_pair();
    let client = RpcClient::new(Arc::clone(&pair.a), InterfaceAddress::Broadcast);
    let server = RpcServer::start(Arc::clone(&pair.b), RpcServerConfig::default());
    let kv = Arc::new(KvStore::new());
    commands::register_builtin(&server, Arc::clone(&kv));
    (client, server, kv)
}

#[tokio::test]
async fn echo_command_round_trips() {
    init_tracing();
    let (client, _server, _kv) = rpc_pair();

    let response = client
        .command_sync(
            command_id::ECHO,
            &[0x01, 0x02, 0x03, 0x04],
            CTX_TIMEOUT,
            RSP_TIMEOUT,
        )
        .await
        .unwrap();
    assert_eq!(response.header.return_code, return_code::OK);
    assert_eq!(response.header.command_id, command_id::ECHO);
    assert_eq!(response.params, vec![0x01, 0x02, 0x03, 0x04]);
}

#[tokio::test]
async fn detached_server_times_out_once() {
    init_tracing();
    let pair = linked_pair();
    let client = RpcClient::new(Arc::clone(&pair.a), InterfaceAddress::Broadcast);
    // No server attached on the peer.

    let result = client
        .command_sync(
            command_id::ECHO,
            &[1, 2, 3],
            CTX_TIMEOUT,
            Duration::from_millis(300),
        )
        .await;
    assert!(matches!(result, Err(NodeError::Timeout)));
    drop(pair);
}

#[tokio::test]
async fn streamed_data_command_reports_length_and_crc() {
    init_tracing();
    let (client, _server, _kv) = rpc_pair();

    let total: u32 = 2048;
    let ack_period: u8 = 4;
    let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

    let mut params = Vec::new();
    params.extend_from_slice(&total.to_le_bytes());
    params.push(ack_period);
    let pending = client
        .command_queue(command_id::DATA_RECEIVER, &params, CTX_TIMEOUT, RSP_TIMEOUT)
        .await
        .unwrap();
    let request_id = pending.request_id;

    // Wait for the ready acknowledgement, then stream four 512-byte frames.
    client.ack_wait(request_id, Duration::from_secs(1)).await.unwrap();
    for chunk_index in 0..4u32 {
        let offset = chunk_index * 512;
        client
            .data_queue(request_id, offset, &data[offset as usize..(offset + 512) as usize])
            .await
            .unwrap();
    }

    let response = pending.response().await.expect("response before timeout");
    assert_eq!(response.header.return_code, return_code::OK);
    assert_eq!(
        &response.params[..4],
        &total.to_le_bytes(),
        "received length"
    );
    assert_eq!(
        &response.params[4..8],
        &crc32fast::hash(&data).to_le_bytes(),
        "crc over the full stream"
    );
}

#[tokio::test]
async fn auto_load_paces_frames_by_acks() {
    init_tracing();
    let (client, _server, _kv) = rpc_pair();

    let total: u32 = 4096;
    let ack_period: u8 = 2;
    let mut params = Vec::new();
    params.extend_from_slice(&total.to_le_bytes());
    params.push(ack_period);
    let pending = client
        .command_queue(command_id::DATA_RECEIVER, &params, CTX_TIMEOUT, RSP_TIMEOUT)
        .await
        .unwrap();

    let sent = client
        .data_queue_auto_load(
            pending.request_id,
            total,
            |offset, max_len| {
                (0..max_len)
                    .map(|i| ((offset as usize + i) % 253) as u8)
                    .collect()
            },
            AutoLoadParams {
                ack_period,
                pipelining: 1,
                frame_timeout: Duration::from_secs(2),
            },
        )
        .await
        .unwrap();
    assert_eq!(sent, total);

    let response = pending.response().await.expect("response before timeout");
    assert_eq!(response.header.return_code, return_code::OK);
    assert_eq!(&response.params[..4], &total.to_le_bytes());
}

#[tokio::test]
async fn data_receiver_without_data_times_out() {
    init_tracing();
    let (client, _server, _kv) = rpc_pair();

    let mut params = Vec::new();
    params.extend_from_slice(&1024u32.to_le_bytes());
    params.push(1);
    let response = client
        .command_sync(command_id::DATA_RECEIVER, &params, CTX_TIMEOUT, RSP_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.header.return_code, return_code::TIMEOUT);
    assert_eq!(&response.params[..4], &0u32.to_le_bytes());
}

#[tokio::test]
async fn data_sender_streams_to_client() {
    init_tracing();
    let (client, _server, _kv) = rpc_pair();

    // Responses and data arrive on the client interface; data frames are
    // observed through a raw listener since no command is receiving them.
    let total: u32 = 1500;
    let response = client
        .command_sync(
            command_id::DATA_SENDER,
            &total.to_le_bytes(),
            CTX_TIMEOUT,
            RSP_TIMEOUT,
        )
        .await
        .unwrap();
    assert_eq!(response.header.return_code, return_code::OK);
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    init_tracing();
    let (client, _server, _kv) = rpc_pair();

    let response = client
        .command_sync(0x7777, &[], CTX_TIMEOUT, RSP_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.header.return_code, return_code::UNSUPPORTED);
}

#[tokio::test]
async fn insufficient_auth_is_rejected_without_dispatch() {
    init_tracing();
    let (client, _server, kv) = rpc_pair();

    // kv_write requires device-level auth; commands are sent with network
    // auth, so the handler must not run.
    let mut params = Vec::new();
    params.extend_from_slice(&42u16.to_le_bytes());
    params.extend_from_slice(b"value");
    let response = client
        .command_sync(command_id::KV_WRITE, &params, CTX_TIMEOUT, RSP_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.header.return_code, return_code::ACCESS_DENIED);
    assert!(!kv.key_exists(42));
}

fn double_params(ctx: &mut RequestCtx) -> HandlerFuture<'_> {
    Box::pin(async move {
        let doubled: Vec<u8> = ctx.params().iter().map(|b| b.wrapping_mul(2)).collect();
        Some((return_code::OK, doubled))
    })
}

#[tokio::test]
async fn user_dispatch_routes_high_command_ids() {
    init_tracing();
    let (client, server, _kv) = rpc_pair();

    server.set_user_dispatch(|command_id| {
        (command_id == 0x8001).then(|| CommandSpec {
            min_auth: Auth::Network,
            handler: Arc::new(double_params),
        })
    });

    let response = client
        .command_sync(0x8001, &[1, 2, 3], CTX_TIMEOUT, RSP_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.header.return_code, return_code::OK);
    assert_eq!(response.params, vec![2, 4, 6]);

    // Ids without a user registration still fail cleanly.
    let response = client
        .command_sync(0x9999, &[], CTX_TIMEOUT, RSP_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.header.return_code, return_code::UNSUPPORTED);
}

#[tokio::test]
async fn concurrent_commands_multiplex_by_request_id() {
    init_tracing();
    let (client, _server, _kv) = rpc_pair();

    let first = client
        .command_queue(command_id::ECHO, b"first", CTX_TIMEOUT, RSP_TIMEOUT)
        .await
        .unwrap();
    let second = client
        .command_queue(command_id::ECHO, b"second", CTX_TIMEOUT, RSP_TIMEOUT)
        .await
        .unwrap();
    assert_ne!(first.request_id, second.request_id);

    let second_rsp = second.response().await.unwrap();
    let first_rsp = first.response().await.unwrap();
    assert_eq!(first_rsp.params, b"first");
    assert_eq!(second_rsp.params, b"second");
}

fn early_responder(ctx: &mut RequestCtx) -> HandlerFuture<'_> {
    Box::pin(async move {
        ctx.early_response(return_code::OK, b"early").await;
        // Post-response work continues after the client is unblocked.
        tokio::time::sleep(Duration::from_millis(50)).await;
        None
    })
}

#[tokio::test]
async fn early_response_completes_client_tracking() {
    init_tracing();
    let (client, server, _kv) = rpc_pair();
    server.set_user_dispatch(|command_id| {
        (command_id == 0x8002).then(|| CommandSpec {
            min_auth: Auth::Network,
            handler: Arc::new(early_responder),
        })
    });

    let response = client
        .command_sync(0x8002, &[], CTX_TIMEOUT, RSP_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.header.return_code, return_code::OK);
    assert_eq!(response.params, b"early");
}

#[tokio::test]
async fn cleanup_completes_pending_with_none() {
    init_tracing();
    let pair = linked_pair();
    let client = RpcClient::new(Arc::clone(&pair.a), InterfaceAddress::Broadcast);

    let pending = client
        .command_queue(command_id::ECHO, b"x", CTX_TIMEOUT, Duration::from_secs(30))
        .await
        .unwrap();
    client.cleanup();
    assert!(pending.response().await.is_none());
    drop(pair);
}
