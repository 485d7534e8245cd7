//! Built-in RPC commands.

use crate::kv::KvStore;
use crate::rpc::{HandlerFuture, RequestCtx, RpcServer};
use std::sync::Arc;
use std::time::Duration;
use tela_wire::rpc::return_code;
use tela_wire::Auth;
use tracing::debug;

/// Built-in command identifiers.
pub mod command_id {
    /// Return the request parameters unchanged.
    pub const ECHO: u16 = 0x0100;
    /// Receive a client-to-server bulk data stream and report its CRC.
    pub const DATA_RECEIVER: u16 = 0x0200;
    /// Stream generated data from server to client.
    pub const DATA_SENDER: u16 = 0x0201;
    /// Read a key-value store entry.
    pub const KV_READ: u16 = 0x0300;
    /// Write a key-value store entry.
    pub const KV_WRITE: u16 = 0x0301;
}

/// Wait limit for each expected bulk-data frame.
const DATA_FRAME_TIMEOUT: Duration = Duration::from_millis(500);

fn echo(ctx: &mut RequestCtx) -> HandlerFuture<'_> {
    Box::pin(async move { Some((return_code::OK, ctx.params().to_vec())) })
}

/// `data_receiver` request parameters: `size: u32 LE, rx_ack_period: u8`.
/// Response parameters: `recv_len: u32 LE, recv_crc: u32 LE`.
fn data_receiver(ctx: &mut RequestCtx) -> HandlerFuture<'_> {
    Box::pin(async move {
        let params = ctx.params();
        if params.len() < 5 {
            return Some((return_code::INVALID_ARGUMENT, Vec::new()));
        }
        let size = u32::from_le_bytes([params[0], params[1], params[2], params[3]]);
        let ack_period = params[4];

        // The request buffer is not needed while streaming.
        ctx.release_request();
        debug!(size, ack_period, "receiving data stream");
        ctx.ack_ready(ack_period).await;

        let mut crc = crc32fast::Hasher::new();
        let mut rc = return_code::OK;
        let mut received = 0u32;
        let mut expected_offset = 0u32;
        while received < size {
            let chunk = match ctx.pull_data(expected_offset, DATA_FRAME_TIMEOUT).await {
                Ok(chunk) => chunk,
                Err(crate::error::NodeError::Timeout) => {
                    rc = return_code::TIMEOUT;
                    break;
                }
                Err(_) => {
                    rc = return_code::INVALID_ARGUMENT;
                    break;
                }
            };
            #[allow(clippy::cast_possible_truncation)]
            let len = chunk.payload.len() as u32;
            if len > size - received {
                rc = return_code::INVALID_ARGUMENT;
                break;
            }
            crc.update(&chunk.payload);
            expected_offset = chunk.offset + len;
            received += len;
            if received < size {
                ctx.ack_data(chunk.offset, ack_period).await;
            } else {
                ctx.ack_last(chunk.offset, ack_period).await;
            }
        }

        let mut rsp = Vec::with_capacity(8);
        rsp.extend_from_slice(&received.to_le_bytes());
        rsp.extend_from_slice(&crc.finalize().to_le_bytes());
        Some((rc, rsp))
    })
}

/// `data_sender` request parameters: `size: u32 LE`. Streams `size` bytes
/// of generated data to the client, then responds.
fn data_sender(ctx: &mut RequestCtx) -> HandlerFuture<'_> {
    Box::pin(async move {
        let params = ctx.params();
        if params.len() < 4 {
            return Some((return_code::INVALID_ARGUMENT, Vec::new()));
        }
        let size = u32::from_le_bytes([params[0], params[1], params[2], params[3]]);
        ctx.release_request();
        debug!(size, "sending data stream");

        let chunk_len = ctx.max_data_payload();
        if chunk_len == 0 {
            return Some((return_code::NO_MEMORY, Vec::new()));
        }
        let mut remaining = size;
        let mut offset = 0u32;
        while remaining > 0 {
            let len = chunk_len.min(remaining as usize);
            let mut payload = vec![0u8; len];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut payload);
            if ctx.send_data(offset, &payload).await.is_err() {
                return Some((return_code::NO_MEMORY, Vec::new()));
            }
            ctx.watchdog_feed();
            #[allow(clippy::cast_possible_truncation)]
            {
                offset += len as u32;
                remaining -= len as u32;
            }
        }
        Some((return_code::OK, Vec::new()))
    })
}

/// `kv_read` request parameters: `key: u16 LE`. Responds with the value
/// bytes.
fn kv_read(ctx: &mut RequestCtx) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Some(store) = ctx.kv() else {
            return Some((return_code::UNSUPPORTED, Vec::new()));
        };
        let params = ctx.params();
        if params.len() < 2 {
            return Some((return_code::INVALID_ARGUMENT, Vec::new()));
        }
        let key = u16::from_le_bytes([params[0], params[1]]);
        match store.read(key) {
            Ok(value) => Some((return_code::OK, value)),
            Err(crate::error::NodeError::NotPermitted) => {
                Some((return_code::ACCESS_DENIED, Vec::new()))
            }
            Err(_) => Some((return_code::NOT_FOUND, Vec::new())),
        }
    })
}

/// `kv_write` request parameters: `key: u16 LE, value bytes`. Responds
/// with `written: u32 LE`.
fn kv_write(ctx: &mut RequestCtx) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Some(store) = ctx.kv() else {
            return Some((return_code::UNSUPPORTED, Vec::new()));
        };
        let params = ctx.params();
        if params.len() < 2 {
            return Some((return_code::INVALID_ARGUMENT, Vec::new()));
        }
        let key = u16::from_le_bytes([params[0], params[1]]);
        match store.write(key, &params[2..]) {
            Ok(written) => {
                #[allow(clippy::cast_possible_truncation)]
                let written = written as u32;
                Some((return_code::OK, written.to_le_bytes().to_vec()))
            }
            Err(_) => Some((return_code::ACCESS_DENIED, Vec::new())),
        }
    })
}

/// Register the built-in command set on a server.
pub fn register_builtin(server: &RpcServer, kv: Arc<KvStore>) {
    server.set_kv_store(kv);
    server.register(command_id::ECHO, Auth::Network, Arc::new(echo));
    server.register(
        command_id::DATA_RECEIVER,
        Auth::Network,
        Arc::new(data_receiver),
    );
    server.register(command_id::DATA_SENDER, Auth::Network, Arc::new(data_sender));
    server.register(command_id::KV_READ, Auth::Device, Arc::new(kv_read));
    server.register(command_id::KV_WRITE, Auth::Device, Arc::new(kv_write));
}
