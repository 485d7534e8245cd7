//! RPC engine: command/response/data transport over ePacket.
//!
//! The client tracks in-flight requests in a fixed slot table and matches
//! responses by request id; the server runs registered command handlers on
//! a bounded worker pool with pipelined bulk-data reception.

mod client;
pub mod commands;
mod server;

pub use client::{AutoLoadParams, PendingCommand, RpcClient, RpcResponse, MAX_IN_FLIGHT};
pub use server::{
    CommandSpec, DataChunk, Handler, HandlerFuture, HandlerResult, RequestCtx, RpcServer,
    RpcServerConfig, USER_COMMAND_BASE,
};
