//! Authenticated RPC over loopback TCP.

mod client;
mod server;

pub use client::{IpcClient, IpcError};
pub use server::{CommandHandler, ConnectionId, IpcServer, Responder};
