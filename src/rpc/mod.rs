//! Length-prefixed JSON RPC carrying the sync facade.

pub mod client;
pub mod dispatch;
pub mod server;
pub mod wire;

pub use client::SyncClient;
pub use dispatch::{FULL_UPDATE, MethodTable, PUSH, UPDATE};
pub use server::{Node, NodeState, ShutdownHandle};
pub use wire::RpcError;
