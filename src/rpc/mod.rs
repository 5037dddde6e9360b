//! RPC adapter: re-exports the manager's event stream and device snapshots
//! to network consumers, framed like the device channel itself.

pub mod client;
pub mod proto;
pub mod service;

pub use client::CastClient;
pub use proto::{RpcDevice, RpcEvent, RpcMethod};
pub use service::CastService;
