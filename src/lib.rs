//! Transport and dispatch core for a version-control style client/server RPC protocol.
//!
//! A [`RpcService`](rpc::RpcService) holds what every connection shares: the endpoint to listen
//! on or connect to, the registered handlers and the protocol variables. Each connection is driven
//! by an [`Rpc`](rpc::Rpc), which sends function invocations to the peer and dispatches the ones
//! the peer sends back, keeping duplex traffic from deadlocking on full socket buffers.

pub mod config;
pub mod error;
pub mod net;
pub mod rpc;
pub mod trust;

pub use config::RpcConfig;
pub use error::{DuplexError, Error, RpcError};
pub use p4rpc_proto::{tags, MessageDict};
pub use rpc::{DispatchMode, DispatchTable, Rpc, RpcService};
