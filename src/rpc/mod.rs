//! The RPC layer: message transport, handler dispatch and the per-connection engine.

pub mod dispatch;
pub mod engine;
pub mod service;
pub mod track;
pub mod transport;
mod trie;

pub use dispatch::{DispatchTable, Dispatcher, Handler, HandlerFuture, SharedHandler};
pub use engine::{DispatchMode, FlowCounters, Rpc};
pub use service::{OpenMode, RpcService};
pub use track::{RpcTrack, TrackReport};
pub use transport::RpcTransport;
