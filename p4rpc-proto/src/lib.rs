//! The wire layer used by `p4rpc`: the [`MessageDict`](dict::MessageDict) type representing one
//! message, the encoding of its `(name, value)` pairs and the self-delimiting frame that carries
//! it over a byte stream.
//!
//! This crate does no I/O. Frames are written into and parsed out of plain byte buffers, leaving
//! it to the transport to decide when bytes move.

pub mod dict;
pub mod frame;
pub mod serialize;
pub mod tags;

pub use dict::MessageDict;
pub use frame::{encode_message, take_frame, HEADER_SIZE, MAX_MESSAGE_SIZE, SEND_OVERHEAD};
pub use serialize::{WireRead, WireWrite};
