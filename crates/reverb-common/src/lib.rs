//! Shared protocol and transport layer for the reverb audio node client.
//!
//! This crate carries everything both halves of the system agree on: the
//! error taxonomy, the JSON frames exchanged over a node's message stream,
//! the REST request bodies, the periodic stats payload, and the
//! length-prefixed framing used on the wire. Policy (reconnection, node
//! selection, credential forwarding) lives in `reverb-cluster`.

pub mod error;
pub mod protocol;
pub mod transport;

pub use error::{Result, ReverbError};
