//! Framed transport for a node's message stream.
//!
//! Wire format: `[4-byte length prefix as u32 big-endian] + [JSON frame]`.
//! Frames are capped at 1 MiB; anything larger is rejected before
//! allocation. The codec is split from the stream so frame tests never
//! need a socket.

pub mod codec;
pub mod stream;

pub use codec::FrameCodec;
pub use stream::NodeTransport;

/// Upper bound on a single frame. Stats and event payloads are tiny; a
/// frame anywhere near this size is a corrupt length prefix.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
