use crate::error::Result;
use crate::protocol::{InboundFrame, OutboundFrame};

/// JSON codec for message-stream frames.
///
/// Encoding never fails for well-formed frames; decoding surfaces
/// `serde_json` errors so the caller can decide between dropping the
/// frame (mid-stream garbage) and failing the handshake.
pub struct FrameCodec;

impl FrameCodec {
    pub fn encode(frame: &OutboundFrame) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(frame)?)
    }

    pub fn decode(data: &[u8]) -> Result<InboundFrame> {
        Ok(serde_json::from_slice(data)?)
    }
}
