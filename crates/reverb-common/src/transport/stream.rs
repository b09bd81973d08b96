use std::net::ToSocketAddrs;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, ReverbError};
use crate::protocol::{InboundFrame, OutboundFrame};
use crate::transport::codec::FrameCodec;
use crate::transport::MAX_FRAME_SIZE;

/// Async transport for a node's message stream.
///
/// Stateless; every method takes the stream it operates on. Connection
/// ownership, reconnection and shutdown all belong to the caller.
pub struct NodeTransport;

impl NodeTransport {
    /// Connects to a node's stream endpoint.
    ///
    /// The address may resolve to multiple socket addresses; each is tried
    /// until one succeeds.
    pub async fn connect(addr: &str) -> Result<TcpStream> {
        let socket_addrs = addr
            .to_socket_addrs()
            .map_err(|e| ReverbError::Transport(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match TcpStream::connect(&socket_addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }

        Err(ReverbError::Transport(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }

    /// Encodes and writes one frame.
    pub async fn send_frame(stream: &mut TcpStream, frame: &OutboundFrame) -> Result<()> {
        let encoded = FrameCodec::encode(frame)?;
        Self::send_message(stream, &encoded).await
    }

    /// Reads and decodes one frame.
    ///
    /// A decode failure here means the *frame* was malformed, not the
    /// connection; callers reading mid-stream should drop and continue,
    /// which is why [`read_message`](Self::read_message) is also public.
    pub async fn read_frame(stream: &mut TcpStream) -> Result<InboundFrame> {
        let data = Self::read_message(stream).await?;
        FrameCodec::decode(&data)
    }

    /// Writes a length-prefixed message.
    pub async fn send_message(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
        let len = data.len() as u32;

        stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| Self::map_io_error(e, "writing length prefix"))?;
        stream
            .write_all(data)
            .await
            .map_err(|e| Self::map_io_error(e, "writing frame"))?;
        stream
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream"))?;

        Ok(())
    }

    /// Reads a length-prefixed message, rejecting frames over
    /// [`MAX_FRAME_SIZE`] before allocating.
    pub async fn read_message(stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading length prefix"))?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ReverbError::Protocol(format!(
                "Frame too large: {} bytes (max {} bytes)",
                len, MAX_FRAME_SIZE
            )));
        }

        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading frame"))?;

        Ok(buf)
    }

    fn map_io_error(err: std::io::Error, context: &str) -> ReverbError {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ReverbError::Transport(format!("{}: timed out", context))
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::NotConnected => {
                ReverbError::Transport(format!("{}: connection lost", context))
            }
            _ => ReverbError::Io(err),
        }
    }
}
