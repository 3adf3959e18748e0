//! Transport primitives that move opaque frames between two processes.
//!
//! The protocol layer only relies on the operations below. A channel whose
//! `receive` yields `Ok(None)` (or an error) is the death notification: the
//! peer process or its end of the channel is gone.
//!
//! - **Memory**: in-process channel pairs, used for embedding and tests
//! - **Tcp**: loopback TCP with `[u32 BE len][payload]` framing

pub mod memory;
pub mod tcp;

pub use memory::MemoryTransport;
pub use tcp::{TcpChannel, TcpTransport};

use crate::config::TransportConfig;
use crate::error::{Result, XprocError};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One bound, bidirectional channel to a remote process.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Deliver one frame to the peer.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Wait for the next frame. `Ok(None)` once the peer is gone.
    ///
    /// Only one task may receive from a channel at a time.
    async fn receive(&self) -> Result<Option<Bytes>>;

    /// Close the channel. The peer observes end-of-stream.
    async fn unbind(&self) -> Result<()>;

    /// Description of the peer for logs.
    fn peer(&self) -> String;
}

/// Factory for channels to a named target.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn bind(&self, target: &str) -> Result<Arc<dyn Channel>>;
}

/// Read one `[u32 BE len][frame]` unit from a byte stream.
///
/// `Ok(None)` means the peer closed the stream between frames. A stream that
/// ends inside a frame is a transport error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Bytes>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    check_frame_size(len)?;

    let mut frame = BytesMut::zeroed(len);
    reader
        .read_exact(&mut frame)
        .await
        .map_err(|e| XprocError::Transport {
            message: format!("stream ended inside a {} byte frame", len),
            source: Some(e),
        })?;
    Ok(Some(frame.freeze()))
}

/// Write `frame` with its length prefix as a single buffer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    check_frame_size(frame.len())?;
    let mut buf = BytesMut::with_capacity(4 + frame.len());
    buf.put_u32(frame.len() as u32);
    buf.put_slice(frame);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) fn check_frame_size(len: usize) -> Result<()> {
    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(XprocError::Transport {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                TransportConfig::MAX_FRAME_SIZE
            ),
            source: None,
        });
    }
    Ok(())
}
