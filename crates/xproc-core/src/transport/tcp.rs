//! Loopback TCP transport for calls between two real processes.
//!
//! Targets are socket addresses (`127.0.0.1:port`). Reads and writes use
//! separate halves behind their own tokio `Mutex`, so dispatcher workers can
//! send responses while the receive loop is parked on the next frame.

use super::{read_frame, write_frame, Channel, Transport};
use crate::config::TransportConfig;
use crate::error::{Result, XprocError};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// A framed TCP connection to one peer.
#[derive(Debug)]
pub struct TcpChannel {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
}

impl TcpChannel {
    /// Wrap an accepted or connected stream.
    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        // Frames are small request/response units; don't batch them.
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&self, frame: Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame).await
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader).await
    }

    async fn unbind(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            // Already gone on the other side
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn peer(&self) -> String {
        format!("tcp:{}", self.peer)
    }
}

/// Transport that connects to loopback TCP hosts.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(&self, target: &str) -> Result<Arc<dyn Channel>> {
        let addr: SocketAddr = target.parse().map_err(|_| XprocError::Config {
            message: format!("invalid TCP target {}", target),
        })?;

        let stream = tokio::time::timeout(
            TransportConfig::TCP_CONNECT_TIMEOUT,
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| XprocError::RemoteProcessGone)?
        .map_err(|e| {
            debug!("TCP connect to {} failed: {}", addr, e);
            XprocError::RemoteProcessGone
        })?;

        debug!("TCP channel connected to {}", addr);
        Ok(Arc::new(TcpChannel::new(stream)?))
    }
}
