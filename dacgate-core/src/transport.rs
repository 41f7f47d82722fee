//! Byte-stream transport for dacgate sessions
//!
//! The session layer only needs ordered, reliable bytes with bounded waits.
//! `StreamTransport` wraps any tokio stream (TCP in production, in-memory
//! duplex pipes in tests).

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Reliable ordered byte transport with per-call time budgets
#[async_trait]
pub trait Transport: Send {
    /// Fill `buf` completely or fail.
    ///
    /// A peer close before the buffer is full yields `ConnectionClosed`,
    /// an exhausted budget yields `Timeout`.
    async fn read_exact(&mut self, buf: &mut [u8], budget: Duration) -> Result<()>;

    /// Write all of `buf` and flush
    async fn write_all(&mut self, buf: &[u8], budget: Duration) -> Result<()>;

    /// Close the write half
    async fn shutdown(&mut self) -> Result<()>;

    /// Human-readable peer address
    fn peer_address(&self) -> &str;
}

/// `Transport` over any tokio byte stream
pub struct StreamTransport<S> {
    stream: S,
    peer: String,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl StreamTransport<TcpStream> {
    /// Wrap an accepted TCP connection
    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(Self::new(stream, peer))
    }

    /// Open a TCP connection within `budget`
    pub async fn connect(address: &str, budget: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(budget, TcpStream::connect(address))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {}", address)))??;
        Self::from_tcp(stream)
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_exact(&mut self, buf: &mut [u8], budget: Duration) -> Result<()> {
        let deadline = Instant::now() + budget;
        let mut filled = 0;
        while filled < buf.len() {
            let read = tokio::time::timeout_at(deadline, self.stream.read(&mut buf[filled..]))
                .await
                .map_err(|_| {
                    Error::Timeout(format!("read of {} bytes from {}", buf.len(), self.peer))
                })??;
            if read == 0 {
                return Err(Error::ConnectionClosed);
            }
            filled += read;
        }
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8], budget: Duration) -> Result<()> {
        let stream = &mut self.stream;
        tokio::time::timeout(budget, async move {
            stream.write_all(buf).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| Error::Timeout(format!("write of {} bytes to {}", buf.len(), self.peer)))??;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn peer_address(&self) -> &str {
        &self.peer
    }
}
