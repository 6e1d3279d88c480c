//! Async TCP transport for the PLC link (spec §4.B socket ownership).
//!
//! Adapted from the teacher's `comm::tcp::TcpComm`: a single lazily
//! established connection guarded by a mutex, torn down and reconnected
//! on the next use whenever a read/write hits a broken-pipe-family error
//! or times out. The teacher's `busy` mutex (serializing callers before
//! they touch the stream) becomes the async `Mutex` itself, since only
//! one in-flight request can hold the guard at a time.

use crate::error::{PlcError, PlcResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn write(&self, buf: &[u8]) -> PlcResult<()>;
    async fn read_exact(&self, buf: &mut [u8]) -> PlcResult<()>;
    /// Drops the current connection so the next call reconnects.
    async fn reconnect(&self);
}

pub struct TcpTransport {
    addr: SocketAddr,
    timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        TcpTransport {
            addr,
            timeout,
            stream: Mutex::new(None),
        }
    }

    async fn ensure_connected<'a>(
        &self,
        guard: &'a mut Option<TcpStream>,
    ) -> PlcResult<&'a mut TcpStream> {
        if guard.is_none() {
            let stream = tokio::time::timeout(self.timeout, TcpStream::connect(self.addr))
                .await
                .map_err(|_| PlcError::transport(format!("connect to {} timed out", self.addr)))?
                .map_err(|e| PlcError::transport(format!("connect to {}: {e}", self.addr)))?;
            stream
                .set_nodelay(true)
                .map_err(|e| PlcError::transport(format!("set_nodelay: {e}")))?;
            guard.replace(stream);
        }
        Ok(guard.as_mut().expect("just inserted"))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&self, buf: &[u8]) -> PlcResult<()> {
        let mut guard = self.stream.lock().await;
        let stream = self.ensure_connected(&mut guard).await?;
        let result = tokio::time::timeout(self.timeout, stream.write_all(buf)).await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                if PlcError::is_broken_pipe_io(&e) {
                    guard.take();
                }
                Err(PlcError::transport(format!("write: {e}")))
            }
            Err(_) => {
                guard.take();
                Err(PlcError::transport("write timed out"))
            }
        }
    }

    async fn read_exact(&self, buf: &mut [u8]) -> PlcResult<()> {
        let mut guard = self.stream.lock().await;
        let stream = self.ensure_connected(&mut guard).await?;
        let result = tokio::time::timeout(self.timeout, stream.read_exact(buf)).await;
        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                if PlcError::is_broken_pipe_io(&e) || e.kind() == std::io::ErrorKind::UnexpectedEof
                {
                    guard.take();
                }
                Err(PlcError::transport(format!("read: {e}")))
            }
            Err(_) => {
                guard.take();
                Err(PlcError::transport("read timed out"))
            }
        }
    }

    async fn reconnect(&self) {
        self.stream.lock().await.take();
    }
}
