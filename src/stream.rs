use std::{future::Future, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::{
    ReadWrite,
    error::{Error, Result},
};

/// A socket to usbmuxd with exact-size reads and an optional per-operation timeout.
///
/// Every byte going in or out is counted, [`ByteStream::tell`] reports the running total which
/// is handy when a frame goes wrong halfway through.
///
/// Reads are cancel safe: bytes that arrived before a timeout or a dropped future stay buffered
/// and the next read picks up where the last one stopped. The stream never reads past what the
/// current call asked for, so nothing is buffered once a caller has taken everything it peeked.
pub struct ByteStream {
    inner: Box<dyn ReadWrite>,
    buffer: BytesMut,
    offset: u64,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("inner", &"...")
            .field("buffered", &self.buffer.len())
            .field("offset", &self.offset)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ByteStream {
    pub fn new(inner: impl ReadWrite + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            buffer: BytesMut::new(),
            offset: 0,
            timeout: None,
        }
    }

    /// Writes the whole message, returns how many bytes were written.
    pub async fn send(&mut self, msg: &[u8]) -> Result<usize> {
        let timeout = self.timeout;
        let inner = &mut self.inner;

        with_timeout(timeout, async {
            inner.write_all(msg).await?;
            inner.flush().await?;
            Ok(())
        })
        .await?;

        self.offset += msg.len() as u64;
        trace!(len = msg.len(), offset = self.offset, "sent");

        Ok(msg.len())
    }

    /// Reads exactly `size` bytes, looping over short reads.
    ///
    /// A zero-length read means the peer is gone and fails with [`Error::ConnectionBroken`].
    pub async fn recv(&mut self, size: usize) -> Result<Vec<u8>> {
        Ok(self.recv_bytes(size).await?.to_vec())
    }

    pub async fn recv_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let bytes = self.recv_bytes(buf.len()).await?;
        buf.copy_from_slice(&bytes);
        Ok(())
    }

    /// Like [`ByteStream::recv`] without the copy.
    pub async fn recv_bytes(&mut self, size: usize) -> Result<Bytes> {
        self.fill(size).await?;
        trace!(len = size, offset = self.offset, "received");

        Ok(self.buffer.split_to(size).freeze())
    }

    /// Waits until `size` bytes are available and returns them without consuming anything.
    pub async fn peek(&mut self, size: usize) -> Result<&[u8]> {
        self.fill(size).await?;
        Ok(&self.buffer[..size])
    }

    async fn fill(&mut self, size: usize) -> Result<()> {
        let timeout = self.timeout;
        let inner = &mut self.inner;
        let buffer = &mut self.buffer;
        let offset = &mut self.offset;

        with_timeout(timeout, async {
            while buffer.len() < size {
                let missing = (size - buffer.len()) as u64;
                let read = (&mut *inner).take(missing).read_buf(&mut *buffer).await?;

                if read == 0 {
                    return Err(Error::ConnectionBroken { offset: *offset });
                }

                *offset += read as u64;
            }

            Ok(())
        })
        .await
    }

    /// `None` blocks forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub const fn tell(&self) -> u64 {
        self.offset
    }

    pub async fn close(mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Bytes received but not yet handed out.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Gives back the raw transport, used once the socket has been turned into a tunnel.
    #[must_use]
    pub fn into_inner(self) -> Box<dyn ReadWrite> {
        self.inner
    }
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(duration) => tokio::time::timeout(duration, fut)
            .await
            .map_err(|_| Error::Timeout)?,
        None => fut.await,
    }
}
