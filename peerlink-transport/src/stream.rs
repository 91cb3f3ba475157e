use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use quinn::{ReadError, RecvStream, SendStream, VarInt, WriteError};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::errors::{from_connection_error, Result, TransportError};

/// Error code carried on stream-level cancellation frames.
const RESET_CODE: VarInt = VarInt::from_u32(0);

/// A reliable, ordered, bidirectional stream inside a QUIC session.
///
/// Cancellation observed from the peer (a canceled read or canceled write)
/// is reported as the canonical stream-reset error rather than the engine's
/// stream-level codes. The type also implements [`AsyncRead`] and
/// [`AsyncWrite`] so it composes with the usual I/O combinators; deadlines
/// are the caller's composition with `tokio::time::timeout`.
#[derive(Debug)]
pub struct Stream {
    send: SendStream,
    recv: RecvStream,
}

impl Stream {
    pub(crate) fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    /// Reads into `buf`, returning the number of bytes read or `None` at
    /// end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.recv.read(buf).await {
            Ok(n) => Ok(n),
            Err(ReadError::Reset(_)) => Err(TransportError::StreamReset),
            Err(ReadError::ConnectionLost(e)) => Err(from_connection_error(e)),
            Err(ReadError::ClosedStream) => Err(TransportError::Closed),
            Err(e) => Err(TransportError::Io(io::Error::from(e))),
        }
    }

    /// Writes from `buf`, returning the number of bytes accepted.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.send.write(buf).await {
            Ok(n) => Ok(n),
            Err(WriteError::Stopped(_)) => Err(TransportError::StreamReset),
            Err(WriteError::ConnectionLost(e)) => Err(from_connection_error(e)),
            Err(WriteError::ClosedStream) => Err(TransportError::Closed),
            Err(e) => Err(TransportError::Io(io::Error::from(e))),
        }
    }

    /// Writes all of `buf`.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self.send.write_all(buf).await {
            Ok(()) => Ok(()),
            Err(WriteError::Stopped(_)) => Err(TransportError::StreamReset),
            Err(WriteError::ConnectionLost(e)) => Err(from_connection_error(e)),
            Err(WriteError::ClosedStream) => Err(TransportError::Closed),
            Err(e) => Err(TransportError::Io(io::Error::from(e))),
        }
    }

    /// Half-closes the outgoing direction, signalling end of stream to the
    /// peer once all pending data is delivered.
    pub fn close_write(&mut self) -> Result<()> {
        // Finishing twice is a no-op.
        let _ = self.send.finish();
        Ok(())
    }

    /// Cancels the incoming direction with a reset code.
    pub fn close_read(&mut self) -> Result<()> {
        let _ = self.recv.stop(RESET_CODE);
        Ok(())
    }

    /// Cancels both directions.
    pub fn reset(&mut self) {
        let _ = self.send.reset(RESET_CODE);
        let _ = self.recv.stop(RESET_CODE);
    }

    /// Closes the stream: cancels the incoming direction and half-closes
    /// the outgoing one, so a blocked peer write is signalled and a blocked
    /// local read unblocks.
    pub fn close(&mut self) {
        let _ = self.recv.stop(RESET_CODE);
        let _ = self.send.finish();
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}
