//! Length-prefixed framing over the driver's stdio pipes.
//!
//! Wire format of one frame:
//!
//! ```text
//! ┌───────────────────┬──────────────────────────┐
//! │ Length (4B LE u32) │ Payload (Length bytes)   │
//! │                    │ UTF-8 JSON text          │
//! └───────────────────┴──────────────────────────┘
//! ```
//!
//! The transport knows nothing about message semantics. The sender writes
//! whole frames; the receiver reassembles frames from partial reads and yields
//! payloads with the prefix stripped.

use std::future::Future;
use std::pin::Pin;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Size of the little-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound on a single frame's payload: 256 MiB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const READ_CHUNK_SIZE: usize = 32 * 1024;

/// Boxed future returned by the transport traits.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Transport tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Frames announcing a longer payload fail the read.
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Appends one frame (prefix + payload) to `dst`.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        Error::Transport(format!(
            "payload of {} bytes does not fit a 32-bit length prefix",
            payload.len()
        ))
    })?;
    dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
    dst.put_u32_le(len);
    dst.put_slice(payload);
    Ok(())
}

/// Incremental frame reassembly.
///
/// Bytes may be fed in chunks split at any boundary; complete payloads come
/// out of [`decode_next`](Self::decode_next) in order.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_config(&TransportConfig::default())
    }

    pub fn with_config(config: &TransportConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            max_frame_len: config.max_frame_len,
        }
    }

    /// Buffers raw bytes read from the stream.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns the next complete payload, or `None` if more bytes are needed.
    pub fn decode_next(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_SIZE]);
        let len = u32::from_le_bytes(prefix) as usize;

        if len > self.max_frame_len {
            return Err(Error::Transport(format!(
                "frame of {} bytes exceeds limit of {} bytes",
                len, self.max_frame_len
            )));
        }

        // The buffer grows only as bytes arrive.
        if self.buf.len() < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes of an incomplete frame currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// The error to report when the stream ends now.
    pub fn eof_error(&self) -> Error {
        Error::TransportClosed {
            truncated: !self.buf.is_empty(),
        }
    }
}

/// Write half of a transport.
pub trait TransportSender: Send {
    /// Writes one frame. The whole frame is written before the future
    /// resolves; callers serialize access so frames never interleave.
    fn send<'a>(&'a mut self, payload: &'a [u8]) -> TransportFuture<'a, ()>;

    /// Flushes and closes the write half.
    fn shutdown(&mut self) -> TransportFuture<'_, ()>;
}

/// Read half of a transport.
pub trait TransportReceiver: Send {
    /// Waits for the next complete frame and returns its payload.
    ///
    /// Fails with [`Error::TransportClosed`] at end of stream. Cancelling the
    /// future loses no bytes: partial frames stay buffered.
    fn next_frame(&mut self) -> TransportFuture<'_, Bytes>;
}

/// Both halves of a transport, boxed for the connection.
pub struct TransportParts {
    pub sender: Box<dyn TransportSender>,
    pub receiver: Box<dyn TransportReceiver>,
}

/// Transport over a child process's stdin (write) and stdout (read).
pub struct PipeTransport<W, R> {
    stdin: W,
    stdout: R,
    config: TransportConfig,
}

impl<W, R> PipeTransport<W, R>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(stdin: W, stdout: R) -> Self {
        Self::with_config(stdin, stdout, TransportConfig::default())
    }

    pub fn with_config(stdin: W, stdout: R, config: TransportConfig) -> Self {
        Self {
            stdin,
            stdout,
            config,
        }
    }

    /// Splits into independently owned halves.
    pub fn into_parts(self) -> (PipeTransportSender<W>, PipeTransportReceiver<R>) {
        let sender = PipeTransportSender {
            stdin: self.stdin,
            buf: BytesMut::new(),
        };
        let receiver = PipeTransportReceiver {
            stdout: self.stdout,
            decoder: FrameDecoder::with_config(&self.config),
        };
        (sender, receiver)
    }

    /// Splits into boxed halves ready for [`Connection::new`](crate::Connection::new).
    pub fn into_transport_parts(self) -> TransportParts {
        let (sender, receiver) = self.into_parts();
        TransportParts {
            sender: Box::new(sender),
            receiver: Box::new(receiver),
        }
    }
}

/// Write half of a [`PipeTransport`].
pub struct PipeTransportSender<W> {
    stdin: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin + Send> PipeTransportSender<W> {
    /// Writes one frame and flushes.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_frame(payload, &mut self.buf)?;
        tracing::trace!(len = payload.len(), "writing frame");
        self.stdin.write_all(&self.buf).await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin + Send> TransportSender for PipeTransportSender<W> {
    fn send<'a>(&'a mut self, payload: &'a [u8]) -> TransportFuture<'a, ()> {
        Box::pin(PipeTransportSender::send(self, payload))
    }

    fn shutdown(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.stdin.shutdown().await?;
            Ok(())
        })
    }
}

/// Read half of a [`PipeTransport`].
pub struct PipeTransportReceiver<R> {
    stdout: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin + Send> PipeTransportReceiver<R> {
    /// Reads until one complete frame is buffered and returns its payload.
    pub async fn next_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(payload) = self.decoder.decode_next()? {
                tracing::trace!(len = payload.len(), "read frame");
                return Ok(payload);
            }

            self.decoder.buf.reserve(READ_CHUNK_SIZE);
            let read = self.stdout.read_buf(&mut self.decoder.buf).await?;
            if read == 0 {
                return Err(self.decoder.eof_error());
            }
        }
    }

    /// The frame sequence as a lazy stream.
    ///
    /// The stream yields payloads until the pipe closes, then yields the
    /// closing error once and ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send
    where
        R: 'static,
    {
        futures_util::stream::unfold(Some(self), |state| async move {
            let mut receiver = state?;
            match receiver.next_frame().await {
                Ok(payload) => Some((Ok(payload), Some(receiver))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

impl<R: AsyncRead + Unpin + Send> TransportReceiver for PipeTransportReceiver<R> {
    fn next_frame(&mut self) -> TransportFuture<'_, Bytes> {
        Box::pin(PipeTransportReceiver::next_frame(self))
    }
}
