//! Framed codec for IPC communication.
//!
//! Uses LengthDelimitedCodec (4-byte big-endian length prefix) for framing and
//! serde_json for the payload. Works over any AsyncRead/AsyncWrite: loopback TCP
//! sockets, child stdin/stdout pipes, in-memory duplex streams.
//!
//! Partial reads and writes, and system calls interrupted by a signal, are retried
//! by tokio's I/O driver; callers only ever see whole frames.

use std::io;
use std::marker::PhantomData;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames at or above this size are logged, they usually mean a bot is shipping
/// far more state through the queue than it should.
const LARGE_FRAME_BYTES: usize = 100_000;

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len >= LARGE_FRAME_BYTES {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// Errors surfaced by the framing layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer went away: EOF on read, or a broken pipe / zero-length write.
    #[error("connection closed")]
    ConnectionClosed,
    /// The frame arrived whole but its payload could not be decoded.
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("i/o error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::InvalidData => Self::Malformed(e.to_string()),
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero => Self::ConnectionClosed,
            _ => Self::Io(e),
        }
    }
}

/// Wait for the next whole frame. EOF maps to [`ProtocolError::ConnectionClosed`].
pub async fn read_frame<S, T>(reader: &mut S) -> Result<T, ProtocolError>
where
    S: Stream<Item = Result<T, io::Error>> + Unpin,
{
    match reader.next().await {
        Some(Ok(item)) => Ok(item),
        Some(Err(e)) => Err(e.into()),
        None => Err(ProtocolError::ConnectionClosed),
    }
}

/// Encode and flush one frame.
pub async fn write_frame<S, T>(writer: &mut S, item: T) -> Result<(), ProtocolError>
where
    S: Sink<T, Error = io::Error> + Unpin,
{
    writer.send(item).await.map_err(ProtocolError::from)
}
