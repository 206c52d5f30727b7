//! Wire codecs for the `(Header, Body)` frame pair.
//!
//! A codec is split into a read half and a write half so one task can sit in
//! the receive loop while others write under the connection's sending lock.
//! Bodies cross the codec boundary as already-encoded bytes; [`CodecType`]
//! turns typed values into those bytes and back.
//!
//! Two families exist:
//!
//! - [`CodecType::Binary`]: bincode values behind a `u32` big-endian length prefix
//! - [`CodecType::Json`]: one compact JSON document per line

pub mod binary;
pub mod json;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::header::Header;

pub use binary::{BinaryReader, BinaryWriter};
pub use json::{JsonReader, JsonWriter};

/// Identifier of a codec family, negotiated through the option record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CodecType {
    /// Compact bincode encoding.
    Binary,
    /// Self-describing JSON encoding.
    #[default]
    Json,
}

impl CodecType {
    pub const BINARY_NAME: &'static str = "application/bincode";
    pub const JSON_NAME: &'static str = "application/json";

    pub fn as_str(&self) -> &'static str {
        match self {
            CodecType::Binary => Self::BINARY_NAME,
            CodecType::Json => Self::JSON_NAME,
        }
    }

    /// Encode a value the way this codec frames bodies.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        let bytes = match self {
            CodecType::Binary => {
                bincode::serialize(value).map_err(|e| Error::Encode(e.to_string()))?
            }
            CodecType::Json => {
                serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))?
            }
        };
        Ok(Bytes::from(bytes))
    }

    /// Decode a body produced by [`CodecType::encode`] on the peer.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecType::Binary => {
                bincode::deserialize(bytes).map_err(|e| Error::Decode(e.to_string()))
            }
            CodecType::Json => {
                serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
            }
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            Self::BINARY_NAME => Ok(CodecType::Binary),
            Self::JSON_NAME => Ok(CodecType::Json),
            other => Err(Error::UnsupportedCodec(other.to_string())),
        }
    }
}

/// Read half of a codec.
///
/// Callers alternate strictly: `read_header`, then exactly one of
/// `read_body` or `discard_body`.
#[async_trait]
pub trait FrameReader: Send {
    fn codec_type(&self) -> CodecType;

    async fn read_header(&mut self) -> Result<Header>;

    /// Read the encoded body that follows the last header.
    async fn read_body(&mut self) -> Result<Bytes>;

    /// Consume and drop the body without materializing it.
    async fn discard_body(&mut self) -> Result<()>;
}

/// Write half of a codec.
#[async_trait]
pub trait FrameWriter: Send {
    fn codec_type(&self) -> CodecType;

    /// Write header and body as one logical unit and flush.
    ///
    /// If the write fails partway the underlying stream is shut down, so a
    /// torn frame is never followed by more traffic.
    async fn write_frame(&mut self, header: &Header, body: &[u8]) -> Result<()>;

    /// Shut down the write side of the stream. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

/// Boxed reader half over any buffered byte stream.
pub type BoxReader = Box<dyn FrameReader>;
/// Boxed writer half over any byte stream.
pub type BoxWriter = Box<dyn FrameWriter>;

/// Build both codec halves for a negotiated codec type.
///
/// `reader` must be the same buffered reader the option record was read
/// from, so bytes already buffered past the record are not lost.
pub fn new_codec<R, W>(codec_type: CodecType, reader: R, writer: W) -> (BoxReader, BoxWriter)
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    match codec_type {
        CodecType::Binary => (
            Box::new(BinaryReader::new(reader)),
            Box::new(BinaryWriter::new(writer)),
        ),
        CodecType::Json => (
            Box::new(JsonReader::new(reader)),
            Box::new(JsonWriter::new(writer)),
        ),
    }
}

/// Test doubles shared by the codec tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    use tokio::io::AsyncWrite;

    /// Accepts `budget` bytes, then fails every write with `BrokenPipe`.
    pub(crate) struct FailAfter {
        budget: usize,
        shut_down: Arc<AtomicBool>,
    }

    impl FailAfter {
        pub(crate) fn new(budget: usize) -> (Self, Arc<AtomicBool>) {
            let shut_down = Arc::new(AtomicBool::new(false));
            let writer = Self {
                budget,
                shut_down: Arc::clone(&shut_down),
            };
            (writer, shut_down)
        }
    }

    impl AsyncWrite for FailAfter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.budget == 0 {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shut_down.store(true, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }
}
