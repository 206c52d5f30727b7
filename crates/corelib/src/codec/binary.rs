//! Compact binary codec.
//!
//! Every header and every body is one length-prefixed block:
//!
//! ```text
//! [4 bytes] length (big-endian u32)
//! [N bytes] bincode payload
//! ```
//!
//! A frame is therefore two blocks, header first. The length prefix lets
//! `discard_body` skip a body without decoding or buffering it.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::codec::{CodecType, FrameReader, FrameWriter};
use crate::error::{Error, Result};
use crate::header::Header;

/// Maximum block length: 16 MiB
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Read half of the binary codec.
pub struct BinaryReader<R> {
    reader: R,
}

impl<R> BinaryReader<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    async fn read_len(&mut self) -> Result<usize> {
        let len = self.reader.read_u32().await?;
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(len as usize));
        }
        Ok(len as usize)
    }

    async fn read_block(&mut self) -> Result<Vec<u8>> {
        let len = self.read_len().await?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[async_trait]
impl<R> FrameReader for BinaryReader<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    fn codec_type(&self) -> CodecType {
        CodecType::Binary
    }

    async fn read_header(&mut self) -> Result<Header> {
        let block = self.read_block().await?;
        CodecType::Binary.decode(&block)
    }

    async fn read_body(&mut self) -> Result<Bytes> {
        Ok(Bytes::from(self.read_block().await?))
    }

    async fn discard_body(&mut self) -> Result<()> {
        let len = self.read_len().await? as u64;
        let mut body = (&mut self.reader).take(len);
        let skipped = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        if skipped != len {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(())
    }
}

/// Write half of the binary codec.
pub struct BinaryWriter<W: AsyncWrite> {
    writer: BufWriter<W>,
    closed: bool,
}

impl<W> BinaryWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            closed: false,
        }
    }

    async fn write_block(&mut self, block: &[u8]) -> Result<()> {
        let len = u32::try_from(block.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or(Error::FrameTooLarge(block.len()))?;
        self.writer.write_u32(len).await?;
        self.writer.write_all(block).await?;
        Ok(())
    }

    async fn write_unit(&mut self, header: &[u8], body: &[u8]) -> Result<()> {
        self.write_block(header).await?;
        self.write_block(body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut the stream down without flushing a partly written frame.
    async fn abort(&mut self) {
        self.closed = true;
        if let Err(err) = self.writer.get_mut().shutdown().await {
            tracing::debug!(error = %err, "binary codec: error shutting down stream");
        }
    }
}

#[async_trait]
impl<W> FrameWriter for BinaryWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn codec_type(&self) -> CodecType {
        CodecType::Binary
    }

    async fn write_frame(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Shutdown);
        }
        if body.len() > MAX_FRAME_LEN as usize {
            return Err(Error::FrameTooLarge(body.len()));
        }
        let header = CodecType::Binary.encode(header)?;
        if header.len() > MAX_FRAME_LEN as usize {
            return Err(Error::FrameTooLarge(header.len()));
        }
        if let Err(err) = self.write_unit(&header, body).await {
            tracing::warn!(error = %err, "binary codec: error writing frame");
            self.abort().await;
            return Err(err);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::FailAfter;
    use std::sync::atomic::Ordering;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_block_layout_and_discard() {
        let mut out = Vec::new();
        {
            let mut writer = BinaryWriter::new(&mut out);
            for seq in 1..=2 {
                let body = CodecType::Binary.encode(&(seq as i64 * 10)).unwrap();
                writer
                    .write_frame(&Header::request("Arith.Multiply", seq), &body)
                    .await
                    .unwrap();
            }
        }
        let header_len = u32::from_be_bytes([out[0], out[1], out[2], out[3]]) as usize;
        let body_at = 4 + header_len;
        assert_eq!(out[body_at..body_at + 4], 8u32.to_be_bytes());

        let mut reader = BinaryReader::new(BufReader::new(&out[..]));
        assert_eq!(reader.read_header().await.unwrap().seq, 1);
        reader.discard_body().await.unwrap();
        assert_eq!(reader.read_header().await.unwrap().seq, 2);
        let body = reader.read_body().await.unwrap();
        assert_eq!(CodecType::Binary.decode::<i64>(&body).unwrap(), 20);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let input = (MAX_FRAME_LEN + 1).to_be_bytes();

        let mut reader = BinaryReader::new(BufReader::new(&input[..]));
        let err = reader.read_body().await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge(n) if n == MAX_FRAME_LEN as usize + 1));

        let mut reader = BinaryReader::new(BufReader::new(&input[..]));
        assert!(matches!(reader.discard_body().await, Err(Error::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_before_writing() {
        let mut out = Vec::new();
        {
            let mut writer = BinaryWriter::new(&mut out);
            let huge = vec![7u8; MAX_FRAME_LEN as usize + 1];
            let err = writer
                .write_frame(&Header::request("Big.Blob", 1), &huge)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::FrameTooLarge(_)));

            // Nothing reached the stream and the writer is still usable.
            let body = CodecType::Binary.encode(&1u8).unwrap();
            writer
                .write_frame(&Header::request("Big.Blob", 2), &body)
                .await
                .unwrap();
        }
        let mut reader = BinaryReader::new(BufReader::new(&out[..]));
        assert_eq!(reader.read_header().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_partial_write_shuts_stream_down() {
        let (stream, shut_down) = FailAfter::new(10);
        let mut writer = BinaryWriter::new(stream);
        let body = CodecType::Binary.encode(&vec![1u32; 16]).unwrap();

        let err = writer
            .write_frame(&Header::request("Arith.Multiply", 1), &body)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(shut_down.load(Ordering::SeqCst));

        let err = writer
            .write_frame(&Header::request("Arith.Multiply", 2), &body)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
        writer.close().await.unwrap();
    }
}
