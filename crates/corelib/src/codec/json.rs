//! Textual JSON codec.
//!
//! Headers and bodies are compact JSON documents, each terminated by `\n`.
//! Compact `serde_json` output never contains a raw newline (string contents
//! are escaped), so the newline is an unambiguous delimiter.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::codec::binary::MAX_FRAME_LEN;
use crate::codec::{CodecType, FrameReader, FrameWriter};
use crate::error::{Error, Result};
use crate::header::Header;

/// Read half of the JSON codec.
pub struct JsonReader<R> {
    reader: R,
    scratch: Vec<u8>,
}

impl<R> JsonReader<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            scratch: Vec::new(),
        }
    }

    /// Read one line into `scratch`, newline stripped.
    async fn read_line(&mut self) -> Result<()> {
        self.scratch.clear();
        let n = (&mut self.reader)
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_until(b'\n', &mut self.scratch)
            .await?;
        match self.scratch.last() {
            Some(b'\n') => {
                self.scratch.pop();
                Ok(())
            }
            _ if n > MAX_FRAME_LEN as usize => Err(Error::FrameTooLarge(n)),
            _ => Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
        }
    }
}

#[async_trait]
impl<R> FrameReader for JsonReader<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    fn codec_type(&self) -> CodecType {
        CodecType::Json
    }

    async fn read_header(&mut self) -> Result<Header> {
        self.read_line().await?;
        CodecType::Json.decode(&self.scratch)
    }

    async fn read_body(&mut self) -> Result<Bytes> {
        self.read_line().await?;
        Ok(Bytes::copy_from_slice(&self.scratch))
    }

    async fn discard_body(&mut self) -> Result<()> {
        self.read_line().await
    }
}

/// Write half of the JSON codec.
pub struct JsonWriter<W: AsyncWrite> {
    writer: BufWriter<W>,
    closed: bool,
}

impl<W> JsonWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            closed: false,
        }
    }

    async fn write_unit(&mut self, header: &[u8], body: &[u8]) -> Result<()> {
        self.writer.write_all(header).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.write_all(body).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut the stream down without flushing a partly written frame.
    async fn abort(&mut self) {
        self.closed = true;
        if let Err(err) = self.writer.get_mut().shutdown().await {
            tracing::debug!(error = %err, "json codec: error shutting down stream");
        }
    }
}

#[async_trait]
impl<W> FrameWriter for JsonWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn codec_type(&self) -> CodecType {
        CodecType::Json
    }

    async fn write_frame(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Shutdown);
        }
        if body.len() > MAX_FRAME_LEN as usize {
            return Err(Error::FrameTooLarge(body.len()));
        }
        if body.contains(&b'\n') {
            return Err(Error::Encode("json body contains a raw newline".into()));
        }
        let header = CodecType::Json.encode(header)?;
        if header.len() > MAX_FRAME_LEN as usize {
            return Err(Error::FrameTooLarge(header.len()));
        }
        if let Err(err) = self.write_unit(&header, body).await {
            tracing::warn!(error = %err, "json codec: error writing frame");
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
    async fn test_frame_layout_is_two_lines() {
        let mut out = Vec::new();
        {
            let mut writer = JsonWriter::new(&mut out);
            let body = CodecType::Json.encode(&42).unwrap();
            writer
                .write_frame(&Header::request("Arith.Multiply", 3), &body)
                .await
                .unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "{\"serviceMethod\":\"Arith.Multiply\",\"seq\":3,\"error\":\"\"}\n42\n"
        );
    }

    #[tokio::test]
    async fn test_discard_skips_to_next_header() {
        let input = b"{\"serviceMethod\":\"A.B\",\"seq\":1,\"error\":\"\"}\n{\"big\":[1,2,3]}\n\
                      {\"serviceMethod\":\"A.B\",\"seq\":2,\"error\":\"\"}\n7\n";
        let mut reader = JsonReader::new(BufReader::new(&input[..]));

        assert_eq!(reader.read_header().await.unwrap().seq, 1);
        reader.discard_body().await.unwrap();
        assert_eq!(reader.read_header().await.unwrap().seq, 2);
        let body = reader.read_body().await.unwrap();
        assert_eq!(CodecType::Json.decode::<i32>(&body).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_eof() {
        let input = b"{\"serviceMethod\":\"A.B\"";
        let mut reader = JsonReader::new(BufReader::new(&input[..]));
        assert!(matches!(reader.read_header().await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_before_writing() {
        let mut out = Vec::new();
        {
            let mut writer = JsonWriter::new(&mut out);
            let huge = vec![b'7'; MAX_FRAME_LEN as usize + 1];
            let err = writer
                .write_frame(&Header::request("Big.Blob", 1), &huge)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::FrameTooLarge(_)));

            writer
                .write_frame(&Header::request("Big.Blob", 2), b"1")
                .await
                .unwrap();
        }
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"serviceMethod\":\"Big.Blob\",\"seq\":2,\"error\":\"\"}\n1\n"
        );
    }

    #[tokio::test]
    async fn test_partial_write_shuts_stream_down() {
        let (stream, shut_down) = FailAfter::new(10);
        let mut writer = JsonWriter::new(stream);

        let err = writer
            .write_frame(&Header::request("Arith.Multiply", 1), b"42")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(shut_down.load(Ordering::SeqCst));

        let err = writer
            .write_frame(&Header::request("Arith.Multiply", 2), b"42")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}
