//! Connection options exchanged once before any call traffic.
//!
//! # Wire Layout
//!
//! ```text
//! | Option record (JSON, one line) | Header | Body | Header | Body | ...
//! | <----- fixed encoding -------> | <------ negotiated codec ------> |
//! ```
//!
//! The record is always JSON regardless of the codec it selects, so a server
//! can read it before it knows how to decode anything else.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::CodecType;
use crate::error::{Error, Result};

/// Marks a stream as speaking this protocol.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Upper bound on the encoded option record, newline included.
pub const MAX_OPTION_LEN: usize = 4 * 1024;

/// Default bound on connect plus option exchange.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Negotiated per-connection settings.
///
/// Created once per connection and immutable afterwards. A zero duration
/// means "no bound" for both timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub magic_number: u32,
    pub codec_type: CodecType,
    /// Client-side bound on establishing the connection.
    pub connect_timeout: Duration,
    /// Server-side bound on how long a handler may run before a timeout reply.
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

/// Textual form of [`Options`]; durations travel as whole milliseconds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionRecord {
    magic_number: u32,
    codec_type: String,
    connect_timeout: u64,
    handle_timeout: u64,
}

impl Options {
    pub fn with_codec(mut self, codec_type: CodecType) -> Self {
        self.codec_type = codec_type;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    /// Encode as a single newline-terminated JSON line.
    pub fn encode_line(&self) -> Result<Vec<u8>> {
        let record = OptionRecord {
            magic_number: self.magic_number,
            codec_type: self.codec_type.to_string(),
            connect_timeout: duration_to_millis(self.connect_timeout),
            handle_timeout: duration_to_millis(self.handle_timeout),
        };
        let mut line = serde_json::to_vec(&record).map_err(|e| Error::Encode(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }

    /// Parse and validate one encoded line.
    ///
    /// The magic number is checked before the codec so a foreign protocol is
    /// reported as such even if it happens to carry a codec field.
    pub fn decode_line(line: &[u8]) -> Result<Self> {
        let record: OptionRecord =
            serde_json::from_slice(line).map_err(|e| Error::Decode(e.to_string()))?;
        if record.magic_number != MAGIC_NUMBER {
            return Err(Error::MagicMismatch(record.magic_number));
        }
        let codec_type = record.codec_type.parse()?;
        Ok(Self {
            magic_number: record.magic_number,
            codec_type,
            connect_timeout: Duration::from_millis(record.connect_timeout),
            handle_timeout: Duration::from_millis(record.handle_timeout),
        })
    }

    /// Write the record to a stream and flush it.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let line = self.encode_line()?;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly one record from a buffered stream.
    ///
    /// Bytes after the newline stay buffered in `reader` for the codec.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = Vec::with_capacity(128);
        let n = reader
            .take(MAX_OPTION_LEN as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        if line.last() != Some(&b'\n') {
            if n >= MAX_OPTION_LEN {
                return Err(Error::FrameTooLarge(n));
            }
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        Self::decode_line(&line)
    }
}

fn duration_to_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_default_options() {
        let opt = Options::default();
        assert_eq!(opt.magic_number, MAGIC_NUMBER);
        assert_eq!(opt.codec_type, CodecType::Json);
        assert_eq!(opt.connect_timeout, Duration::from_secs(10));
        assert_eq!(opt.handle_timeout, Duration::ZERO);
    }

    #[test]
    fn test_line_is_camel_case_json() {
        let opt = Options::default().with_handle_timeout(Duration::from_millis(250));
        let line = opt.encode_line().unwrap();
        let text = std::str::from_utf8(&line).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains(r#""magicNumber":3927900"#));
        assert!(text.contains(r#""codecType":"application/json""#));
        assert!(text.contains(r#""handleTimeout":250"#));
        assert_eq!(Options::decode_line(&line).unwrap(), opt);
    }

    #[test]
    fn test_magic_mismatch() {
        let mut opt = Options::default();
        opt.magic_number = 0x1234;
        let line = opt.encode_line().unwrap();
        assert!(matches!(
            Options::decode_line(&line),
            Err(Error::MagicMismatch(0x1234))
        ));
    }

    #[test]
    fn test_unknown_codec() {
        let line = concat!(
            r#"{"magicNumber":3927900,"codecType":"application/gob","#,
            r#""connectTimeout":0,"handleTimeout":0}"#
        );
        assert!(matches!(
            Options::decode_line(line.as_bytes()),
            Err(Error::UnsupportedCodec(name)) if name == "application/gob"
        ));
    }

    #[tokio::test]
    async fn test_read_leaves_trailing_bytes_buffered() {
        let mut bytes = Options::default().encode_line().unwrap();
        bytes.extend_from_slice(b"rest");
        let mut reader = BufReader::new(&bytes[..]);

        Options::read_from(&mut reader).await.unwrap();

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "rest");
    }

    #[tokio::test]
    async fn test_oversized_record_rejected() {
        let bytes = vec![b' '; MAX_OPTION_LEN * 2];
        let mut reader = BufReader::new(&bytes[..]);
        assert!(matches!(
            Options::read_from(&mut reader).await,
            Err(Error::FrameTooLarge(_))
        ));
    }
}
