//! Constants and helpers for the HTTP CONNECT bootstrap.
//!
//! ```text
//! client: CONNECT /_muxrpc_ HTTP/1.0\r\n\r\n
//! server: HTTP/1.0 200 Connected to muxrpc\r\n\r\n
//! ...then the plain RPC stream (option record, frames) on the same socket
//! ```

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};

/// Path the RPC endpoint answers CONNECT on.
pub const DEFAULT_RPC_PATH: &str = "/_muxrpc_";

/// Path of the plain-text service listing.
pub const DEFAULT_DEBUG_PATH: &str = "/debug/muxrpc";

/// Status (code and reason) that switches the stream to RPC.
pub const CONNECTED: &str = "200 Connected to muxrpc";

/// Upper bound on a request or response head.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// Read an HTTP head up to and including the blank line.
///
/// Reads line by line so nothing past the head is consumed from `reader`.
pub async fn read_head<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    loop {
        let budget = (MAX_HEAD_LEN + 1).saturating_sub(head.len()) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        if head.ends_with(b"\r\n\r\n")
            || head.ends_with(b"\n\n")
            || head == b"\r\n"
            || head == b"\n"
        {
            return Ok(head);
        }
        if head.len() > MAX_HEAD_LEN {
            return Err(Error::FrameTooLarge(head.len()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_head_stops_at_blank_line() {
        let input = b"HTTP/1.0 200 Connected to muxrpc\r\n\r\n{\"after\":1}\n";
        let mut reader = BufReader::new(&input[..]);
        let head = read_head(&mut reader).await.unwrap();
        assert_eq!(head, b"HTTP/1.0 200 Connected to muxrpc\r\n\r\n");

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "{\"after\":1}\n");
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let input = b"HTTP/1.0 200 Conn";
        let mut reader = BufReader::new(&input[..]);
        assert!(read_head(&mut reader).await.is_err());
    }
}
