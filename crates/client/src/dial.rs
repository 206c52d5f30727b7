//! Establishing connections.
//!
//! Every dial goes through the same steps:
//!
//! 1. Resolve the caller's options (zero or one `Options`).
//! 2. Open the transport, bounded by `connect_timeout`.
//! 3. Run the handshake (optional HTTP CONNECT, then the option record) on
//!    a background task and race it against the same bound. On timeout the
//!    task is aborted, which drops and closes the half-open stream.
//!
//! A zero `connect_timeout` waits indefinitely at both steps.

use std::future::Future;
use std::io;

use corelib::http::{read_head, CONNECTED, DEFAULT_RPC_PATH};
use corelib::{Error, Options, Result, MAGIC_NUMBER};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::client::Client;

/// Pick the options for a dial.
///
/// Accepts anything that yields at most one `Options`: `None`,
/// `Some(opts)` or `[opts]`. No options means defaults; more than one is
/// [`Error::TooManyOptions`]. The magic number is always the protocol's own.
pub fn resolve_options<I>(opts: I) -> Result<Options>
where
    I: IntoIterator<Item = Options>,
{
    let mut opts = opts.into_iter();
    let Some(mut opt) = opts.next() else {
        return Ok(Options::default());
    };
    if opts.next().is_some() {
        return Err(Error::TooManyOptions);
    }
    opt.magic_number = MAGIC_NUMBER;
    Ok(opt)
}

async fn dial_with<S, C, H, Fut>(opt: Options, connect: C, handshake: H) -> Result<Client>
where
    S: Send + 'static,
    C: Future<Output = io::Result<S>>,
    H: FnOnce(S, Options) -> Fut,
    Fut: Future<Output = Result<Client>> + Send + 'static,
{
    let timeout = opt.connect_timeout;
    let stream = if timeout.is_zero() {
        connect.await?
    } else {
        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| Error::ConnectTimeout(timeout))??
    };

    let mut task = tokio::spawn(handshake(stream, opt));
    if timeout.is_zero() {
        return task.await.map_err(join_error)?;
    }
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(joined) => joined.map_err(join_error)?,
        Err(_) => {
            task.abort();
            tracing::warn!(?timeout, "rpc client: connect timeout");
            Err(Error::ConnectTimeout(timeout))
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, err))
}

/// Connect over TCP.
pub async fn dial<I>(addr: &str, opts: I) -> Result<Client>
where
    I: IntoIterator<Item = Options>,
{
    let opt = resolve_options(opts)?;
    tracing::debug!(addr, codec = %opt.codec_type, "rpc client: dial tcp");
    dial_with(opt, TcpStream::connect(addr), Client::new).await
}

/// Connect over a unix domain socket.
#[cfg(unix)]
pub async fn dial_unix<I>(path: &str, opts: I) -> Result<Client>
where
    I: IntoIterator<Item = Options>,
{
    let opt = resolve_options(opts)?;
    tracing::debug!(path, codec = %opt.codec_type, "rpc client: dial unix");
    dial_with(opt, tokio::net::UnixStream::connect(path), Client::new).await
}

/// Connect over TCP through the server's HTTP CONNECT endpoint.
pub async fn dial_http<I>(addr: &str, opts: I) -> Result<Client>
where
    I: IntoIterator<Item = Options>,
{
    let opt = resolve_options(opts)?;
    tracing::debug!(addr, codec = %opt.codec_type, "rpc client: dial http");
    dial_with(opt, TcpStream::connect(addr), http_handshake).await
}

/// Dial an address of the form `protocol@addr`.
///
/// `http@host:port` goes through HTTP CONNECT, `tcp@host:port` and (on
/// unix) `unix@/path/to.sock` connect directly. A malformed address fails
/// before any connection is attempted.
pub async fn xdial<I>(rpc_addr: &str, opts: I) -> Result<Client>
where
    I: IntoIterator<Item = Options>,
{
    let (protocol, addr) = parse_rpc_addr(rpc_addr)?;
    match protocol {
        "http" => dial_http(addr, opts).await,
        "tcp" => dial(addr, opts).await,
        #[cfg(unix)]
        "unix" => dial_unix(addr, opts).await,
        other => Err(Error::UnsupportedProtocol(other.to_string())),
    }
}

/// Split `protocol@addr`.
pub fn parse_rpc_addr(rpc_addr: &str) -> Result<(&str, &str)> {
    let mut parts = rpc_addr.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(protocol), Some(addr), None) if !protocol.is_empty() && !addr.is_empty() => {
            Ok((protocol, addr))
        }
        _ => Err(Error::BadAddress(rpc_addr.to_string())),
    }
}

/// Ask for the RPC endpoint, then negotiate on the same stream.
pub async fn http_handshake<S>(mut stream: S, opt: Options) -> Result<Client>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let request = format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let head = read_head(&mut reader).await?;
    let status = parse_status(&head)?;
    if status != CONNECTED {
        return Err(Error::HttpStatus(status));
    }
    Client::new(reader, opt).await
}

/// `"<code> <reason>"` from a response head.
fn parse_status(head: &[u8]) -> Result<String> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => Ok(format!(
            "{} {}",
            response.code.unwrap_or_default(),
            response.reason.unwrap_or_default()
        )),
        Ok(httparse::Status::Partial) => Err(Error::HttpStatus("incomplete response head".into())),
        Err(err) => Err(Error::HttpStatus(format!("malformed response: {err}"))),
    }
}
