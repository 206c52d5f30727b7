//! HTTP bridge.
//!
//! Lets RPC traffic pass through HTTP-aware intermediaries: the client sends
//! `CONNECT` to [`DEFAULT_RPC_PATH`], the server answers with the
//! [`CONNECTED`] status and then treats the rest of the socket as a plain
//! RPC connection.
//!
//! Two more routes exist:
//!
//! | Request                         | Response                        |
//! |---------------------------------|---------------------------------|
//! | `GET` [`DEFAULT_DEBUG_PATH`]    | text listing of services        |
//! | anything else on the RPC path   | `405 must CONNECT`              |
//! | anything else                   | `404 not found`                 |

use std::fmt::Write as _;
use std::sync::Arc;

use corelib::http::{read_head, CONNECTED, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};
use corelib::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::server::Server;

impl Server {
    /// Accept HTTP connections forever.
    pub async fn accept_http(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(error = %err, "rpc server: http accept error");
                    return Err(err.into());
                }
            };
            let server = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = server.serve_http_conn(stream).await {
                    tracing::warn!(%peer, error = %err, "rpc server: http connection dropped");
                }
            });
        }
    }

    /// Handle one HTTP connection.
    ///
    /// A successful CONNECT hands the stream to [`Server::serve_io`] and
    /// returns its request count; the other routes return `0`.
    pub async fn serve_http_conn<S>(&self, stream: S) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let head = read_head(&mut reader).await?;

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut request = httparse::Request::new(&mut headers);
        let parsed = request.parse(&head);
        let (method, path) = match (parsed, request.method, request.path) {
            (Ok(httparse::Status::Complete(_)), Some(method), Some(path)) => {
                (method.to_string(), path.to_string())
            }
            _ => {
                write_plain(&mut write_half, "400 Bad Request", "400 bad request\n").await?;
                return Err(Error::HttpStatus("malformed request head".into()));
            }
        };

        match (method.as_str(), path.as_str()) {
            ("CONNECT", DEFAULT_RPC_PATH) => {
                write_half
                    .write_all(format!("HTTP/1.0 {CONNECTED}\r\n\r\n").as_bytes())
                    .await?;
                write_half.flush().await?;
                tracing::debug!("rpc server: http connect");
                self.serve_io(reader, write_half).await
            }
            (_, DEFAULT_RPC_PATH) => {
                write_plain(&mut write_half, "405 Method Not Allowed", "405 must CONNECT\n").await?;
                Ok(0)
            }
            ("GET", DEFAULT_DEBUG_PATH) => {
                write_plain(&mut write_half, "200 OK", &self.debug_text()).await?;
                Ok(0)
            }
            _ => {
                write_plain(&mut write_half, "404 Not Found", "404 not found\n").await?;
                Ok(0)
            }
        }
    }

    /// Plain-text listing of services, methods and call counts.
    pub fn debug_text(&self) -> String {
        let mut out = String::new();
        for service in self.registry().services() {
            let _ = writeln!(out, "Service {}", service.name());
            for method in service.methods() {
                let _ = writeln!(
                    out,
                    "\t{}({}) -> {}\tcalls={}",
                    method.name(),
                    method.arg_type(),
                    method.reply_type(),
                    method.num_calls()
                );
            }
        }
        out
    }
}

async fn write_plain<W>(writer: &mut W, status: &str, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.0 {status}\r\nContent-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    );
    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::Service;
    use tokio::io::AsyncReadExt;

    fn server() -> Server {
        let server = Server::new();
        server
            .register(
                Service::builder("Arith", ())
                    .method("Multiply", |_, (a, b): (i64, i64)| async move {
                        Ok::<_, String>(a * b)
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        server
    }

    async fn roundtrip(request: &str) -> String {
        let server = server();
        let (mut client, server_io) = tokio::io::duplex(4096);
        client.write_all(request.as_bytes()).await.unwrap();
        server.serve_http_conn(server_io).await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_get_on_rpc_path_is_405() {
        let response = roundtrip("GET /_muxrpc_ HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.0 405"));
        assert!(response.ends_with("405 must CONNECT\n"));
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let response = roundtrip("GET /elsewhere HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.0 404"));
    }

    #[tokio::test]
    async fn test_debug_page_lists_methods() {
        let response = roundtrip("GET /debug/muxrpc HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.0 200 OK"));
        assert!(response.contains("Service Arith"));
        assert!(response.contains("Multiply((i64, i64)) -> i64\tcalls=0"));
    }
}
