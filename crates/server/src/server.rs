//! Server connection loop.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Negotiating ──► Serving ──► Draining ──► Closed
//!      │
//!      └─ bad option record: dropped, nothing written
//! ```
//!
//! - **Negotiating**: read and validate the option record.
//! - **Serving**: read requests one after another. Each decoded request runs
//!   as its own task; responses share one sending lock so frames never
//!   interleave, though they may leave in any order.
//! - **Draining**: the read side is done; wait for every in-flight response.
//! - **Closed**: the codec is closed once.
//!
//! # Handle Timeout
//!
//! With a positive handle timeout a slow handler gets a timeout response in
//! its place. The handler itself is not cancelled: it keeps running on its
//! own task and whatever it returns later is dropped.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use corelib::service::Invocation;
use corelib::{
    new_codec, BoxReader, BoxWriter, Error, FrameReader, Header, Options, Receiver, Registry,
    Result, Service,
};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

/// Per-connection state, reported in trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Negotiating,
    Serving,
    Draining,
    Closed,
}

/// Shared, serialized access to a connection's write half.
type Sending = Arc<Mutex<BoxWriter>>;

/// Why reading a request failed.
enum RequestError {
    /// The header was read; answer with this error and keep serving.
    Call(Error),
    /// The stream is unusable.
    Fatal(Error),
}

impl From<Error> for RequestError {
    fn from(err: Error) -> Self {
        if err.is_connection_fatal() {
            RequestError::Fatal(err)
        } else {
            RequestError::Call(err)
        }
    }
}

/// RPC server: a service registry plus the loops that serve it.
#[derive(Debug, Default)]
pub struct Server {
    registry: Registry,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prepared service.
    pub fn register(&self, service: Service) -> Result<()> {
        self.registry.register(service)
    }

    /// Build a service from a [`Receiver`] and register it.
    pub fn register_receiver<T: Receiver>(&self, receiver: T) -> Result<()> {
        self.register(Service::new(receiver)?)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Accept TCP connections forever, serving each on its own task.
    ///
    /// Returns only when `accept` itself fails.
    pub async fn accept(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(error = %err, "rpc server: accept error");
                    return Err(err.into());
                }
            };
            let server = Arc::clone(self);
            tokio::spawn(async move {
                match server.serve_conn(stream).await {
                    Ok(requests) => {
                        tracing::debug!(%peer, requests, "rpc server: connection closed")
                    }
                    Err(err) => {
                        tracing::warn!(%peer, error = %err, "rpc server: connection dropped")
                    }
                }
            });
        }
    }

    /// Accept unix socket connections forever.
    #[cfg(unix)]
    pub async fn accept_unix(self: &Arc<Self>, listener: tokio::net::UnixListener) -> Result<()> {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(error = %err, "rpc server: accept error");
                    return Err(err.into());
                }
            };
            let server = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = server.serve_conn(stream).await {
                    tracing::warn!(error = %err, "rpc server: connection dropped");
                }
            });
        }
    }

    /// Serve one connection until the peer goes away.
    ///
    /// Returns the number of requests read, or the negotiation error that
    /// got the connection dropped.
    pub async fn serve_conn<S>(&self, stream: S) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        self.serve_io(BufReader::new(read_half), write_half).await
    }

    /// Serve one connection given as separate halves.
    ///
    /// `reader` must not have consumed anything past what precedes the
    /// option record.
    pub async fn serve_io<R, W>(&self, mut reader: R, writer: W) -> Result<u64>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tracing::trace!(state = ?ConnState::Negotiating, "rpc server: connection state");
        let opt = match Options::read_from(&mut reader).await {
            Ok(opt) => opt,
            Err(err) => {
                tracing::warn!(error = %err, "rpc server: options error");
                return Err(err);
            }
        };
        tracing::debug!(
            codec = %opt.codec_type,
            handle_timeout = ?opt.handle_timeout,
            "rpc server: negotiated"
        );
        let (reader, writer) = new_codec(opt.codec_type, reader, writer);
        Ok(self.serve_codec(reader, writer, opt.handle_timeout).await)
    }

    /// Serve requests over an already negotiated codec pair.
    pub async fn serve_codec(
        &self,
        mut reader: BoxReader,
        writer: BoxWriter,
        handle_timeout: Duration,
    ) -> u64 {
        tracing::trace!(state = ?ConnState::Serving, "rpc server: connection state");
        let sending: Sending = Arc::new(Mutex::new(writer));
        let mut in_flight = JoinSet::new();
        let mut requests = 0u64;

        loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(err) => {
                    log_read_error(&err);
                    break;
                }
            };
            requests += 1;

            match self.read_request(reader.as_mut(), &header).await {
                Ok(invocation) => {
                    let sending = Arc::clone(&sending);
                    in_flight.spawn(handle_request(sending, header, invocation, handle_timeout));
                }
                Err(RequestError::Call(err)) => {
                    tracing::debug!(
                        seq = header.seq,
                        service_method = %header.service_method,
                        error = %err,
                        "rpc server: bad request"
                    );
                    send_error(&sending, header.with_error(err)).await;
                }
                Err(RequestError::Fatal(err)) => {
                    log_read_error(&err);
                    break;
                }
            }
            while in_flight.try_join_next().is_some() {}
        }

        tracing::trace!(
            state = ?ConnState::Draining,
            in_flight = in_flight.len(),
            "rpc server: connection state"
        );
        while in_flight.join_next().await.is_some() {}

        if let Err(err) = sending.lock().await.close().await {
            tracing::debug!(error = %err, "rpc server: error closing codec");
        }
        tracing::trace!(state = ?ConnState::Closed, "rpc server: connection state");
        requests
    }

    /// Resolve the target and decode the arguments that follow `header`.
    ///
    /// The body is always consumed, so a bad request leaves the stream
    /// positioned at the next header.
    async fn read_request(
        &self,
        reader: &mut dyn FrameReader,
        header: &Header,
    ) -> std::result::Result<Invocation, RequestError> {
        let method = match self.registry.resolve(&header.service_method) {
            Ok((_, method)) => method,
            Err(err) => {
                reader.discard_body().await?;
                return Err(RequestError::Call(err));
            }
        };
        let raw = reader.read_body().await?;
        Ok(method.prepare(reader.codec_type(), &raw)?)
    }
}

/// Run one request and write its single response.
async fn handle_request(
    sending: Sending,
    header: Header,
    invocation: Invocation,
    handle_timeout: Duration,
) {
    tracing::trace!(
        seq = header.seq,
        method = invocation.method().name(),
        "rpc server: dispatch"
    );
    let mut task = tokio::spawn(invocation.dispatch());

    let outcome = if handle_timeout.is_zero() {
        Some((&mut task).await)
    } else {
        tokio::time::timeout(handle_timeout, &mut task).await.ok()
    };

    match outcome {
        Some(Ok(Ok(reply))) => send_response(&sending, &header, &reply).await,
        Some(Ok(Err(message))) => send_error(&sending, header.with_error(message)).await,
        Some(Err(join_err)) => {
            tracing::error!(seq = header.seq, error = %join_err, "rpc server: handler panicked");
            send_error(&sending, header.with_error(format!("handler failed: {join_err}"))).await;
        }
        None => {
            // Dropping the handle detaches the handler; it runs on unobserved.
            tracing::warn!(
                seq = header.seq,
                service_method = %header.service_method,
                ?handle_timeout,
                "rpc server: handle timeout"
            );
            send_error(&sending, header.with_error(Error::HandleTimeout(handle_timeout))).await;
        }
    }
}

/// Write a reply. A reply the codec refuses before writing anything is
/// answered with an error response instead, so the caller still hears back.
async fn send_response(sending: &Sending, header: &Header, body: &Bytes) {
    let mut writer = sending.lock().await;
    match writer.write_frame(header, body).await {
        Ok(()) => {}
        Err(err @ (Error::FrameTooLarge(_) | Error::Encode(_))) => {
            drop(writer);
            tracing::warn!(
                seq = header.seq,
                error = %err,
                "rpc server: reply rejected by codec"
            );
            send_error(sending, header.clone().with_error(err)).await;
        }
        Err(err) => {
            tracing::warn!(seq = header.seq, error = %err, "rpc server: write response error");
        }
    }
}

/// Error responses carry an empty placeholder body.
async fn send_error(sending: &Sending, header: Header) {
    let mut writer = sending.lock().await;
    let placeholder = match writer.codec_type().encode(&()) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(error = %err, "rpc server: encode placeholder");
            return;
        }
    };
    if let Err(err) = writer.write_frame(&header, &placeholder).await {
        tracing::warn!(seq = header.seq, error = %err, "rpc server: write response error");
    }
}

fn log_read_error(err: &Error) {
    match err {
        Error::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            tracing::trace!("rpc server: peer closed")
        }
        other => tracing::warn!(error = %other, "rpc server: read error"),
    }
}
