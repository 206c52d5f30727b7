//! Call multiplexer.
//!
//! One [`Client`] owns one connection. Any number of calls may be in flight
//! at once; each gets a fresh sequence number and replies are matched back
//! by that number, so the order replies arrive in does not matter.
//!
//! # Architecture
//!
//! ```text
//!   go() / call()                               receive loop (one task)
//!        │                                              │
//!        ├─ sending lock ─► register seq ─► write ──►   │ ◄── read header
//!        │                  (pending table)             │        │
//!        │                                              │   pending[seq]?
//!        │                                              │    ├─ no:  discard body
//!        │                                              │    ├─ err: discard body, complete
//!        ▼                                              │    └─ ok:  read body, complete
//!   CompletionQueue ◄───────────────────────────────────┘
//! ```
//!
//! Every registered call is completed exactly once: by its reply, by a
//! failed write, or by connection teardown. A call removed by cancellation
//! is never completed; its late reply finds no pending entry and is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use corelib::{new_codec, BoxReader, BoxWriter, CodecType, Error, Header, Options, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// Capacity used by [`CompletionQueue::with_default_capacity`].
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// A finished call, delivered through a [`CompletionQueue`].
#[derive(Debug)]
pub struct Call {
    pub seq: u64,
    pub service_method: String,
    /// Encoded reply body, present only on success.
    reply: Option<Bytes>,
    pub error: Option<Error>,
    codec_type: CodecType,
}

impl Call {
    fn completed(pending: &Pending, outcome: Result<Bytes>) -> Self {
        let (reply, error) = match outcome {
            Ok(body) => (Some(body), None),
            Err(err) => (None, Some(err)),
        };
        Self {
            seq: pending.seq,
            service_method: pending.service_method.clone(),
            reply,
            error,
            codec_type: pending.codec_type,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Decode the reply, or return the call's error.
    pub fn into_reply<R: DeserializeOwned>(self) -> Result<R> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let body = self.reply.unwrap_or_default();
        self.codec_type
            .decode(&body)
            .map_err(|e| Error::Decode(format!("reading body {e}")))
    }
}

/// Sending side of a completion queue.
///
/// Cheap to clone; many calls can share one queue.
#[derive(Debug, Clone)]
pub enum CompletionQueue {
    Bounded(mpsc::Sender<Call>),
    Unbounded(mpsc::UnboundedSender<Call>),
}

/// Receiving side of a completion queue.
#[derive(Debug)]
pub enum Completions {
    Bounded(mpsc::Receiver<Call>),
    Unbounded(mpsc::UnboundedReceiver<Call>),
}

impl CompletionQueue {
    /// A queue holding up to `capacity` finished calls.
    ///
    /// Zero capacity is rejected: the receive loop would have nowhere to put
    /// a finished call and would stall the whole connection.
    pub fn bounded(capacity: usize) -> Result<(Self, Completions)> {
        if capacity == 0 {
            return Err(Error::ZeroCapacityQueue);
        }
        let (tx, rx) = mpsc::channel(capacity);
        Ok((CompletionQueue::Bounded(tx), Completions::Bounded(rx)))
    }

    pub fn unbounded() -> (Self, Completions) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CompletionQueue::Unbounded(tx), Completions::Unbounded(rx))
    }

    pub fn with_default_capacity() -> (Self, Completions) {
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        (CompletionQueue::Bounded(tx), Completions::Bounded(rx))
    }

    /// Hand a finished call to whoever waits on the queue.
    ///
    /// A dropped receiver is not an error: the caller stopped listening.
    async fn deliver(&self, call: Call) {
        let delivered = match self {
            CompletionQueue::Bounded(tx) => tx.send(call).await.is_ok(),
            CompletionQueue::Unbounded(tx) => tx.send(call).is_ok(),
        };
        if !delivered {
            tracing::trace!("completion queue receiver dropped");
        }
    }
}

impl Completions {
    /// Next finished call, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Call> {
        match self {
            Completions::Bounded(rx) => rx.recv().await,
            Completions::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Entry in the pending-call table.
struct Pending {
    seq: u64,
    service_method: String,
    codec_type: CodecType,
    done: CompletionQueue,
}

impl Pending {
    async fn complete(self, outcome: Result<Bytes>) {
        let call = Call::completed(&self, outcome);
        self.done.deliver(call).await;
    }
}

/// Pending-call table and connection flags, guarded together.
struct State {
    seq: u64,
    pending: HashMap<u64, Pending>,
    /// The user called `close`.
    closing: bool,
    /// The receive loop has torn the connection down.
    shutdown: bool,
}

struct Inner {
    options: Options,
    /// Sending lock: serializes frames on the connection.
    sending: tokio::sync::Mutex<BoxWriter>,
    state: Mutex<State>,
    close_signal: Notify,
}

impl Inner {
    fn register(&self, service_method: &str, done: &CompletionQueue) -> Result<u64> {
        let mut state = self.state.lock();
        if state.closing || state.shutdown {
            return Err(Error::Shutdown);
        }
        let seq = state.seq;
        state.seq += 1;
        state.pending.insert(
            seq,
            Pending {
                seq,
                service_method: service_method.to_string(),
                codec_type: self.options.codec_type,
                done: done.clone(),
            },
        );
        Ok(seq)
    }

    fn remove(&self, seq: u64) -> Option<Pending> {
        self.state.lock().pending.remove(&seq)
    }

    fn request_close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closing {
            return false;
        }
        state.closing = true;
        drop(state);
        self.close_signal.notify_one();
        true
    }

    /// Tear down: no more frames, every pending call fails with `Shutdown`.
    async fn terminate(&self, cause: &Error) {
        let drained: Vec<Pending> = {
            let mut writer = self.sending.lock().await;
            let drained = {
                let mut state = self.state.lock();
                state.shutdown = true;
                state.pending.drain().map(|(_, pending)| pending).collect()
            };
            if let Err(err) = writer.close().await {
                tracing::debug!(error = %err, "rpc client: error closing codec");
            }
            drained
        };
        tracing::debug!(
            cause = %cause,
            pending = drained.len(),
            "rpc client: connection terminated"
        );
        for pending in drained {
            pending.complete(Err(Error::Shutdown)).await;
        }
    }

    async fn receive(self: Arc<Self>, mut reader: BoxReader) {
        let cause = loop {
            let header = tokio::select! {
                _ = self.close_signal.notified() => break Error::Shutdown,
                read = reader.read_header() => match read {
                    Ok(header) => header,
                    Err(err) => break err,
                },
            };
            if let Err(err) = self.route(&mut reader, header).await {
                break err;
            }
        };
        self.terminate(&cause).await;
    }

    /// Deliver one response to its pending call.
    async fn route(&self, reader: &mut BoxReader, header: Header) -> Result<()> {
        match self.remove(header.seq) {
            None => {
                tracing::debug!(seq = header.seq, "rpc client: discarding orphaned reply");
                reader.discard_body().await
            }
            Some(pending) if header.is_error() => {
                let read = reader.discard_body().await;
                pending.complete(Err(Error::Remote(header.error))).await;
                read
            }
            Some(pending) => match reader.read_body().await {
                Ok(body) => {
                    pending.complete(Ok(body)).await;
                    Ok(())
                }
                Err(err) => {
                    pending
                        .complete(Err(Error::Decode(format!("reading body {err}"))))
                        .await;
                    Err(err)
                }
            },
        }
    }
}

/// Closes the connection when the last user handle goes away.
struct CloseOnDrop(Arc<Inner>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.request_close();
    }
}

/// Handle to one multiplexed connection.
///
/// Clones share the connection. It is closed by [`Client::close`] or once
/// the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
    _guard: Arc<CloseOnDrop>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("codec_type", &self.inner.options.codec_type)
            .field("available", &self.is_available())
            .finish()
    }
}

impl Client {
    /// Send the option record over `stream` and start the receive loop.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn new<S>(stream: S, options: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        if let Err(err) = options.write_to(&mut write_half).await {
            tracing::warn!(error = %err, "rpc client: options error");
            return Err(err);
        }
        let (reader, writer) = new_codec(options.codec_type, BufReader::new(read_half), write_half);
        Ok(Self::with_codec(reader, writer, options))
    }

    /// Wrap an already negotiated codec pair.
    pub fn with_codec(reader: BoxReader, writer: BoxWriter, options: Options) -> Self {
        let inner = Arc::new(Inner {
            options,
            sending: tokio::sync::Mutex::new(writer),
            state: Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            close_signal: Notify::new(),
        });
        tokio::spawn(Arc::clone(&inner).receive(reader));
        Self {
            _guard: Arc::new(CloseOnDrop(Arc::clone(&inner))),
            inner,
        }
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// True until the client is closed or the connection is torn down.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock();
        !state.closing && !state.shutdown
    }

    /// Number of calls waiting for a reply.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Close the connection.
    ///
    /// Pending calls are completed with [`Error::Shutdown`] by the receive
    /// loop. A second call returns [`Error::AlreadyClosed`] and does nothing.
    pub fn close(&self) -> Result<()> {
        if self.inner.request_close() {
            Ok(())
        } else {
            Err(Error::AlreadyClosed)
        }
    }

    /// Start a call without waiting for its reply.
    ///
    /// The finished [`Call`] is delivered to `done`, including when the
    /// connection is already shut down or the write fails. Returns the
    /// sequence number, or `0` if the call never got one. Only a failure
    /// to encode `args` is returned directly, before anything is sent.
    pub async fn go<A>(&self, service_method: &str, args: &A, done: CompletionQueue) -> Result<u64>
    where
        A: Serialize + ?Sized,
    {
        let body = self.inner.options.codec_type.encode(args)?;
        Ok(self.send(service_method, body, done).await)
    }

    async fn send(&self, service_method: &str, body: Bytes, done: CompletionQueue) -> u64 {
        let mut writer = self.inner.sending.lock().await;
        let seq = match self.inner.register(service_method, &done) {
            Ok(seq) => seq,
            Err(err) => {
                drop(writer);
                let pending = Pending {
                    seq: 0,
                    service_method: service_method.to_string(),
                    codec_type: self.inner.options.codec_type,
                    done,
                };
                pending.complete(Err(err)).await;
                return 0;
            }
        };

        let header = Header::request(service_method, seq);
        if let Err(err) = writer.write_frame(&header, &body).await {
            drop(writer);
            tracing::warn!(seq, service_method, error = %err, "rpc client: write failed");
            if let Some(pending) = self.inner.remove(seq) {
                pending.complete(Err(err)).await;
            }
        }
        seq
    }

    /// Call and wait for the reply, giving up when `cancel` fires.
    ///
    /// Cancellation only stops the wait: a request already written still
    /// runs on the server and its reply is discarded on arrival.
    pub async fn call<A, R>(
        &self,
        cancel: &CancellationToken,
        service_method: &str,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_until(cancel.cancelled(), service_method, args).await
    }

    /// Call and wait for the reply for at most `timeout`.
    pub async fn call_timeout<A, R>(
        &self,
        timeout: Duration,
        service_method: &str,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_until(tokio::time::sleep(timeout), service_method, args)
            .await
    }

    async fn call_until<A, R, F>(
        &self,
        cancelled: F,
        service_method: &str,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
        F: Future<Output = ()>,
    {
        let (done, mut completions) = CompletionQueue::bounded(1)?;
        let seq = self.go(service_method, args, done).await?;
        tokio::select! {
            _ = cancelled => {
                self.inner.remove(seq);
                tracing::debug!(seq, service_method, "rpc client: call canceled");
                Err(Error::Canceled)
            }
            call = completions.recv() => match call {
                Some(call) => call.into_reply(),
                None => Err(Error::Shutdown),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// A stream whose peer has stopped reading: every write fails.
    struct ClosedPeer;

    impl AsyncWrite for ClosedPeer {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_failure_completes_call() {
        let (read_side, _peer) = tokio::io::duplex(64);
        let (reader, writer) = new_codec(CodecType::Json, BufReader::new(read_side), ClosedPeer);
        let client = Client::with_codec(reader, writer, Options::default());
        let (done, mut completions) = CompletionQueue::with_default_capacity();

        let seq = client.go("Arith.Multiply", &(6, 7), done).await.unwrap();
        assert_eq!(seq, 1);

        let call = completions.recv().await.unwrap();
        assert_eq!(call.seq, 1);
        assert!(
            matches!(&call.error, Some(Error::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe),
            "{:?}",
            call.error
        );
        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn test_zero_capacity_queue_rejected() {
        let err = CompletionQueue::bounded(0).unwrap_err();
        assert!(matches!(err, Error::ZeroCapacityQueue));
        assert!(err.is_misuse());
    }

    #[tokio::test]
    async fn test_call_into_reply() {
        let (done, mut completions) = CompletionQueue::bounded(2).unwrap();
        let pending = Pending {
            seq: 4,
            service_method: "Arith.Multiply".into(),
            codec_type: CodecType::Json,
            done: done.clone(),
        };
        pending.complete(Ok(Bytes::from_static(b"42"))).await;

        let call = completions.recv().await.unwrap();
        assert_eq!(call.seq, 4);
        assert!(call.is_ok());
        assert_eq!(call.into_reply::<i64>().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_remote_error_reply() {
        let (done, mut completions) = CompletionQueue::unbounded();
        let pending = Pending {
            seq: 1,
            service_method: "Arith.Divide".into(),
            codec_type: CodecType::Binary,
            done,
        };
        pending
            .complete(Err(Error::Remote("divide by zero".into())))
            .await;

        let call = completions.recv().await.unwrap();
        let err = call.into_reply::<i64>().unwrap_err();
        assert_eq!(err.to_string(), "divide by zero");
    }
}
