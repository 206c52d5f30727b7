//! Method descriptors.
//!
//! A [`MethodType`] is built once at registration from a typed handler of
//! shape `(receiver, args) -> Result<reply, error>`. The types are checked by
//! the compiler when the handler is registered; at call time the descriptor
//! only sees encoded bytes.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::CodecType;
use crate::error::Result;

/// Type alias for a boxed, sendable future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Result of one invocation: the encoded reply, or the handler's error text.
pub type Reply = std::result::Result<Bytes, String>;

type Invoker = dyn Fn(CodecType, &[u8]) -> Result<BoxFuture<Reply>> + Send + Sync;

/// Descriptor of one callable method.
///
/// Immutable after registration except for the invocation counter.
pub struct MethodType {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    invoker: Box<Invoker>,
}

impl MethodType {
    pub(crate) fn new<S, A, R, E, F, Fut>(name: String, receiver: Arc<S>, handler: F) -> Self
    where
        S: Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let invoker = move |codec: CodecType, raw: &[u8]| -> Result<BoxFuture<Reply>> {
            let args: A = codec.decode(raw)?;
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            Ok(Box::pin(async move {
                match handler(receiver, args).await {
                    Ok(reply) => codec.encode(&reply).map_err(|e| e.to_string()),
                    Err(err) => Err(err.to_string()),
                }
            }))
        };

        Self {
            name,
            arg_type: std::any::type_name::<A>(),
            reply_type: std::any::type_name::<R>(),
            num_calls: AtomicU64::new(0),
            invoker: Box::new(invoker),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rust type name of the argument.
    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    /// Rust type name of the reply.
    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of dispatches so far, failed ones included.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Decode the arguments of a call.
    ///
    /// The handler does not run until the returned [`Invocation`] is
    /// dispatched, so decoding can happen on the read loop and execution
    /// somewhere else.
    pub fn prepare(self: &Arc<Self>, codec: CodecType, raw_args: &[u8]) -> Result<Invocation> {
        let future = (self.invoker)(codec, raw_args)?;
        Ok(Invocation {
            method: Arc::clone(self),
            future,
        })
    }
}

impl std::fmt::Debug for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodType")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

/// A call whose arguments have been decoded, ready to run.
pub struct Invocation {
    method: Arc<MethodType>,
    future: BoxFuture<Reply>,
}

impl Invocation {
    pub fn method(&self) -> &Arc<MethodType> {
        &self.method
    }

    /// Run the handler and count the attempt.
    ///
    /// The handler's error is returned as its own `Display` text.
    pub async fn dispatch(self) -> Reply {
        self.method.num_calls.fetch_add(1, Ordering::Relaxed);
        self.future.await
    }
}
