//! Error types shared by the client and server crates.

use std::io;
use std::time::Duration;

/// Result type alias for the RPC crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating, sending, dispatching or receiving calls.
///
/// Variants fall into four groups:
///
/// - **Negotiation**: [`Error::MagicMismatch`], [`Error::UnsupportedCodec`].
///   Connection-fatal, no response frame is ever written.
/// - **Per-call**: [`Error::IllFormedName`], [`Error::ServiceNotFound`],
///   [`Error::MethodNotFound`], [`Error::HandleTimeout`], [`Error::Remote`].
///   Carried in a response header; only that call fails.
/// - **Transport**: [`Error::Io`], [`Error::Shutdown`], [`Error::FrameTooLarge`].
///   Connection-fatal.
/// - **Misuse**: see [`Error::is_misuse`]. Never worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection was closed or torn down by the receive loop.
    #[error("connection is shut down")]
    Shutdown,

    /// `close()` was called on a client that is already closed.
    #[error("connection already closed")]
    AlreadyClosed,

    /// Transport connect plus option exchange did not finish in time.
    #[error("connect timeout: expected within {0:?}")]
    ConnectTimeout(Duration),

    /// A handler did not finish within the server's handle timeout.
    #[error("handle timeout: expected within {0:?}")]
    HandleTimeout(Duration),

    /// The option record named a codec this build does not know.
    #[error("unsupported codec type {0:?}")]
    UnsupportedCodec(String),

    /// The option record carried a foreign magic number.
    #[error("invalid magic number {0:#x}")]
    MagicMismatch(u32),

    /// A `"Service.Method"` name without a separator.
    #[error("service/method request ill-formed: {0}")]
    IllFormedName(String),

    #[error("can't find service {0}")]
    ServiceNotFound(String),

    #[error("can't find method {0}")]
    MethodNotFound(String),

    /// A service with this name is already registered.
    #[error("service already defined: {0}")]
    DuplicateService(String),

    /// Service names must be exported identifiers.
    #[error("{0:?} is not a valid service name")]
    InvalidServiceName(String),

    /// A completion queue was requested with zero capacity.
    #[error("completion queue must have positive capacity")]
    ZeroCapacityQueue,

    /// More than one `Options` value was handed to a dial function.
    #[error("number of options is more than 1")]
    TooManyOptions,

    /// Address for `xdial` is not of the form `protocol@addr`.
    #[error("wrong format {0:?}, expect protocol@addr")]
    BadAddress(String),

    /// `xdial` protocol prefix is not one this build can dial.
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),

    /// The HTTP CONNECT handshake answered with something other than the connected status.
    #[error("unexpected HTTP response: {0}")]
    HttpStatus(String),

    /// The caller canceled a synchronous call before its reply arrived.
    #[error("call canceled")]
    Canceled,

    /// Error text produced by the remote peer, reported verbatim.
    #[error("{0}")]
    Remote(String),

    /// A length-prefixed frame or option record exceeded the size limit.
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for programmer-misuse errors.
    ///
    /// These are detected before any network traffic happens and must not be
    /// retried: the same call will fail the same way.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::ZeroCapacityQueue
                | Error::TooManyOptions
                | Error::InvalidServiceName(_)
                | Error::DuplicateService(_)
                | Error::BadAddress(_)
        )
    }

    /// True if the error ends the whole connection rather than a single call.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Shutdown
                | Error::Io(_)
                | Error::FrameTooLarge(_)
                | Error::MagicMismatch(_)
                | Error::UnsupportedCodec(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(io) => Error::Io(io),
            other => Error::Decode(other.to_string()),
        }
    }
}
