//! Error taxonomy of the request lifecycle engine.

use std::fmt;
use std::io;

use http::StatusCode;

/// Type-erased error type, used at the seams towards external collaborators
/// (filters, auth engines, body producers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug)]
/// Error raised when the validation of a WebSocket upgrade response failed.
pub enum HandshakeError {
    /// The upgrade response did not carry status `101 Switching Protocols`.
    UnexpectedStatusCode(StatusCode),
    /// The upgrade response lacks an `Upgrade` header.
    MissingUpgradeHeader,
    /// The upgrade response lacks a `Connection: Upgrade` header.
    MissingConnectionUpgradeHeader,
    /// The `Sec-WebSocket-Accept` value does not match the value
    /// derived from the request's `Sec-WebSocket-Key`.
    AcceptKeyMismatch {
        expected: String,
        actual: Option<String>,
    },
    /// The caller's handler did not request the upgrade,
    /// or rejected the response headers.
    UpgradeRefused,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedStatusCode(status) => {
                write!(f, "unexpected HTTP status code: {status}")
            }
            Self::MissingUpgradeHeader => {
                write!(f, "missing upgrade WebSocket header")
            }
            Self::MissingConnectionUpgradeHeader => {
                write!(f, "missing connection upgrade header")
            }
            Self::AcceptKeyMismatch { expected, actual } => {
                write!(
                    f,
                    "key mismatch for sec-websocket-accept header: actual {actual:?} (expected: {expected})"
                )
            }
            Self::UpgradeRefused => {
                write!(f, "handler refused the WebSocket upgrade")
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

#[derive(Debug)]
/// Terminal error delivered to the caller's error callback,
/// exactly once per logical request lifecycle.
pub enum Error {
    /// The client was shut down before or while the request was in flight.
    ClientClosed,
    /// The logical request is malformed (e.g. a WebSocket target
    /// with a non-GET method or a handler lacking upgrade capability).
    InvalidRequest(String),
    /// The configured body source cannot be used
    /// (e.g. a file body that does not point at a regular file).
    InvalidBodySource(String),
    /// Fatal configuration error (e.g. an auth scheme without its engine).
    Configuration(String),
    /// NTLM / Kerberos token generation failed.
    Authentication(BoxError),
    /// The per-future redirect counter reached the configured maximum.
    MaxRedirectsExceeded(u32),
    /// WebSocket upgrade validation failed.
    Handshake(HandshakeError),
    /// Transport-level failure that no IO-exception filter recovered.
    Io(io::Error),
    /// The reaper aborted the future because no progress was made
    /// within the configured window.
    Timeout,
    /// A response or IO-exception filter raised an error,
    /// aborting the whole future.
    FilterAborted(BoxError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => write!(f, "client is closed"),
            Self::InvalidRequest(reason) => write!(f, "invalid request: {reason}"),
            Self::InvalidBodySource(reason) => write!(f, "invalid body source: {reason}"),
            Self::Configuration(reason) => write!(f, "configuration error: {reason}"),
            Self::Authentication(error) => write!(f, "authentication failure: {error}"),
            Self::MaxRedirectsExceeded(max) => {
                write!(f, "maximum redirect reached: {max}")
            }
            Self::Handshake(error) => write!(f, "handshake failed: {error}"),
            Self::Io(error) => write!(f, "io error: {error}"),
            Self::Timeout => write!(f, "request timed out"),
            Self::FilterAborted(error) => write!(f, "aborted by filter: {error}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Authentication(error) | Self::FilterAborted(error) => Some(error.as_ref()),
            Self::Handshake(error) => Some(error as &dyn std::error::Error),
            Self::Io(error) => Some(error as &dyn std::error::Error),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<HandshakeError> for Error {
    fn from(error: HandshakeError) -> Self {
        Self::Handshake(error)
    }
}
