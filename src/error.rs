//! Error types for the wire protocol engine.
//!
//! Errors are layered by blast radius:
//! - `ReadError`: a single exact-length read on the transport
//! - `FramingError` / `SessionError`: fatal to one session, never to the server
//! - `ServerError`: startup failures returned to the caller

use std::fmt;
use std::io;
use std::time::Duration;

/// Failure of an exact-length read.
#[derive(Debug)]
pub enum ReadError {
    /// The stream ended before any byte of the requested span was read.
    EndOfStream,
    /// The stream ended part-way through the requested span.
    Truncated { expected: usize, read: usize },
    /// The underlying transport failed.
    Io(io::Error),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::EndOfStream => write!(f, "end of stream"),
            ReadError::Truncated { expected, read } => {
                write!(f, "stream truncated after {read} of {expected} bytes")
            }
            ReadError::Io(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}

/// Malformed or unexpected bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Length field smaller than the minimum for the message.
    InvalidLength(u32),
    /// Length field above the configured maximum frame size.
    TooLarge { len: u32, max: u32 },
    /// Stream ended in the middle of a frame.
    Truncated { expected: usize, read: usize },
    /// A second secure-channel negotiation request during one handshake.
    UnexpectedNegotiation(u32),
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::InvalidLength(len) => write!(f, "invalid message length: {len}"),
            FramingError::TooLarge { len, max } => {
                write!(f, "message length {len} exceeds maximum {max}")
            }
            FramingError::Truncated { expected, read } => {
                write!(f, "message truncated after {read} of {expected} bytes")
            }
            FramingError::UnexpectedNegotiation(code) => {
                write!(f, "unexpected repeated negotiation request (code {code})")
            }
        }
    }
}

impl std::error::Error for FramingError {}

/// An error that ends one session.
#[derive(Debug)]
pub enum SessionError {
    Transport(io::Error),
    Framing(FramingError),
    Timeout(Duration),
}

impl SessionError {
    /// Short label used as a structured logging field.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Transport(_) => "transport",
            SessionError::Framing(_) => "framing",
            SessionError::Timeout(_) => "timeout",
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Transport(e) => write!(f, "transport error: {e}"),
            SessionError::Framing(e) => write!(f, "framing error: {e}"),
            SessionError::Timeout(d) => write!(f, "operation timed out after {d:?}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Transport(e) => Some(e),
            SessionError::Framing(e) => Some(e),
            SessionError::Timeout(_) => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Transport(e)
    }
}

impl From<FramingError> for SessionError {
    fn from(e: FramingError) -> Self {
        SessionError::Framing(e)
    }
}

/// Mid-message read failures are framing errors.
///
/// `EndOfStream` maps to a zero-byte truncation here; callers that treat a
/// clean close as a normal end must match on `ReadError` before converting.
impl From<ReadError> for SessionError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::EndOfStream => SessionError::Framing(FramingError::Truncated {
                expected: 0,
                read: 0,
            }),
            ReadError::Truncated { expected, read } => {
                SessionError::Framing(FramingError::Truncated { expected, read })
            }
            ReadError::Io(e) => SessionError::Transport(e),
        }
    }
}

/// Server startup errors.
#[derive(Debug)]
pub enum ServerError {
    /// `start` was called before a query handler was registered.
    HandlerNotRegistered,
    /// The configured host/port pair is not a valid socket address.
    InvalidAddress(String),
    /// Binding or listening on the configured address failed.
    Bind { addr: String, source: io::Error },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::HandlerNotRegistered => write!(f, "query handler is not registered"),
            ServerError::InvalidAddress(addr) => write!(f, "invalid listen address '{addr}'"),
            ServerError::Bind { addr, source } => {
                write!(f, "failed to listen on '{addr}': {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}
