//! The query handler capability.
//!
//! The server never interprets query text. Each simple query is passed to a
//! `QueryHandler`, whose result decides the completion the client sees:
//!
//! - `Ok(None)`: `CommandComplete("OK")`
//! - `Ok(Some(tag))`: `CommandComplete(tag)`
//! - `Err(e)`: `ErrorResponse` carrying `e.code` and `e.message`
//!
//! Closures of the right shape implement the trait directly:
//!
//! ```
//! use pgwire_double::handler::{HandlerError, QueryHandler};
//!
//! let handler = |query: &[u8]| -> Result<Option<Vec<u8>>, HandlerError> {
//!     if query.starts_with(b"DROP") {
//!         return Err(HandlerError::new("not allowed").with_code("42501"));
//!     }
//!     Ok(Some(b"SELECT 1".to_vec()))
//! };
//! assert!(handler.handle(b"DROP TABLE t").is_err());
//! ```

use std::fmt;

/// SQLSTATE `internal_error`.
pub const DEFAULT_ERROR_CODE: &str = "XX000";

/// Outcome of handling one query.
pub type QueryResult = Result<Option<Vec<u8>>, HandlerError>;

/// Translates query text into a completion tag or an error.
///
/// Called on tokio's blocking pool, so implementations may block. A completion
/// tag, code or message is cut at its first NUL byte before it is sent.
pub trait QueryHandler: Send + Sync + 'static {
    /// Handle one query. `query` has its trailing NUL removed.
    fn handle(&self, query: &[u8]) -> QueryResult;
}

impl<F> QueryHandler for F
where
    F: Fn(&[u8]) -> QueryResult + Send + Sync + 'static,
{
    fn handle(&self, query: &[u8]) -> QueryResult {
        self(query)
    }
}

/// A failure reported by a query handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    /// Five-character SQLSTATE sent to the client.
    pub code: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: DEFAULT_ERROR_CODE.to_string(),
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for HandlerError {}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

/// Handler that answers every query with the same completion.
#[derive(Debug, Clone, Default)]
pub struct FixedReply {
    reply: Option<Vec<u8>>,
}

impl FixedReply {
    /// `None` answers `OK` to everything.
    pub fn new(reply: Option<String>) -> Self {
        Self {
            reply: reply.map(String::into_bytes),
        }
    }
}

impl QueryHandler for FixedReply {
    fn handle(&self, _query: &[u8]) -> QueryResult {
        Ok(self.reply.clone())
    }
}
