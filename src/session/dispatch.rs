//! Post-handshake frame dispatch.
//!
//! Maps one client frame to the messages the server answers with:
//! - `Q`: run the handler, answer with CommandComplete or ErrorResponse,
//!   always followed by ReadyForQuery
//! - `X`: end the session without writing anything
//! - anything else: ignored, nothing written

use crate::handler::{HandlerError, QueryHandler, QueryResult};
use crate::protocol::codec::tag;
use crate::protocol::{BackendMessage, ErrorFields, Frame, TransactionStatus};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Completion tag used when the handler returns no payload.
pub const DEFAULT_COMPLETION: &[u8] = b"OK";

/// What the session should do with a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Write these messages and keep reading.
    Respond(Vec<BackendMessage>),
    /// Client asked to close the connection.
    Terminate,
    /// Unsupported message; nothing to write.
    Ignore,
}

/// Dispatch one frame.
pub async fn dispatch(frame: Frame, handler: &Arc<dyn QueryHandler>) -> Dispatch {
    match frame.tag {
        tag::QUERY => {
            let query = strip_nul(frame.payload);
            trace!(query = %String::from_utf8_lossy(&query), "Processing query");
            Dispatch::Respond(respond(run_handler(handler, query).await))
        }
        tag::TERMINATE => Dispatch::Terminate,
        other => {
            debug!(tag = %char::from(other), len = frame.payload.len(), "Ignoring unsupported message");
            Dispatch::Ignore
        }
    }
}

/// Run the handler on the blocking pool so it cannot stall other sessions.
async fn run_handler(handler: &Arc<dyn QueryHandler>, query: Bytes) -> QueryResult {
    let handler = Arc::clone(handler);
    match tokio::task::spawn_blocking(move || handler.handle(&query)).await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "Query handler failed to complete");
            Err(HandlerError::new("query handler panicked"))
        }
    }
}

/// Build the response for a handler result.
pub fn respond(result: QueryResult) -> Vec<BackendMessage> {
    let first = match result {
        Ok(None) => BackendMessage::CommandComplete(Bytes::from_static(DEFAULT_COMPLETION)),
        Ok(Some(mut tag)) => {
            if let Some(end) = tag.iter().position(|&b| b == 0) {
                tag.truncate(end);
            }
            BackendMessage::CommandComplete(Bytes::from(tag))
        }
        Err(e) => {
            debug!(error = %e, "Query handler returned an error");
            BackendMessage::ErrorResponse(ErrorFields {
                severity: "ERROR",
                code: cut_at_nul(e.code),
                message: cut_at_nul(e.message),
            })
        }
    };
    vec![first, BackendMessage::ReadyForQuery(TransactionStatus::Idle)]
}

/// Wire strings are NUL-terminated, so anything past an interior NUL would be lost.
fn cut_at_nul(mut s: String) -> String {
    if let Some(end) = s.find('\0') {
        s.truncate(end);
    }
    s
}

/// Drop the single NUL terminating the query string, if present.
fn strip_nul(mut payload: Bytes) -> Bytes {
    if payload.last() == Some(&0) {
        payload.truncate(payload.len() - 1);
    }
    payload
}
