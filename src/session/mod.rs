//! One client connection, start to finish.
//!
//! A session runs the handshake once, then reads and dispatches frames until
//! the client terminates, disconnects, or sends something unparseable:
//!
//! ```text
//! Handshaking -> Ready -> Dispatching -> Ready ... -> Closed
//! ```
//!
//! Every exit path shuts the transport down. Errors end this session only.

pub mod dispatch;
pub mod handshake;

use crate::error::SessionError;
use crate::handler::QueryHandler;
use crate::options::Settings;
use crate::protocol::{read_frame, write_messages, BackendMessage};
use dispatch::Dispatch;
use handshake::Handshake;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Ready,
    Dispatching,
    Closed,
}

/// Server side of one connection.
pub struct Session<S> {
    stream: S,
    settings: Arc<Settings>,
    handler: Arc<dyn QueryHandler>,
    state: SessionState,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, settings: Arc<Settings>, handler: Arc<dyn QueryHandler>) -> Self {
        Self {
            stream,
            settings,
            handler,
            state: SessionState::Handshaking,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion and close the transport.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        let result = self.serve().await;
        self.state = SessionState::Closed;

        if let Err(e) = self.stream.shutdown().await {
            trace!(error = %e, "Shutdown after session end failed");
        }

        result
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Handshaking;
        let params = match handshake::perform(&mut self.stream, &self.settings).await? {
            Handshake::Complete(params) => params,
            Handshake::Abandoned => {
                debug!("Client left during startup");
                return Ok(());
            }
        };

        debug!(
            user = params.get("user").unwrap_or("-"),
            database = params.get("database").unwrap_or("-"),
            protocol_major = params.major,
            protocol_minor = params.minor,
            "Startup complete"
        );

        loop {
            self.state = SessionState::Ready;

            let frame = deadline(
                self.settings.io_timeout,
                read_frame(&mut self.stream, self.settings.max_frame_len),
            )
            .await?;

            let Some(frame) = frame else {
                debug!("Connection closed by client");
                return Ok(());
            };

            self.state = SessionState::Dispatching;
            match dispatch::dispatch(frame, &self.handler).await {
                Dispatch::Respond(messages) => {
                    send(&mut self.stream, &messages, self.settings.io_timeout).await?;
                }
                Dispatch::Ignore => {}
                Dispatch::Terminate => {
                    debug!("Received Terminate message");
                    return Ok(());
                }
            }
        }
    }
}

/// Bound `fut` by `limit`, if one is set.
pub(crate) async fn deadline<F, T>(limit: Option<Duration>, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, SessionError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| SessionError::Timeout(limit))?,
        None => fut.await,
    }
}

/// Write `messages` in one buffered write, bounded by `limit`.
pub(crate) async fn send<W>(
    writer: &mut W,
    messages: &[BackendMessage],
    limit: Option<Duration>,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    deadline(limit, async {
        write_messages(writer, messages).await.map_err(SessionError::from)
    })
    .await
}
