//! pgwire-double: a PostgreSQL wire protocol test double
//!
//! Speaks enough of the v3 frontend/backend protocol for a real client to
//! connect and run simple queries against a programmable handler:
//! - Startup handshake, with SSL/GSSAPI encryption requests declined
//! - Simple query (`Q`) answered by a `QueryHandler`
//! - Terminate (`X`); other messages are ignored
//!
//! ```no_run
//! use pgwire_double::handler::QueryResult;
//! use pgwire_double::options::{with_server_version, with_time_zone};
//! use pgwire_double::server::{Server, ServerConfig};
//!
//! # async fn run() -> Result<(), pgwire_double::error::ServerError> {
//! let handler = |_query: &[u8]| -> QueryResult { Ok(Some(b"SELECT 1".to_vec())) };
//! let server = Server::new(
//!     ServerConfig::new(54322, handler),
//!     vec![with_server_version("14.11"), with_time_zone("Asia/Tokyo")],
//! );
//! server.run().await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod options;
pub mod protocol;
pub mod server;
pub mod session;

pub use error::{FramingError, ServerError, SessionError};
pub use handler::{HandlerError, QueryHandler, QueryResult};
pub use server::{Acceptor, Server, ServerConfig};
