//! PostgreSQL v3 wire protocol: framing, startup packets, exact reads.

pub mod codec;
pub mod startup;
pub mod transport;

pub use codec::{read_frame, write_messages, BackendMessage, ErrorFields, Frame, TransactionStatus};
pub use startup::{read_startup, StartupParams, StartupRequest};
pub use transport::read_exactly;
