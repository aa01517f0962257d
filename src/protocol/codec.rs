//! Frame codec for the PostgreSQL v3 frontend/backend protocol.
//!
//! Every message after the startup packet has the same shape:
//!
//! ```text
//! +-----+----------------+--------------------+
//! | tag | length (u32 BE) | payload            |
//! +-----+----------------+--------------------+
//!   1B        4B           length - 4 bytes
//! ```
//!
//! The length counts itself but not the tag.
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use super::transport::{read_exactly, read_u32};
use crate::error::{FramingError, ReadError, SessionError};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Size of the length field, which is counted in its own value.
pub const LENGTH_FIELD: u32 = 4;

/// Frontend message tags handled by the dispatcher.
pub mod tag {
    pub const QUERY: u8 = b'Q';
    pub const TERMINATE: u8 = b'X';
}

/// Backend message tags.
pub mod backend_tag {
    pub const SSL_DECLINE: u8 = b'N';
    pub const AUTHENTICATION: u8 = b'R';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const ERROR_RESPONSE: u8 = b'E';
}

/// `R`, length 8, success code 0.
pub const AUTHENTICATION_OK: [u8; 9] = [0x52, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00];

/// `Z`, length 5, status `I`.
pub const READY_FOR_QUERY_IDLE: [u8; 6] = [0x5a, 0x00, 0x00, 0x00, 0x05, 0x49];

/// One tagged frame read from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Value of the length field this frame had on the wire.
    pub fn length(&self) -> u32 {
        LENGTH_FIELD + self.payload.len() as u32
    }
}

/// Read one tagged frame.
///
/// Returns `Ok(None)` when the stream closes cleanly before the tag byte.
/// A close anywhere after the tag is a truncation.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Option<Frame>, SessionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let tag = match read_exactly(reader, 1).await {
        Ok(tag) => tag[0],
        Err(ReadError::EndOfStream) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let len = read_u32(reader)
        .await
        .map_err(|e| mid_frame(e, LENGTH_FIELD as usize))?;
    check_length(len, LENGTH_FIELD, max_len)?;

    let payload_len = (len - LENGTH_FIELD) as usize;
    let payload = read_exactly(reader, payload_len)
        .await
        .map_err(|e| mid_frame(e, payload_len))?;

    Ok(Some(Frame { tag, payload }))
}

/// Validate a length field against a minimum and the configured maximum.
pub fn check_length(len: u32, min: u32, max: u32) -> Result<(), FramingError> {
    if len < min {
        return Err(FramingError::InvalidLength(len));
    }
    if len > max {
        return Err(FramingError::TooLarge { len, max });
    }
    Ok(())
}

/// Once the tag is in, even a clean close is a truncated frame.
pub(crate) fn mid_frame(e: ReadError, expected: usize) -> SessionError {
    match e {
        ReadError::EndOfStream => {
            SessionError::Framing(FramingError::Truncated { expected, read: 0 })
        }
        other => other.into(),
    }
}

/// Transaction status reported in ReadyForQuery.
///
/// Only `Idle` is produced; transactions are not modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    /// Single `N` byte refusing an SSL or GSSAPI encryption request.
    SslDecline,
    AuthenticationOk,
    ParameterStatus { name: String, value: String },
    ReadyForQuery(TransactionStatus),
    CommandComplete(Bytes),
    ErrorResponse(ErrorFields),
}

/// Fields carried by an ErrorResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: &'static str,
    pub code: String,
    pub message: String,
}

impl BackendMessage {
    /// Append the wire encoding of this message to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            BackendMessage::SslDecline => buf.put_u8(backend_tag::SSL_DECLINE),
            BackendMessage::AuthenticationOk => buf.extend_from_slice(&AUTHENTICATION_OK),
            BackendMessage::ParameterStatus { name, value } => {
                let len = LENGTH_FIELD as usize + name.len() + 1 + value.len() + 1;
                buf.reserve(1 + len);
                buf.put_u8(backend_tag::PARAMETER_STATUS);
                buf.put_u32(len as u32);
                put_cstr(buf, name.as_bytes());
                put_cstr(buf, value.as_bytes());
            }
            BackendMessage::ReadyForQuery(TransactionStatus::Idle) => {
                buf.extend_from_slice(&READY_FOR_QUERY_IDLE)
            }
            BackendMessage::CommandComplete(tag) => {
                let len = LENGTH_FIELD as usize + tag.len() + 1;
                buf.reserve(1 + len);
                buf.put_u8(backend_tag::COMMAND_COMPLETE);
                buf.put_u32(len as u32);
                put_cstr(buf, tag);
            }
            BackendMessage::ErrorResponse(fields) => {
                // S and V are both the severity; V is the non-localized copy.
                let body = [
                    (b'S', fields.severity.as_bytes()),
                    (b'V', fields.severity.as_bytes()),
                    (b'C', fields.code.as_bytes()),
                    (b'M', fields.message.as_bytes()),
                ];
                let len = LENGTH_FIELD as usize
                    + body.iter().map(|(_, v)| 1 + v.len() + 1).sum::<usize>()
                    + 1;
                buf.reserve(1 + len);
                buf.put_u8(backend_tag::ERROR_RESPONSE);
                buf.put_u32(len as u32);
                for (field, value) in body {
                    buf.put_u8(field);
                    put_cstr(buf, value);
                }
                buf.put_u8(0);
            }
        }
    }
}

fn put_cstr(buf: &mut BytesMut, s: &[u8]) {
    buf.extend_from_slice(s);
    buf.put_u8(0);
}

/// Encode `messages` into one buffer, write it, and flush.
pub async fn write_messages<W>(writer: &mut W, messages: &[BackendMessage]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(64);
    for message in messages {
        message.encode(&mut buf);
    }
    writer.write_all(&buf).await?;
    writer.flush().await
}
