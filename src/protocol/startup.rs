//! The untagged startup packet.
//!
//! For historical reasons the first message a client sends has no tag byte:
//! a `u32` length (counting itself) followed by a body whose first four
//! bytes are either a protocol version or one of the negotiation codes.

use super::codec::{check_length, mid_frame, LENGTH_FIELD};
use super::transport::{read_exactly, read_u32};
use crate::error::{ReadError, SessionError};
use bytes::{Buf, Bytes};
use tokio::io::AsyncRead;

/// Requests a TLS session before the real startup packet.
pub const SSL_REQUEST_CODE: u32 = 80877103;
/// Requests GSSAPI encryption before the real startup packet.
pub const GSSENC_REQUEST_CODE: u32 = 80877104;
/// Asks the server to cancel a query running on another connection.
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Smallest startup packet: the length plus a four-byte code.
pub const MIN_STARTUP_LEN: u32 = 8;

/// Classified startup packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupRequest {
    SslRequest,
    GssEncRequest,
    CancelRequest,
    Startup(StartupParams),
}

/// Contents of an ordinary startup packet.
///
/// Parameters are parsed best-effort for logging; nothing depends on them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupParams {
    pub major: u16,
    pub minor: u16,
    pub params: Vec<(String, String)>,
}

impl StartupParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

impl StartupRequest {
    /// Classify a startup body (everything after the length field).
    ///
    /// `body` is at least four bytes long; `read_startup` guarantees it.
    pub fn parse(mut body: Bytes) -> Self {
        let code = body.get_u32();
        match code {
            SSL_REQUEST_CODE => StartupRequest::SslRequest,
            GSSENC_REQUEST_CODE => StartupRequest::GssEncRequest,
            CANCEL_REQUEST_CODE => StartupRequest::CancelRequest,
            version => StartupRequest::Startup(StartupParams {
                major: (version >> 16) as u16,
                minor: (version & 0xffff) as u16,
                params: parse_params(&body),
            }),
        }
    }
}

/// Parse `name\0value\0...\0`, stopping at the first malformed entry.
fn parse_params(mut body: &[u8]) -> Vec<(String, String)> {
    let mut params = Vec::new();

    while let Some(name) = next_cstr(&mut body) {
        if name.is_empty() {
            break;
        }
        let Some(value) = next_cstr(&mut body) else {
            break;
        };
        params.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
    }

    params
}

fn next_cstr<'a>(body: &mut &'a [u8]) -> Option<&'a [u8]> {
    let end = body.iter().position(|b| *b == 0)?;
    let s = &body[..end];
    *body = &body[end + 1..];
    Some(s)
}

/// Read one startup packet and return its body.
///
/// Returns `Ok(None)` if the client disconnects before sending anything.
pub async fn read_startup<R>(reader: &mut R, max_len: u32) -> Result<Option<Bytes>, SessionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = match read_u32(reader).await {
        Ok(len) => len,
        Err(ReadError::EndOfStream) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    check_length(len, MIN_STARTUP_LEN, max_len)?;

    let body_len = (len - LENGTH_FIELD) as usize;
    let body = read_exactly(reader, body_len)
        .await
        .map_err(|e| mid_frame(e, body_len))?;

    Ok(Some(body))
}
