//! Exact-length reads over a byte stream.
//!
//! A single `read` call may return fewer bytes than asked for. Everything
//! above this module relies on `read_exactly` returning the whole span or
//! telling apart a clean close from a truncated one.

use crate::error::ReadError;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read exactly `n` bytes, retrying short reads until the span is filled.
///
/// Returns `ReadError::EndOfStream` if the stream closed before the first
/// byte, and `ReadError::Truncated` if it closed part-way.
pub async fn read_exactly<R>(reader: &mut R, n: usize) -> Result<Bytes, ReadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::zeroed(n);
    let mut filled = 0;

    while filled < n {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            return Err(if filled == 0 {
                ReadError::EndOfStream
            } else {
                ReadError::Truncated {
                    expected: n,
                    read: filled,
                }
            });
        }
        filled += read;
    }

    Ok(buf.freeze())
}

/// Read a big-endian `u32`.
pub async fn read_u32<R>(reader: &mut R) -> Result<u32, ReadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let bytes = read_exactly(reader, 4).await?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
