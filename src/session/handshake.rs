//! Startup exchange for a newly accepted connection.
//!
//! ```text
//! client                         server
//!   SSLRequest / GSSENCRequest ->          (optional, once each)
//!                              <- 'N'
//!   StartupMessage            ->
//!                              <- AuthenticationOk
//!                              <- ParameterStatus(TimeZone)
//!                              <- ParameterStatus(server_version)
//!                              <- ReadyForQuery(I)
//! ```
//!
//! Secure channels are never offered: a negotiation request is declined and
//! the client is expected to follow with a plain startup packet. An ordinary
//! startup packet is answered directly, without a decline byte.

use super::{deadline, send};
use crate::error::{FramingError, SessionError};
use crate::options::Settings;
use crate::protocol::startup::{GSSENC_REQUEST_CODE, SSL_REQUEST_CODE};
use crate::protocol::{
    read_startup, BackendMessage, StartupParams, StartupRequest, TransactionStatus,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

/// How the startup exchange ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Handshake {
    /// The client is authenticated and the server is ready for queries.
    Complete(StartupParams),
    /// The client left before completing startup, or sent a cancel request.
    Abandoned,
}

/// Run the startup exchange. Called once per session.
pub async fn perform<S>(stream: &mut S, settings: &Settings) -> Result<Handshake, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut ssl_declined = false;
    let mut gss_declined = false;

    let params = loop {
        let body = match deadline(
            settings.io_timeout,
            read_startup(&mut *stream, settings.max_frame_len),
        )
        .await?
        {
            Some(body) => body,
            None => return Ok(Handshake::Abandoned),
        };

        match StartupRequest::parse(body) {
            StartupRequest::SslRequest => {
                if ssl_declined {
                    return Err(FramingError::UnexpectedNegotiation(SSL_REQUEST_CODE).into());
                }
                ssl_declined = true;
                trace!("Declining SSL request");
                send(&mut *stream, &[BackendMessage::SslDecline], settings.io_timeout).await?;
            }
            StartupRequest::GssEncRequest => {
                if gss_declined {
                    return Err(FramingError::UnexpectedNegotiation(GSSENC_REQUEST_CODE).into());
                }
                gss_declined = true;
                trace!("Declining GSSAPI encryption request");
                send(&mut *stream, &[BackendMessage::SslDecline], settings.io_timeout).await?;
            }
            StartupRequest::CancelRequest => {
                debug!("Ignoring cancel request");
                return Ok(Handshake::Abandoned);
            }
            StartupRequest::Startup(params) => break params,
        }
    };

    send(&mut *stream, &startup_response(settings), settings.io_timeout).await?;

    Ok(Handshake::Complete(params))
}

/// Messages sent after an accepted startup packet, in order.
pub fn startup_response(settings: &Settings) -> Vec<BackendMessage> {
    let mut messages = vec![BackendMessage::AuthenticationOk];
    messages.extend(
        settings
            .parameters()
            .into_iter()
            .map(|(name, value)| BackendMessage::ParameterStatus {
                name: name.to_string(),
                value: value.to_string(),
            }),
    );
    messages.push(BackendMessage::ReadyForQuery(TransactionStatus::Idle));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{with_server_version, with_time_zone};
    use tokio_test::io::Builder;

    const SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];

    fn startup_packet() -> Vec<u8> {
        let body = b"\x00\x03\x00\x00user\x00test\x00\x00";
        let mut packet = ((body.len() + 4) as u32).to_be_bytes().to_vec();
        packet.extend_from_slice(body);
        packet
    }

    fn expected_response() -> Vec<u8> {
        let mut bytes = vec![0x52, 0, 0, 0, 8, 0, 0, 0, 0];
        bytes.extend_from_slice(b"S\x00\x00\x00\x18TimeZone\x00Asia/Tokyo\x00");
        bytes.extend_from_slice(b"S\x00\x00\x00\x19server_version\x0014.11\x00");
        bytes.extend_from_slice(&[0x5a, 0, 0, 0, 5, 0x49]);
        bytes
    }

    fn settings() -> Settings {
        Settings::default().apply(vec![
            with_server_version("14.11"),
            with_time_zone("Asia/Tokyo"),
        ])
    }

    #[tokio::test]
    async fn test_plain_startup_is_not_declined() {
        let mut stream = Builder::new()
            .read(&startup_packet())
            .write(&expected_response())
            .build();

        match perform(&mut stream, &settings()).await.unwrap() {
            Handshake::Complete(params) => assert_eq!(params.get("user"), Some("test")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ssl_request_declined_then_startup() {
        let mut stream = Builder::new()
            .read(&SSL_REQUEST)
            .write(b"N")
            .read(&startup_packet())
            .write(&expected_response())
            .build();

        let outcome = perform(&mut stream, &settings()).await.unwrap();
        assert!(matches!(outcome, Handshake::Complete(_)));
    }

    #[tokio::test]
    async fn test_gss_then_ssl_then_startup() {
        let mut gss = vec![0, 0, 0, 8];
        gss.extend_from_slice(&GSSENC_REQUEST_CODE.to_be_bytes());

        let mut stream = Builder::new()
            .read(&gss)
            .write(b"N")
            .read(&SSL_REQUEST)
            .write(b"N")
            .read(&startup_packet())
            .write(&expected_response())
            .build();

        let outcome = perform(&mut stream, &settings()).await.unwrap();
        assert!(matches!(outcome, Handshake::Complete(_)));
    }

    #[tokio::test]
    async fn test_repeated_ssl_request_is_framing_error() {
        let mut stream = Builder::new()
            .read(&SSL_REQUEST)
            .write(b"N")
            .read(&SSL_REQUEST)
            .build();

        match perform(&mut stream, &settings()).await {
            Err(SessionError::Framing(FramingError::UnexpectedNegotiation(SSL_REQUEST_CODE))) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_minimal_startup_packet() {
        // Length 8: only the protocol version follows.
        let mut stream = Builder::new()
            .read(&[0, 0, 0, 8, 0, 3, 0, 0])
            .write(&startup_response_bytes(&Settings::default()))
            .build();

        match perform(&mut stream, &Settings::default()).await.unwrap() {
            Handshake::Complete(params) => assert!(params.params.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_request_abandons() {
        let mut stream = Builder::new()
            .read(&[0, 0, 0, 16, 0x04, 0xd2, 0x16, 0x2e, 0, 0, 0, 1, 0, 0, 0, 2])
            .build();

        assert_eq!(
            perform(&mut stream, &Settings::default()).await.unwrap(),
            Handshake::Abandoned
        );
    }

    #[tokio::test]
    async fn test_disconnect_before_startup() {
        let mut stream = Builder::new().build();
        assert_eq!(
            perform(&mut stream, &Settings::default()).await.unwrap(),
            Handshake::Abandoned
        );
    }

    fn startup_response_bytes(settings: &Settings) -> Vec<u8> {
        let mut buf = bytes::BytesMut::new();
        for message in startup_response(settings) {
            message.encode(&mut buf);
        }
        buf.to_vec()
    }

    #[test]
    fn test_default_parameter_order() {
        let bytes = startup_response_bytes(&Settings::default());
        let mut expected = vec![0x52, 0, 0, 0, 8, 0, 0, 0, 0];
        expected.extend_from_slice(b"S\x00\x00\x00\x11TimeZone\x00UTC\x00");
        expected.extend_from_slice(b"S\x00\x00\x00\x17server_version\x000.0\x00");
        expected.extend_from_slice(&[0x5a, 0, 0, 0, 5, 0x49]);
        assert_eq!(bytes, expected);
    }
}
