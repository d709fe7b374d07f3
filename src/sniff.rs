use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::PeekableStream;
use crate::socks::{self, HandshakeError, SOCKS_VERSION};

/// Wire protocol detected on a fresh connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// SOCKS5 handshake completed, HTTP expected next
    Socks5,
    /// Anything else, handed to the HTTP server untouched
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Socks5 => f.write_str("socks5"),
            Protocol::Http => f.write_str("http"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SniffError {
    #[error("peek error: {0}")]
    Peek(#[source] std::io::Error),

    #[error("SOCKS5 handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
}

impl SniffError {
    /// Client went away before sending its first byte
    pub fn is_eof(&self) -> bool {
        matches!(self, SniffError::Peek(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Classify a connection by its first byte and unwrap SOCKS5 if present.
///
/// On success the returned stream is positioned at the first byte of the
/// HTTP request. On error the stream has been dropped, which closes it.
pub async fn classify_and_unwrap<S>(
    mut stream: PeekableStream<S>,
) -> Result<(PeekableStream<S>, Protocol), SniffError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = stream.peek(1).await.map_err(SniffError::Peek)?[0];

    if first != SOCKS_VERSION {
        return Ok((stream, Protocol::Http));
    }

    socks::handshake(&mut stream).await?;
    Ok((stream, Protocol::Socks5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::SUCCESS_REPLY;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn plain_http_is_forwarded_byte_for_byte() {
        let request: &[u8] = b"GET /foo?x=1 HTTP/1.1\r\nHost: idev\r\n\r\n";
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();

        let (mut stream, protocol) = classify_and_unwrap(PeekableStream::new(server))
            .await
            .unwrap();
        assert_eq!(protocol, Protocol::Http);

        let mut forwarded = Vec::new();
        stream.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, request);
    }

    #[tokio::test]
    async fn non_ascii_first_byte_is_still_http() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0x16, 0x03, 0x01]).await.unwrap();
        client.shutdown().await.unwrap();

        let (mut stream, protocol) = classify_and_unwrap(PeekableStream::new(server))
            .await
            .unwrap();
        assert_eq!(protocol, Protocol::Http);
        let mut forwarded = Vec::new();
        stream.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, [0x16, 0x03, 0x01]);
    }

    #[tokio::test]
    async fn socks5_is_unwrapped() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x03, 4, b'i', b'd', b'e', b'v', 0, 80])
            .await
            .unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        let (mut stream, protocol) = classify_and_unwrap(PeekableStream::new(server))
            .await
            .unwrap();
        assert_eq!(protocol, Protocol::Socks5);

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"GET / HTTP/1.1\r\n");

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[..2], &[0x05, 0x00]);
        assert_eq!(&replies[2..], &SUCCESS_REPLY);
    }

    #[tokio::test]
    async fn failed_handshake_closes_connection() {
        let (mut client, server) = tokio::io::duplex(256);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 0x03, 0x00, 0x01])
            .await
            .unwrap();

        let err = classify_and_unwrap(PeekableStream::new(server))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SniffError::Handshake(HandshakeError::UnsupportedCommand(3))
        ));

        // Method selection, then EOF because the server half was dropped
        let mut seen = Vec::new();
        client.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn silent_client_is_eof() {
        let (client, server) = tokio::io::duplex(16);
        drop(client);

        let err = classify_and_unwrap(PeekableStream::new(server))
            .await
            .unwrap_err();
        assert!(err.is_eof());
    }
}
