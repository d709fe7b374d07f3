//! Minimal SOCKS5 server handshake.
//!
//! Only enough of RFC 1928 is spoken to get a browser that was pointed at us
//! through a PAC `SOCKS5` rule to send its HTTP request over the same socket.
//! The CONNECT destination is parsed for framing and then ignored: nothing is
//! dialed and no data is tunneled.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// VER REP RSV ATYP BND.ADDR(0.0.0.0) BND.PORT(0)
pub const SUCCESS_REPLY: [u8; 10] = [
    SOCKS_VERSION,
    0x00,
    0x00,
    ATYP_IPV4,
    0x00,
    0x00,
    0x00,
    0x00,
    0x00,
    0x00,
];

/// Error type for the inbound SOCKS5 handshake
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("{stage}: {source}")]
    Io {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),
}

/// Result type for handshake operations
pub type HandshakeResult<T> = Result<T, HandshakeError>;

trait IoStage<T> {
    fn stage(self, stage: &'static str) -> HandshakeResult<T>;
}

impl<T> IoStage<T> for std::io::Result<T> {
    fn stage(self, stage: &'static str) -> HandshakeResult<T> {
        self.map_err(|source| HandshakeError::Io { stage, source })
    }
}

/// Run the server side of a SOCKS5 handshake.
///
/// Always selects "no authentication" and always answers CONNECT with
/// [`SUCCESS_REPLY`]. On success the stream is positioned at the first byte
/// the client sends after the handshake.
pub async fn handshake<S>(stream: &mut S) -> HandshakeResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER NMETHODS METHODS...
    let mut header = [0u8; 2];
    stream
        .read_exact(&mut header)
        .await
        .stage("read greeting header")?;
    if header[0] != SOCKS_VERSION {
        return Err(HandshakeError::UnsupportedVersion(header[0]));
    }
    // Offered methods are not inspected
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await.stage("read methods")?;

    stream
        .write_all(&[SOCKS_VERSION, AUTH_NONE])
        .await
        .stage("write choice")?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut request = [0u8; 4];
    stream
        .read_exact(&mut request)
        .await
        .stage("read request header")?;
    let cmd = request[1];
    if cmd != CMD_CONNECT {
        return Err(HandshakeError::UnsupportedCommand(cmd));
    }

    let addr_len = match request[3] {
        ATYP_IPV4 => 4,
        ATYP_DOMAIN => stream.read_u8().await.stage("read domain length")? as usize,
        ATYP_IPV6 => 16,
        other => return Err(HandshakeError::UnsupportedAddressType(other)),
    };
    let mut addr = vec![0u8; addr_len];
    stream
        .read_exact(&mut addr)
        .await
        .stage("read destination address")?;
    stream
        .read_u16()
        .await
        .stage("read destination port")?;

    stream
        .write_all(&SUCCESS_REPLY)
        .await
        .stage("write reply")?;
    stream.flush().await.stage("write reply")?;

    Ok(())
}
