//! Accept loop on the real socket.
//!
//! Each accepted connection gets its own task which sniffs the first byte,
//! unwraps SOCKS5 if present and hands the stream to the virtual listener.
//! A slow or broken client only ever stalls its own task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ClientStream, PeekableStream};
use crate::listener::ConnectionBridge;
use crate::sniff::classify_and_unwrap;

pub struct Dispatcher {
    listener: TcpListener,
    bridge: ConnectionBridge<ClientStream>,
    handshake_timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(
        listener: TcpListener,
        bridge: ConnectionBridge<ClientStream>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            bridge,
            handshake_timeout,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Accept until `shutdown` fires or the virtual listener is closed.
    ///
    /// The real socket is dropped when this returns, so new connection
    /// attempts are refused from then on.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Dispatcher accepting on {:?}", self.listener.local_addr().ok());
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    debug!("[conn {}] accepted from {}", id, peer_addr);
                    tokio::spawn(dispatch_one(
                        id,
                        stream,
                        self.bridge.clone(),
                        self.handshake_timeout,
                    ));
                }
                Err(e) => {
                    if shutdown.is_cancelled() || self.bridge.is_closed() {
                        break;
                    }
                    warn!("Accept error: {} (continuing)", e);
                    continue;
                }
            }
        }
        info!("Dispatcher stopped accepting");
    }
}

async fn dispatch_one(
    id: u64,
    stream: TcpStream,
    bridge: ConnectionBridge<ClientStream>,
    handshake_timeout: Duration,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("[conn {}] set_nodelay failed: {}", id, e);
    }
    let stream = PeekableStream::new(stream);

    let (stream, protocol) = match timeout(handshake_timeout, classify_and_unwrap(stream)).await {
        Ok(Ok(classified)) => classified,
        Ok(Err(e)) if e.is_eof() => {
            debug!("[conn {}] closed before sending anything", id);
            return;
        }
        Ok(Err(e)) => {
            warn!("[conn {}] {}", id, e);
            return;
        }
        Err(_) => {
            warn!(
                "[conn {}] no request within {:?}, closing",
                id, handshake_timeout
            );
            return;
        }
    };

    debug!(
        "[conn {}] classified as {} ({} bytes buffered)",
        id,
        protocol,
        stream.buffered_len()
    );

    if !bridge.submit(stream).await {
        debug!("[conn {}] server closed, dropping connection", id);
    }
}
