//! In-process listener that feeds classified connections to the HTTP server.
//!
//! The dispatcher owns the real socket; once a connection has been sniffed
//! (and SOCKS5-unwrapped if needed) it is pushed through a
//! [`ConnectionBridge`] and surfaces from [`VirtualListener::accept`].
//! After [`close`](VirtualListener::close) no connection is ever delivered:
//! anything submitted late, or still queued, is dropped and therefore closed.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One slot: `submit` waits for the server to pick up the previous
/// connection, which is as close to a rendezvous as `mpsc` allows.
const HANDOFF_CAPACITY: usize = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ListenerError {
    #[error("listener closed")]
    Closed,
}

/// Build a connected bridge/listener pair reporting `addr` as its address
pub fn channel<C>(addr: SocketAddr) -> (ConnectionBridge<C>, VirtualListener<C>) {
    let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
    let closed = CancellationToken::new();
    (
        ConnectionBridge {
            tx,
            closed: closed.clone(),
        },
        VirtualListener { addr, rx, closed },
    )
}

/// Submitting half, cloned into every per-connection task
#[derive(Debug)]
pub struct ConnectionBridge<C> {
    tx: mpsc::Sender<C>,
    closed: CancellationToken,
}

impl<C> Clone for ConnectionBridge<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<C> ConnectionBridge<C> {
    /// Hand a connection to the HTTP server.
    ///
    /// Returns `false` if the listener was closed first; the connection has
    /// then been dropped here.
    pub async fn submit(&self, conn: C) -> bool {
        if self.closed.is_cancelled() {
            drop(conn);
            return false;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                drop(conn);
                false
            }
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(conn);
                    true
                }
                Err(_) => false,
            },
        }
    }

    /// Fire the closed signal; safe to call any number of times
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Accepting half, owned by the HTTP serve loop
#[derive(Debug)]
pub struct VirtualListener<C> {
    addr: SocketAddr,
    rx: mpsc::Receiver<C>,
    closed: CancellationToken,
}

impl<C> VirtualListener<C> {
    /// Wait for the next classified connection
    pub async fn accept(&mut self) -> Result<C, ListenerError> {
        if self.closed.is_cancelled() {
            self.discard_pending();
            return Err(ListenerError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                self.discard_pending();
                Err(ListenerError::Closed)
            }
            conn = self.rx.recv() => match conn {
                Some(conn) => Ok(conn),
                None => {
                    // Every bridge is gone, nothing can arrive anymore
                    self.closed.cancel();
                    Err(ListenerError::Closed)
                }
            },
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Address of the real socket behind the dispatcher
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn discard_pending(&mut self) {
        self.rx.close();
        while let Ok(conn) = self.rx.try_recv() {
            drop(conn);
        }
    }
}
