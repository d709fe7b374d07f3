//! Startup, reload and shutdown of the whole service.
//!
//! Shutdown runs in a fixed order: stop accepting on the real socket, close
//! the virtual listener, ask every open HTTP connection to finish its
//! current request, then wait for the connection gauge to reach zero or the
//! shutdown timeout to pass.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::connection::ClientStream;
use crate::dispatch::Dispatcher;
use crate::handler;
use crate::listener::{self, VirtualListener};
use crate::mapping::MappingError;
use crate::state::ServiceState;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_LOG_EVERY: u32 = 20;

/// Lifecycle events delivered to a running server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Re-read the mapping file
    Reload,
    /// Stop accepting and drain
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("initial mapping load failed: {0}")]
    InitialLoad(#[source] MappingError),

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{active} connection(s) still active after {timeout:?}")]
    ShutdownTimeout { active: usize, timeout: Duration },
}

pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ServiceState>,
}

impl ProxyServer {
    /// Bind the public socket and perform the initial mapping load.
    ///
    /// A failed initial load is fatal, unlike later reloads.
    pub async fn bind(mut config: ProxyConfig) -> Result<Self, ServerError> {
        let addr = config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        config.listen_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let state = Arc::new(ServiceState::new(Arc::new(config)));
        state
            .load_mappings()
            .await
            .map_err(ServerError::InitialLoad)?;

        Ok(Self { listener, state })
    }

    /// Address actually bound, with any ephemeral port resolved
    pub fn local_addr(&self) -> SocketAddr {
        self.state.listen_addr()
    }

    #[cfg(test)]
    pub fn state(&self) -> Arc<ServiceState> {
        Arc::clone(&self.state)
    }

    /// Serve until a [`Control::Shutdown`] arrives or `control` closes.
    pub async fn run(self, mut control: mpsc::Receiver<Control>) -> Result<(), ServerError> {
        let state = self.state;
        let (bridge, virtual_listener) = listener::channel(state.listen_addr());

        let stop_accepting = CancellationToken::new();
        let dispatcher = tokio::spawn(
            Dispatcher::new(
                self.listener,
                bridge.clone(),
                state.config.handshake_timeout,
            )
            .run(stop_accepting.clone()),
        );

        let finish_requests = CancellationToken::new();
        let http_server = tokio::spawn(serve_http(
            virtual_listener,
            Arc::clone(&state),
            finish_requests.clone(),
        ));

        loop {
            match control.recv().await {
                Some(Control::Reload) => state.reload_mappings().await,
                Some(Control::Shutdown) => {
                    info!("Shutdown signal received");
                    break;
                }
                None => {
                    info!("Control channel closed, shutting down");
                    break;
                }
            }
        }

        stop_accepting.cancel();
        if let Err(e) = dispatcher.await {
            warn!("Dispatcher task failed: {}", e);
        }
        bridge.close();
        if let Err(e) = http_server.await {
            warn!("HTTP server task failed: {}", e);
        }
        finish_requests.cancel();

        let result = drain(&state, state.config.shutdown_timeout, &mut control).await;
        if result.is_ok() {
            info!("Server shutdown complete");
        }
        result
    }
}

/// Accept classified connections and serve HTTP/1.1 on each
async fn serve_http(
    mut listener: VirtualListener<ClientStream>,
    state: Arc<ServiceState>,
    finish_requests: CancellationToken,
) {
    debug!("HTTP server accepting on virtual listener for {}", listener.addr());
    while let Ok(stream) = listener.accept().await {
        let mut guard = state.connections.enter();
        let state = Arc::clone(&state);
        let finish_requests = finish_requests.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc_state = Arc::clone(&state);
            let service = service_fn(move |req| handler::handle(req, Arc::clone(&svc_state)));

            let conn = http1::Builder::new()
                .title_case_headers(true)
                .serve_connection(io, service);
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = finish_requests.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(err) = result {
                if !err.is_incomplete_message() {
                    debug!("HTTP connection error: {}", err);
                }
            }

            guard.decrement();
        });
    }
    // Late submitters must see the listener as closed
    listener.close();
    debug!("HTTP server stopped accepting");
}

/// Wait for the connection gauge to reach zero, at most `timeout`.
///
/// Reload requests arriving meanwhile are still honored.
pub async fn drain(
    state: &ServiceState,
    timeout: Duration,
    control: &mut mpsc::Receiver<Control>,
) -> Result<(), ServerError> {
    let deadline = Instant::now() + timeout;
    let mut ticker = interval(DRAIN_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut control_open = true;
    let mut polls: u32 = 0;

    let active = state.connections.active_count();
    if active > 0 {
        info!("Waiting for {} connections to close...", active);
    }

    loop {
        let active = state.connections.active_count();
        if active == 0 {
            info!("All connections closed gracefully");
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!("Forced shutdown with {} connections still active", active);
            return Err(ServerError::ShutdownTimeout { active, timeout });
        }

        tokio::select! {
            _ = ticker.tick() => {
                polls += 1;
                if polls % DRAIN_LOG_EVERY == 0 {
                    info!("Still waiting for {} connections...", active);
                }
            }
            event = control.recv(), if control_open => match event {
                Some(Control::Reload) => {
                    if timeout_at(deadline, state.reload_mappings()).await.is_err() {
                        warn!("Reload still running at shutdown deadline, abandoned");
                    }
                }
                Some(Control::Shutdown) => debug!("Already shutting down"),
                None => control_open = false,
            },
        }
    }
}
