//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Socket server
//!
//! [`SocketServer`] owns one listening socket. Its accept loop (TCP and TLS)
//! or receive loop (UDP) only ever waits on the socket; every connection or
//! datagram is handed to the worker pool and served there.

use crate::worker::{Assignment, WorkerPool};
use crate::{
    DatagramReply, DeviceConnection, HandlerFactory, ListenerConfig, PacketHandler, PacketListener,
    Result, ServerMetrics, ServerSnapshot, ServiceError, SessionEngine, SharedHandler,
    TestSessionReport, Transport,
};
use bytes::Bytes;
use metrics::counter;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

#[cfg(feature = "tls")]
use tokio_rustls::TlsAcceptor;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long `shutdown()` waits for the accept loop to stop
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

enum Listener {
    Stream(TcpListener),
    Datagram(Arc<UdpSocket>),
}

/// Turns accepted TCP streams into worker assignments
#[derive(Clone, Default)]
struct StreamSetup {
    #[cfg(feature = "tls")]
    acceptor: Option<TlsAcceptor>,
}

impl StreamSetup {
    #[cfg(feature = "tls")]
    fn assignment(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        id: crate::ConnectionId,
    ) -> io::Result<Assignment> {
        match &self.acceptor {
            Some(acceptor) => Ok(Assignment::tls(id, peer, stream, acceptor.clone())),
            None => Ok(Assignment::ready(DeviceConnection::tcp(stream, id)?)),
        }
    }

    #[cfg(not(feature = "tls"))]
    fn assignment(
        &self,
        stream: TcpStream,
        _peer: SocketAddr,
        id: crate::ConnectionId,
    ) -> io::Result<Assignment> {
        Ok(Assignment::ready(DeviceConnection::tcp(stream, id)?))
    }
}

/// Device communication listener
///
/// # Example
///
/// ```no_run
/// use bytes::Bytes;
/// use std::sync::Arc;
/// use trackwire_service::{CallbackHandler, ListenerConfig, SocketServer};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut server = SocketServer::bind(ListenerConfig::new(31000)).await?;
///     server.set_shared_handler(CallbackHandler {
///         on_packet: Some(Arc::new(|_: &[u8]| Some(Bytes::from_static(b"OK\n")))),
///         keep_alive: true,
///         ..Default::default()
///     });
///     server.start().await?;
///
///     tokio::signal::ctrl_c().await?;
///     server.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct SocketServer {
    /// Frozen listener configuration
    config: Arc<ListenerConfig>,
    /// Actual bound address
    local_addr: SocketAddr,
    /// Listening socket until the accept loop takes it
    listener: Mutex<Option<Listener>>,
    /// TLS setup for accepted streams
    setup: StreamSetup,
    /// Creates one handler per session
    factory: Option<Arc<dyn HandlerFactory>>,
    /// Passive packet observers
    listeners: Vec<Arc<dyn PacketListener>>,
    /// Listener metrics
    metrics: Arc<ServerMetrics>,
    /// Bind time
    started_at: Instant,
    /// Running flag
    running: AtomicBool,
    /// Ends the accept loop
    shutdown: CancellationToken,
    /// Accept loop task handle
    accept_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    /// Worker pool, created by `start()`
    pool: OnceLock<Arc<WorkerPool>>,
}

impl SocketServer {
    /// Validate `config` and bind its listening socket
    ///
    /// Nothing is accepted until [`start`](Self::start) is called. The TLS
    /// transport needs [`bind_tls`](Self::bind_tls) instead.
    pub async fn bind(config: ListenerConfig) -> Result<Self> {
        if config.transport == Transport::Tls {
            return Err(ServiceError::TlsAcceptorRequired);
        }
        Self::bind_with(config, StreamSetup::default()).await
    }

    /// Bind a TLS listener, handshakes run on the session workers
    #[cfg(feature = "tls")]
    pub async fn bind_tls(config: ListenerConfig, acceptor: TlsAcceptor) -> Result<Self> {
        let config = config.with_transport(Transport::Tls);
        Self::bind_with(
            config,
            StreamSetup {
                acceptor: Some(acceptor),
            },
        )
        .await
    }

    async fn bind_with(config: ListenerConfig, setup: StreamSetup) -> Result<Self> {
        config.validate()?;
        let addr = config.socket_addr();
        let (listener, local_addr) = if config.transport.is_stream() {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            socket.bind(addr)?;
            let listener = socket.listen(config.backlog)?;
            let local_addr = listener.local_addr()?;
            (Listener::Stream(listener), local_addr)
        } else {
            let socket = UdpSocket::bind(addr).await?;
            let local_addr = socket.local_addr()?;
            (Listener::Datagram(Arc::new(socket)), local_addr)
        };
        info!(
            transport = %config.transport,
            %local_addr,
            text = config.is_text(),
            "Listener bound"
        );

        Ok(Self {
            config: Arc::new(config),
            local_addr,
            listener: Mutex::new(Some(listener)),
            setup,
            factory: None,
            listeners: Vec::new(),
            metrics: Arc::new(ServerMetrics::new()),
            started_at: Instant::now(),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            accept_handle: tokio::sync::Mutex::new(None),
            pool: OnceLock::new(),
        })
    }

    /// Register the factory that creates one packet handler per session
    ///
    /// Takes effect on the next [`start`](Self::start) or test session.
    pub fn set_packet_handler(&mut self, factory: impl HandlerFactory) {
        self.factory = Some(Arc::new(factory));
    }

    /// Serve every session with a clone of `handler`
    pub fn set_shared_handler<H>(&mut self, handler: H)
    where
        H: PacketHandler + Clone + Sync,
    {
        self.set_packet_handler(SharedHandler::new(handler));
    }

    /// Add a passive observer that sees every packet before the handler
    pub fn add_packet_listener(&mut self, listener: impl PacketListener) {
        self.listeners.push(Arc::new(listener));
    }

    fn engine(&self) -> Result<SessionEngine> {
        let factory = self.factory.clone().ok_or(ServiceError::NoPacketHandler)?;
        Ok(SessionEngine::new(
            self.config.clone(),
            factory,
            self.listeners.clone(),
            self.metrics.clone(),
        ))
    }

    /// Start accepting connections or datagrams
    ///
    /// A listener runs once; after [`shutdown`](Self::shutdown) its socket is
    /// gone and `start()` fails with [`ServiceError::ListenerClosed`].
    pub async fn start(&self) -> Result<()> {
        let engine = Arc::new(self.engine()?);
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyRunning);
        }
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listener) = listener else {
            self.running.store(false, Ordering::SeqCst);
            return Err(ServiceError::ListenerClosed);
        };

        let pool = Arc::new(WorkerPool::new(engine));
        let _ = self.pool.set(pool.clone());

        info!(
            "Started {} server on port {}",
            self.config.transport,
            self.local_addr.port()
        );
        let span = info_span!(
            "listener",
            transport = %self.config.transport,
            port = self.local_addr.port()
        );
        let shutdown = self.shutdown.clone();
        let handle = match listener {
            Listener::Stream(listener) => tokio::spawn(
                accept_loop(listener, pool, self.setup.clone(), shutdown).instrument(span),
            ),
            Listener::Datagram(socket) => {
                tokio::spawn(receive_loop(socket, pool, shutdown).instrument(span))
            }
        };
        *self.accept_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the listener and close every open connection
    ///
    /// Does not wait for in-flight handler calls; each session ends on its
    /// own once its connection fails and still runs its end hook.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ServiceError::NotRunning);
        }
        info!(
            "Shutdown {} server on port {}",
            self.config.transport,
            self.local_addr.port()
        );
        self.shutdown.cancel();

        if let Some(handle) = self.accept_handle.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("Accept loop did not stop in time");
            }
        }

        let closed = self.pool.get().map_or(0, |pool| pool.close_all());
        info!(closed, "Listener shutdown complete");
        Ok(())
    }

    /// Run `data` through the full framing and dispatch pipeline
    ///
    /// No socket is involved; the bytes behave like one datagram from the
    /// loopback address. Works whether or not the listener is running.
    pub async fn test_session(&self, data: impl Into<Bytes>) -> Result<TestSessionReport> {
        let engine = match self.pool.get() {
            Some(pool) => pool.engine().clone(),
            None => Arc::new(self.engine()?),
        };
        Ok(engine.test_session(data).await)
    }

    /// Check if the server is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Actual bound address, with the assigned port when bound to port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Workers in the pool
    pub fn worker_count(&self) -> usize {
        self.pool.get().map_or(0, |pool| pool.worker_count())
    }

    /// Workers currently serving a connection
    pub fn active_sessions(&self) -> usize {
        self.pool.get().map_or(0, |pool| pool.active_sessions())
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Get a snapshot of the listener state
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            local_addr: self.local_addr,
            transport: self.config.transport,
            running: self.is_running(),
            workers: self.worker_count(),
            active_sessions: self.active_sessions(),
            total_sessions: self.metrics.total_sessions(),
            uptime: self.started_at.elapsed(),
            started_at: self.started_at,
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    pool: Arc<WorkerPool>,
    setup: StreamSetup,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => result,
        };
        match accepted {
            Ok((stream, peer)) => {
                let id = pool.engine().next_connection_id();
                debug!(connection_id = %id, %peer, "Accepted connection");
                match setup.assignment(stream, peer, id) {
                    Ok(assignment) => {
                        pool.dispatch(assignment);
                    }
                    Err(err) => {
                        warn!(%peer, error = %err, "Failed to set up connection");
                        pool.engine().metrics().accept_error();
                        counter!("trackwire.errors.accept").increment(1);
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "Failed to accept connection");
                pool.engine().metrics().accept_error();
                counter!("trackwire.errors.accept").increment(1);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    info!("Accept loop terminated");
}

async fn receive_loop(socket: Arc<UdpSocket>, pool: Arc<WorkerPool>, shutdown: CancellationToken) {
    let config = pool.engine().config().clone();
    let local_port = socket.local_addr().map_or(config.port, |addr| addr.port());
    let reply = DatagramReply::new(socket.clone(), config.udp_reply_from_listener);
    let mut buffer = vec![0u8; config.datagram_buffer_len()];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buffer) => result,
        };
        match received {
            Ok((len, peer)) => {
                let id = pool.engine().next_connection_id();
                trace!(connection_id = %id, %peer, bytes = len, "Datagram received");
                let connection = DeviceConnection::datagram(
                    id,
                    Bytes::copy_from_slice(&buffer[..len]),
                    peer,
                    local_port,
                    reply.clone(),
                );
                pool.assign(connection);
            }
            Err(err) => {
                // ICMP unreachable from an earlier reply surfaces here on some platforms.
                warn!(error = %err, "Failed to receive datagram");
                pool.engine().metrics().accept_error();
                counter!("trackwire.errors.accept").increment(1);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    info!("Receive loop terminated");
}

impl std::fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketServer")
            .field("transport", &self.config.transport)
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .field("workers", &self.worker_count())
            .field("uptime", &self.started_at.elapsed())
            .finish()
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!("SocketServer dropped while still running");
            self.running.store(false, Ordering::SeqCst);
            self.shutdown.cancel();
            if let Some(pool) = self.pool.get() {
                pool.close_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CallbackHandler;

    fn echo() -> CallbackHandler {
        CallbackHandler {
            on_packet: Some(Arc::new(|packet: &[u8]| Some(Bytes::copy_from_slice(packet)))),
            keep_alive: true,
            ..Default::default()
        }
    }

    fn loopback() -> ListenerConfig {
        ListenerConfig::new(0).with_bind_address([127, 0, 0, 1].into())
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let mut server = SocketServer::bind(loopback()).await.unwrap();
        server.set_shared_handler(echo());
        assert!(!server.is_running());
        assert_ne!(server.local_addr().port(), 0);

        server.start().await.unwrap();
        assert!(server.is_running());

        server.shutdown().await.unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_start_requires_handler() {
        let server = SocketServer::bind(loopback()).await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(ServiceError::NoPacketHandler)
        ));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_server_double_start() {
        let mut server = SocketServer::bind(loopback()).await.unwrap();
        server.set_shared_handler(echo());
        server.start().await.unwrap();

        assert!(matches!(
            server.start().await,
            Err(ServiceError::AlreadyRunning)
        ));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_shutdown_fails() {
        let mut server = SocketServer::bind(loopback()).await.unwrap();
        server.set_shared_handler(echo());
        server.start().await.unwrap();
        server.shutdown().await.unwrap();

        assert!(matches!(
            server.shutdown().await,
            Err(ServiceError::NotRunning)
        ));
        assert!(matches!(
            server.start().await,
            Err(ServiceError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_config() {
        let result = SocketServer::bind(loopback().with_backlog(0)).await;
        assert!(matches!(result, Err(ServiceError::InvalidConfig(_))));

        let result = SocketServer::bind(loopback().with_transport(Transport::Tls)).await;
        assert!(matches!(result, Err(ServiceError::TlsAcceptorRequired)));
    }

    #[tokio::test]
    async fn test_session_without_start() {
        let mut server = SocketServer::bind(loopback()).await.unwrap();
        assert!(matches!(
            server.test_session(&b"X\n"[..]).await,
            Err(ServiceError::NoPacketHandler)
        ));

        server.set_shared_handler(echo());
        let report = server.test_session(&b"PING\n"[..]).await.unwrap();
        assert_eq!(report.responses, vec![Bytes::from_static(b"PING")]);
        assert_eq!(server.metrics().total_sessions(), 1);
    }

    #[tokio::test]
    async fn test_server_snapshot() {
        let server = SocketServer::bind(loopback().with_transport(Transport::Udp))
            .await
            .unwrap();
        let snapshot = server.snapshot();

        assert_eq!(snapshot.transport, Transport::Udp);
        assert_eq!(snapshot.workers, 0);
        assert_eq!(snapshot.active_sessions, 0);
        assert_eq!(snapshot.total_sessions, 0);
        assert!(!snapshot.running);
        assert!(snapshot.to_string().contains("UDP"));
    }
}
