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

//! Device connection abstraction
//!
//! A [`DeviceConnection`] is one peer exchange: an accepted TCP (or TLS)
//! stream, one received UDP datagram, or an in-memory byte array fed through
//! the engine by a test session. The session engine reads, writes and closes
//! through this type and only asks [`is_stream_oriented`] where the transports
//! genuinely differ.
//!
//! [`is_stream_oriented`]: DeviceConnection::is_stream_oriented

use crate::ConnectionId;
use bytes::{Bytes, BytesMut};
use metrics::counter;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

#[cfg(feature = "tls")]
use tokio_rustls::{TlsAcceptor, server::TlsStream};

/// Result of one bounded read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Bytes appended to the buffer
    Data(usize),
    /// No more input
    Eof,
    /// The deadline passed first
    TimedOut,
}

impl ReadStatus {
    fn from_count(count: usize) -> Self {
        if count == 0 {
            ReadStatus::Eof
        } else {
            ReadStatus::Data(count)
        }
    }
}

/// Where UDP replies for a datagram go out from
#[derive(Debug, Clone)]
pub struct DatagramReply {
    socket: Arc<UdpSocket>,
    from_listener: bool,
}

impl DatagramReply {
    /// `from_listener` selects the bound listening socket over an ephemeral one
    pub fn new(socket: Arc<UdpSocket>, from_listener: bool) -> Self {
        Self {
            socket,
            from_listener,
        }
    }

    async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.from_listener {
            self.socket.send_to(data, target).await
        } else {
            send_datagram(target, data).await
        }
    }
}

/// Send one datagram from a freshly bound ephemeral socket
pub async fn send_datagram(target: SocketAddr, data: &[u8]) -> io::Result<usize> {
    let local: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.send_to(data, target).await
}

enum Io {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
    Datagram {
        data: Bytes,
        reply: DatagramReply,
    },
    Memory {
        data: Bytes,
        sent: Vec<Bytes>,
    },
}

/// One peer exchange owned by a single session
pub struct DeviceConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    local_port: u16,
    io: Io,
    closer: CancellationToken,
    bytes_read: u64,
    bytes_written: u64,
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by server")
}

fn no_stream() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "datagram peers have no stream, use send_datagram",
    )
}

async fn read_stream<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    deadline: Option<Instant>,
    closer: &CancellationToken,
) -> io::Result<ReadStatus>
where
    S: AsyncRead + Unpin,
{
    let read = async {
        match deadline {
            Some(deadline) => match timeout_at(deadline, stream.read_buf(buffer)).await {
                Ok(result) => result.map(ReadStatus::from_count),
                Err(_) => Ok(ReadStatus::TimedOut),
            },
            None => stream.read_buf(buffer).await.map(ReadStatus::from_count),
        }
    };
    tokio::select! {
        _ = closer.cancelled() => Err(aborted()),
        status = read => status,
    }
}

async fn write_stream<S>(stream: &mut S, data: &[u8], closer: &CancellationToken) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(data).await?;
        stream.flush().await
    };
    tokio::select! {
        _ = closer.cancelled() => Err(aborted()),
        result = write => result,
    }
}

impl DeviceConnection {
    fn build(id: ConnectionId, peer_addr: SocketAddr, local_port: u16, io: Io) -> Self {
        Self {
            id,
            peer_addr,
            local_port,
            io,
            closer: CancellationToken::new(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Wrap an accepted TCP stream
    pub fn tcp(stream: TcpStream, id: ConnectionId) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_port = stream.local_addr()?.port();
        stream.set_nodelay(true)?;
        Ok(Self::build(id, peer_addr, local_port, Io::Tcp(stream)))
    }

    /// Complete a TLS handshake on an accepted TCP stream
    ///
    /// The handshake is abandoned when `closer` fires or `handshake_timeout`
    /// passes.
    #[cfg(feature = "tls")]
    pub async fn accept_tls(
        stream: TcpStream,
        acceptor: &TlsAcceptor,
        id: ConnectionId,
        closer: CancellationToken,
        handshake_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_port = stream.local_addr()?.port();
        let handshake = async move {
            match handshake_timeout {
                Some(limit) => tokio::time::timeout(limit, acceptor.accept(stream))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))?,
                None => acceptor.accept(stream).await,
            }
        };
        let tls = tokio::select! {
            _ = closer.cancelled() => return Err(aborted()),
            result = handshake => result?,
        };
        debug!(connection_id = %id, peer = %peer_addr, "TLS handshake complete");
        Ok(Self::build(id, peer_addr, local_port, Io::Tls(Box::new(tls))).with_close_handle(closer))
    }

    /// Wrap one received datagram
    pub fn datagram(
        id: ConnectionId,
        data: Bytes,
        peer_addr: SocketAddr,
        local_port: u16,
        reply: DatagramReply,
    ) -> Self {
        Self::build(id, peer_addr, local_port, Io::Datagram { data, reply })
    }

    /// In-memory connection with datagram semantics
    ///
    /// Everything the session sends is captured and returned by
    /// [`take_sent`](Self::take_sent).
    pub fn memory(id: ConnectionId, data: Bytes) -> Self {
        let peer_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        Self::build(
            id,
            peer_addr,
            0,
            Io::Memory {
                data,
                sent: Vec::new(),
            },
        )
    }

    /// Replace the close handle, used when the handle had to exist first
    pub fn with_close_handle(mut self, closer: CancellationToken) -> Self {
        self.closer = closer;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_addr.port()
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// `true` for TCP and TLS
    pub fn is_stream_oriented(&self) -> bool {
        match self.io {
            Io::Tcp(_) => true,
            #[cfg(feature = "tls")]
            Io::Tls(_) => true,
            Io::Datagram { .. } | Io::Memory { .. } => false,
        }
    }

    /// Bytes still buffered in a datagram, always `0` for streams
    pub fn available(&self) -> usize {
        match &self.io {
            Io::Datagram { data, .. } | Io::Memory { data, .. } => data.len(),
            _ => 0,
        }
    }

    /// Handle that closes this connection from another task
    ///
    /// Cancelling it makes every pending and future read or write fail with
    /// `ConnectionAborted`.
    pub fn close_handle(&self) -> CancellationToken {
        self.closer.clone()
    }

    /// `true` once the close handle fired
    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Append the next chunk of input to `buffer`
    ///
    /// Blocks until data arrives, the input ends or `deadline` passes. A
    /// datagram hands over its whole payload on the first call.
    pub async fn read_into(
        &mut self,
        buffer: &mut BytesMut,
        deadline: Option<Instant>,
    ) -> io::Result<ReadStatus> {
        let status = match &mut self.io {
            Io::Tcp(stream) => read_stream(stream, buffer, deadline, &self.closer).await?,
            #[cfg(feature = "tls")]
            Io::Tls(stream) => read_stream(stream.as_mut(), buffer, deadline, &self.closer).await?,
            Io::Datagram { data, .. } | Io::Memory { data, .. } => {
                if self.closer.is_cancelled() {
                    return Err(aborted());
                }
                if data.is_empty() {
                    ReadStatus::Eof
                } else {
                    buffer.extend_from_slice(data);
                    let count = data.len();
                    *data = Bytes::new();
                    ReadStatus::Data(count)
                }
            }
        };
        if let ReadStatus::Data(count) = status {
            self.bytes_read += count as u64;
            counter!("trackwire.bytes.received").increment(count as u64);
            trace!(connection_id = %self.id, bytes = count, "Read");
        }
        Ok(status)
    }

    /// Write to a stream transport
    ///
    /// Datagram peers fail with `Unsupported`; replies to them go through
    /// [`send_datagram`](Self::send_datagram).
    #[instrument(level = "debug", skip(self, data), fields(connection_id = %self.id, bytes = data.len()))]
    pub async fn write_stream(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.io {
            Io::Tcp(stream) => write_stream(stream, data, &self.closer).await?,
            #[cfg(feature = "tls")]
            Io::Tls(stream) => write_stream(stream.as_mut(), data, &self.closer).await?,
            Io::Datagram { .. } | Io::Memory { .. } => return Err(no_stream()),
        }
        self.bytes_written += data.len() as u64;
        counter!("trackwire.bytes.sent").increment(data.len() as u64);
        Ok(())
    }

    /// Send a datagram to the peer's address on `port`
    #[instrument(level = "debug", skip(self, data), fields(connection_id = %self.id, bytes = data.len()))]
    pub async fn send_datagram(&mut self, data: &[u8], port: u16) -> io::Result<()> {
        if self.closer.is_cancelled() {
            return Err(aborted());
        }
        let target = SocketAddr::new(self.peer_addr.ip(), port);
        match &mut self.io {
            Io::Datagram { reply, .. } => {
                tokio::select! {
                    _ = self.closer.cancelled() => return Err(aborted()),
                    result = reply.send_to(data, target) => { result?; }
                }
            }
            Io::Memory { sent, .. } => sent.push(Bytes::copy_from_slice(data)),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "stream peers take replies through write_stream",
                ));
            }
        }
        self.bytes_written += data.len() as u64;
        counter!("trackwire.bytes.sent").increment(data.len() as u64);
        trace!(%target, "Datagram sent");
        Ok(())
    }

    /// Flush and shut down a stream transport
    ///
    /// `linger` bounds how long the flush and shutdown may take. Past it the
    /// socket is dropped as is and the kernel deals with the send queue.
    /// Datagram exchanges share the listening socket, so nothing is closed.
    pub async fn close(&mut self, linger: Option<Duration>) -> io::Result<()> {
        let result = match &mut self.io {
            Io::Tcp(stream) => shutdown_stream(stream, linger, &self.closer).await,
            #[cfg(feature = "tls")]
            Io::Tls(stream) => shutdown_stream(stream.as_mut(), linger, &self.closer).await,
            Io::Datagram { .. } | Io::Memory { .. } => Ok(()),
        };
        debug!(connection_id = %self.id, "Connection closed");
        result
    }

    /// Drain the bytes captured by an in-memory connection
    pub fn take_sent(&mut self) -> Vec<Bytes> {
        match &mut self.io {
            Io::Memory { sent, .. } => std::mem::take(sent),
            _ => Vec::new(),
        }
    }
}

async fn shutdown_stream<S>(
    stream: &mut S,
    linger: Option<Duration>,
    closer: &CancellationToken,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    if closer.is_cancelled() {
        return Ok(());
    }
    let shutdown = async {
        stream.flush().await?;
        stream.shutdown().await
    };
    let bounded = async {
        match linger {
            Some(linger) => timeout(linger, shutdown).await.unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "linger expired before the connection drained",
                ))
            }),
            None => shutdown.await,
        }
    };
    tokio::select! {
        _ = closer.cancelled() => Ok(()),
        result = bounded => result,
    }
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("local_port", &self.local_port)
            .field("stream", &self.is_stream_oriented())
            .field("available", &self.available())
            .field("bytes_read", &self.bytes_read)
            .field("bytes_written", &self.bytes_written)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (DeviceConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (DeviceConnection::tcp(server, ConnectionId::new(1)).unwrap(), client)
    }

    #[tokio::test]
    async fn test_tcp_read_write() {
        let (mut conn, mut client) = tcp_pair().await;
        assert!(conn.is_stream_oriented());
        assert_eq!(conn.available(), 0);
        assert_eq!(conn.local_port(), client.peer_addr().unwrap().port());

        client.write_all(b"ping").await.unwrap();
        let mut buffer = BytesMut::new();
        let status = conn.read_into(&mut buffer, None).await.unwrap();
        assert!(matches!(status, ReadStatus::Data(n) if n > 0));

        conn.write_stream(b"pong").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
        assert_eq!(conn.bytes_written(), 4);
    }

    #[tokio::test]
    async fn test_tcp_deadline() {
        let (mut conn, _client) = tcp_pair().await;
        let mut buffer = BytesMut::new();
        let deadline = Instant::now() + Duration::from_millis(50);
        let status = conn.read_into(&mut buffer, Some(deadline)).await.unwrap();
        assert_eq!(status, ReadStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_tcp_eof() {
        let (mut conn, client) = tcp_pair().await;
        drop(client);
        let mut buffer = BytesMut::new();
        assert_eq!(conn.read_into(&mut buffer, None).await.unwrap(), ReadStatus::Eof);
    }

    #[tokio::test]
    async fn test_close_delivers_output_without_waiting_for_linger() {
        let (mut conn, mut client) = tcp_pair().await;
        conn.write_stream(b"BYE\r\n").await.unwrap();

        let closing = conn.close(Some(Duration::from_secs(4)));
        tokio::time::timeout(Duration::from_secs(1), closing)
            .await
            .expect("close waited for the linger")
            .unwrap();
        drop(conn);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"BYE\r\n");
    }

    #[tokio::test]
    async fn test_close_after_close_handle_is_immediate() {
        let (mut conn, _client) = tcp_pair().await;
        conn.close_handle().cancel();
        conn.close(Some(Duration::from_secs(4))).await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_handle_aborts_read() {
        let (mut conn, _client) = tcp_pair().await;
        let closer = conn.close_handle();
        let reader = tokio::spawn(async move {
            let mut buffer = BytesMut::new();
            conn.read_into(&mut buffer, None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.cancel();
        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_memory_has_datagram_semantics() {
        let mut conn = DeviceConnection::memory(ConnectionId::new(9), Bytes::from_static(b"abc"));
        assert!(!conn.is_stream_oriented());
        assert_eq!(conn.available(), 3);

        let mut buffer = BytesMut::new();
        assert_eq!(conn.read_into(&mut buffer, None).await.unwrap(), ReadStatus::Data(3));
        assert_eq!(conn.available(), 0);
        assert_eq!(conn.read_into(&mut buffer, None).await.unwrap(), ReadStatus::Eof);

        assert_eq!(conn.write_stream(b"x").await.unwrap_err().kind(), io::ErrorKind::Unsupported);
        conn.send_datagram(b"ack", 0).await.unwrap();
        assert_eq!(conn.take_sent(), vec![Bytes::from_static(b"ack")]);
        assert_eq!(conn.bytes_read(), 3);
        assert_eq!(conn.bytes_written(), 3);
    }

    #[tokio::test]
    async fn test_datagram_reply_uses_listener_socket() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();
        let server_port = server.local_addr().unwrap().port();

        let mut conn = DeviceConnection::datagram(
            ConnectionId::new(2),
            Bytes::from_static(b"$POS"),
            device_addr,
            server_port,
            DatagramReply::new(server.clone(), true),
        );
        conn.send_datagram(b"ACK", device_addr.port()).await.unwrap();

        let mut reply = [0u8; 16];
        let (n, from) = device.recv_from(&mut reply).await.unwrap();
        assert_eq!(&reply[..n], b"ACK");
        assert_eq!(from.port(), server_port);
    }

    #[tokio::test]
    async fn test_datagram_reply_from_ephemeral_socket() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();
        let server_port = server.local_addr().unwrap().port();

        let mut conn = DeviceConnection::datagram(
            ConnectionId::new(3),
            Bytes::new(),
            device_addr,
            server_port,
            DatagramReply::new(server, false),
        );
        conn.send_datagram(b"ACK", device_addr.port()).await.unwrap();

        let mut reply = [0u8; 16];
        let (_, from) = device.recv_from(&mut reply).await.unwrap();
        assert_ne!(from.port(), server_port);
    }
}
